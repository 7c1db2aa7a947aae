// Copyright 2023 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use crate::{Expr, ExprMap};

///
/// A configuration: an ordered map from variable names to expression values. Equality is
/// by content hash, so two configurations binding the same variables to the same values
/// are interchangeable as analysis keys.
///
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct Configuration {
    expr: Expr,
}

impl Configuration {
    pub fn new(expr: Expr) -> Result<Configuration, String> {
        if expr.is_map() {
            Ok(Configuration { expr })
        } else {
            Err(format!("Configuration must be a map, but found {expr}"))
        }
    }

    pub fn empty() -> Configuration {
        Configuration {
            expr: Expr::empty_map(),
        }
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    fn map(&self) -> &ExprMap {
        self.expr.as_map().expect("Configuration is always a map")
    }

    ///
    /// The value bound to the variable, or the `None` value if unbound.
    ///
    pub fn at(&self, var: &str) -> Expr {
        self.map().get(var).cloned().unwrap_or_else(Expr::none)
    }

    ///
    /// Whether the variable is bound (even to `None`): a transition that binds a variable
    /// fixes it for the dependency, whatever the value.
    ///
    pub fn is_fixed(&self, var: &str) -> bool {
        self.map().contains_key(var)
    }

    ///
    /// The restriction of this configuration to the given variables. Variables not bound
    /// here are bound to `None`, and the result binds the variables in sorted order, so
    /// two prunings to the same variable set always compare equal.
    ///
    pub fn prune<I, S>(&self, vars: I) -> Configuration
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names: Vec<String> = vars
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect();
        names.sort();
        names.dedup();
        let pruned: ExprMap = names
            .into_iter()
            .map(|name| {
                let value = self.at(&name);
                (name, value)
            })
            .collect();
        Configuration {
            expr: Expr::map(pruned),
        }
    }

    ///
    /// The configuration obtained by applying the patch: bindings in the patch win,
    /// existing keys keep their position, and new keys are appended in patch order.
    ///
    pub fn update(&self, patch: &Expr) -> Result<Configuration, String> {
        let patch_map = patch
            .as_map()
            .ok_or_else(|| format!("Configuration update must be a map, but found {patch}"))?;
        if patch_map.is_empty() {
            return Ok(self.clone());
        }
        let mut merged = self.map().clone();
        for (key, value) in patch_map.iter() {
            merged.insert(key.clone(), value.clone());
        }
        Ok(Configuration {
            expr: Expr::map(merged),
        })
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Configuration({})", self.expr)
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)
    }
}
