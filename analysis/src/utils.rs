// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeSet;

use common::{normalize_path, tree_conflict};
use expression::{evaluate, Configuration, Expr, ExprMap, FunctionMap};

use async_map::Failure;

///
/// Interprets an evaluated expression as a list of strings.
///
pub fn as_string_list(value: &Expr, what: &str) -> Result<Vec<String>, String> {
    let entries = value
        .as_list()
        .ok_or_else(|| format!("{what} must be a list of strings, but found {value}"))?;
    entries
        .iter()
        .map(|entry| {
            entry
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| format!("{what} must be a list of strings, but found {value}"))
        })
        .collect()
}

///
/// Interprets an evaluated transition expression: a list of configuration patches.
///
pub fn as_transition_list(value: &Expr, what: &str) -> Result<Vec<Expr>, String> {
    let entries = value
        .as_list()
        .ok_or_else(|| format!("{what} must be a list of maps, but found {value}"))?;
    for entry in entries {
        if !entry.is_map() {
            return Err(format!("{what} must be a list of maps, but found {value}"));
        }
    }
    Ok(entries.to_vec())
}

///
/// Checks that every value of the map is an artifact, and normalizes the staging paths.
/// Normalized paths must stay within the stage and must not conflict.
///
pub fn normalized_artifact_stage(map: &ExprMap, what: &str) -> Result<ExprMap, String> {
    let mut stage = ExprMap::new();
    for (path, artifact) in map.iter() {
        if !artifact.is_artifact() {
            return Err(format!(
                "{what} must map paths to artifacts, but found {artifact} for {path:?}"
            ));
        }
        let normalized = normalize_path(path);
        if normalized == ".." || normalized.starts_with("../") {
            return Err(format!("{what} path {path:?} escapes the stage"));
        }
        if let Some(existing) = stage.get(&normalized) {
            if existing != artifact {
                return Err(format!("{what} conflicts at {normalized:?}"));
            }
        }
        stage.insert(normalized, artifact.clone());
    }
    if let Some(conflict) = tree_conflict(stage.keys().map(String::as_str)) {
        return Err(format!("{what} conflicts on subtree {conflict:?}"));
    }
    Ok(stage)
}

///
/// The union of several artifact stages. Entries staging the same artifact twice are
/// fine; staging different content at one path (or below a staged path) is a conflict.
///
pub fn stage_union<'a>(
    stages: impl Iterator<Item = &'a Expr>,
    what: &str,
) -> Result<Expr, String> {
    let mut union = ExprMap::new();
    for stage in stages {
        let map = stage
            .as_map()
            .ok_or_else(|| format!("{what} must be a map of artifacts, but found {stage}"))?;
        for (path, artifact) in map.iter() {
            if let Some(existing) = union.get(path) {
                if existing != artifact {
                    return Err(format!("{what} conflicts at {path:?}"));
                }
            }
            union.insert(path.clone(), artifact.clone());
        }
    }
    if let Some(conflict) = tree_conflict(union.keys().map(String::as_str)) {
        return Err(format!("{what} conflicts on subtree {conflict:?}"));
    }
    Ok(Expr::map(union))
}

///
/// Evaluates the target's `tainted` expression and returns the resulting taint strings.
///
pub fn get_tainted(
    tainted_expr: &Expr,
    config: &Configuration,
) -> Result<BTreeSet<String>, Failure> {
    let value = evaluate(tainted_expr, config, &FunctionMap::new())
        .map_err(|e| Failure::fatal(e.to_string()).decorate("While evaluating tainted"))?;
    as_string_list(&value, "tainted")
        .map(|strings| strings.into_iter().collect())
        .map_err(Failure::fatal)
}
