// Copyright 2023 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use common::normalize_path;
use serde_json::{json, Value as Json};

use crate::{Expr, Value};

///
/// What a named entity refers to within its module: a defined target, a source file, or a
/// source directory lifted to a tree.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ReferenceKind {
    Target,
    File,
    Tree,
}

///
/// A name within a repository: `(repository, module, name)` plus what the name refers to.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NamedTarget {
    pub repository: String,
    pub module: String,
    pub name: String,
    pub reference: ReferenceKind,
}

impl NamedTarget {
    pub fn new(
        repository: impl Into<String>,
        module: &str,
        name: impl Into<String>,
        reference: ReferenceKind,
    ) -> NamedTarget {
        NamedTarget {
            repository: repository.into(),
            module: normalize_path(module),
            name: name.into(),
            reference,
        }
    }

    pub fn target(repository: &str, module: &str, name: &str) -> NamedTarget {
        NamedTarget::new(repository, module, name, ReferenceKind::Target)
    }
}

///
/// A target constructed at analysis time from a provider-supplied target node, paired with
/// the rule map used to resolve abstract node types.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct AnonymousTarget {
    pub rule_map: Expr,
    pub target_node: Expr,
}

///
/// The name of an analysable entity: either a named target in a repository or an anonymous
/// target lifted from a provider.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum EntityName {
    Named(NamedTarget),
    Anonymous(AnonymousTarget),
}

impl EntityName {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, EntityName::Anonymous(_))
    }

    pub fn as_named(&self) -> Option<&NamedTarget> {
        match self {
            EntityName::Named(named) => Some(named),
            EntityName::Anonymous(_) => None,
        }
    }

    pub fn as_anonymous(&self) -> Option<&AnonymousTarget> {
        match self {
            EntityName::Anonymous(anonymous) => Some(anonymous),
            EntityName::Named(_) => None,
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            EntityName::Named(named) => {
                let tag = match named.reference {
                    ReferenceKind::Target => "@",
                    ReferenceKind::File => "FILE",
                    ReferenceKind::Tree => "TREE",
                };
                json!([tag, named.repository, named.module, named.name])
            }
            EntityName::Anonymous(anonymous) => json!({
                "anonymous": {
                    "rule_map": anonymous.rule_map.to_hash().to_hex(),
                    "target_node": anonymous.target_node.to_hash().to_hex(),
                },
            }),
        }
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

///
/// Parses an entity name from an expression value, relative to the requesting target.
///
/// Accepted forms:
///  - `"name"`: a target in the requesting module
///  - `["./", "subdir", "name"]`: a target in a subdirectory of the requesting module
///  - `["FILE", null, "name"]`: a source file in the requesting module
///  - `["TREE", null, "name"]`: a source directory in the requesting module
///  - `["@", "repository", "module", "name"]`: a fully qualified target
///
pub fn parse_entity_name(expr: &Expr, current: &NamedTarget) -> Result<EntityName, String> {
    let interpret = || -> Option<EntityName> {
        match expr.value() {
            Value::String(name) => Some(EntityName::Named(NamedTarget::new(
                current.repository.clone(),
                &current.module,
                name.clone(),
                ReferenceKind::Target,
            ))),
            Value::Name(name) => Some(name.clone()),
            Value::List(entries) => match entries.as_slice() {
                [tag, second, name] => match tag.as_str()? {
                    "./" => Some(EntityName::Named(NamedTarget::new(
                        current.repository.clone(),
                        &format!("{}/{}", current.module, second.as_str()?),
                        name.as_str()?,
                        ReferenceKind::Target,
                    ))),
                    "FILE" if second.is_none() => Some(EntityName::Named(NamedTarget::new(
                        current.repository.clone(),
                        &current.module,
                        name.as_str()?,
                        ReferenceKind::File,
                    ))),
                    "TREE" if second.is_none() => Some(EntityName::Named(NamedTarget::new(
                        current.repository.clone(),
                        &current.module,
                        name.as_str()?,
                        ReferenceKind::Tree,
                    ))),
                    _ => None,
                },
                [tag, repository, module, name] if tag.as_str() == Some("@") => {
                    Some(EntityName::Named(NamedTarget::new(
                        repository.as_str()?,
                        module.as_str()?,
                        name.as_str()?,
                        ReferenceKind::Target,
                    )))
                }
                _ => None,
            },
            _ => None,
        }
    };
    interpret().ok_or_else(|| format!("Not a valid entity name: {expr}"))
}

///
/// As `parse_entity_name`, for names appearing in plain JSON (e.g. the `type` field of a
/// target description naming a user rule).
///
pub fn parse_entity_name_from_json(
    json: &Json,
    current: &NamedTarget,
) -> Result<EntityName, String> {
    parse_entity_name(&Expr::from_json(json), current)
}
