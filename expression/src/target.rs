// Copyright 2023 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use serde_json::{json, Value as Json};

use crate::{Expr, JsonMode};

///
/// The value a target analysis produces: the artifacts it stages, its runfiles, and the
/// values it provides to dependents. Each of the three fields is a map expression.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct TargetResult {
    pub artifact_stage: Expr,
    pub provides: Expr,
    pub runfiles: Expr,
    pub is_cacheable: bool,
}

impl TargetResult {
    pub fn new(artifact_stage: Expr, provides: Expr, runfiles: Expr) -> TargetResult {
        let is_cacheable = artifact_stage.is_cacheable()
            && provides.is_cacheable()
            && runfiles.is_cacheable();
        TargetResult {
            artifact_stage,
            provides,
            runfiles,
            is_cacheable,
        }
    }

    pub fn to_json(&self) -> Json {
        json!({
            "artifact_stage": self.artifact_stage.to_json(JsonMode::SerializeAllButNodes),
            "runfiles": self.runfiles.to_json(JsonMode::SerializeAllButNodes),
            "provides": self.provides.to_json(JsonMode::SerializeAllButNodes),
        })
    }
}

///
/// An abstract target node: a node type plus its string and target fields, to be
/// instantiated against a rule map when lifted into an anonymous target.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct AbstractNode {
    pub node_type: String,
    pub string_fields: Expr,
    pub target_fields: Expr,
}

///
/// A target node value: either a fixed result or an abstract node.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum TargetNode {
    Value(Expr),
    Abstract(AbstractNode),
}

impl TargetNode {
    pub fn is_cacheable(&self) -> bool {
        match self {
            TargetNode::Value(result) => result.is_cacheable(),
            TargetNode::Abstract(abs) => {
                abs.string_fields.is_cacheable() && abs.target_fields.is_cacheable()
            }
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            TargetNode::Value(result) => json!({
                "type": "VALUE_NODE",
                "result": result.to_json(JsonMode::SerializeAllButNodes),
            }),
            TargetNode::Abstract(abs) => json!({
                "type": "ABSTRACT_NODE",
                "node_type": abs.node_type,
                "string_fields": abs.string_fields.to_json(JsonMode::SerializeAllButNodes),
                "target_fields": abs.target_fields.to_json(JsonMode::SerializeAllButNodes),
            }),
        }
    }
}
