// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeSet, HashMap, HashSet};

use expression::{parse_entity_name_from_json, EntityName, Expr, NamedTarget};
use indexmap::IndexMap;
use serde_json::Value as Json;

/// Keys a rule description may use; everything else is a malformed rule.
const KNOWN_RULE_KEYS: &[&str] = &[
    "config_fields",
    "string_fields",
    "target_fields",
    "implicit",
    "anonymous",
    "config_vars",
    "tainted",
    "config_transitions",
    "expression",
    "doc",
    "field_doc",
    "config_doc",
];

/// Field names reserved for the target description itself.
const RESERVED_FIELD_NAMES: &[&str] = &["type", "arguments_config", "tainted"];

///
/// One anonymous-target definition of a rule: which target field supplies the providers,
/// which provider key holds the target nodes, and the rule map used to resolve abstract
/// node types.
///
#[derive(Clone, Debug)]
pub struct AnonymousDefinition {
    pub target: String,
    pub provider: String,
    pub rule_map: Expr,
}

///
/// A user-defined rule: its field declarations, implicit and anonymous dependencies,
/// configuration interface, taint, per-field configuration transitions, and defining
/// expression.
///
#[derive(Clone, Debug)]
pub struct UserRule {
    pub name: NamedTarget,
    pub config_fields: Vec<String>,
    pub string_fields: Vec<String>,
    pub target_fields: Vec<String>,
    pub implicit_targets: IndexMap<String, Vec<EntityName>>,
    pub anonymous_definitions: IndexMap<String, AnonymousDefinition>,
    pub config_vars: Vec<String>,
    pub tainted: BTreeSet<String>,
    pub config_transitions: HashMap<String, Expr>,
    pub expression: Expr,
}

fn string_list(desc: &serde_json::Map<String, Json>, key: &str) -> Result<Vec<String>, String> {
    match desc.get(key) {
        None => Ok(vec![]),
        Some(Json::Array(entries)) => entries
            .iter()
            .map(|entry| {
                entry
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| format!("Rule key {key:?} must be a list of strings"))
            })
            .collect(),
        Some(_) => Err(format!("Rule key {key:?} must be a list of strings")),
    }
}

impl UserRule {
    ///
    /// The fields a target using this rule may set, beyond the reserved ones.
    ///
    pub fn expected_fields(&self) -> HashSet<String> {
        self.config_fields
            .iter()
            .chain(self.string_fields.iter())
            .chain(self.target_fields.iter())
            .cloned()
            .collect()
    }

    ///
    /// The transition expression for a dependency-carrying field. Fields without an
    /// explicit transition get the identity transition `[{}]`.
    ///
    pub fn transition_for(&self, field: &str) -> Expr {
        self.config_transitions
            .get(field)
            .cloned()
            .unwrap_or_else(|| Expr::list(vec![Expr::empty_map()]))
    }

    pub fn from_json(name: NamedTarget, desc: &Json) -> Result<UserRule, String> {
        let desc = desc
            .as_object()
            .ok_or_else(|| "Rule description must be an object".to_string())?;
        for key in desc.keys() {
            if !KNOWN_RULE_KEYS.contains(&key.as_str()) {
                return Err(format!("Unknown key {key:?} in rule description"));
            }
        }

        let config_fields = string_list(desc, "config_fields")?;
        let string_fields = string_list(desc, "string_fields")?;
        let target_fields = string_list(desc, "target_fields")?;
        let config_vars = string_list(desc, "config_vars")?;
        let tainted: BTreeSet<String> = string_list(desc, "tainted")?.into_iter().collect();

        let mut implicit_targets: IndexMap<String, Vec<EntityName>> = IndexMap::new();
        if let Some(implicit) = desc.get("implicit") {
            let implicit = implicit
                .as_object()
                .ok_or_else(|| "Rule key \"implicit\" must be an object".to_string())?;
            for (field, targets) in implicit {
                let targets = targets.as_array().ok_or_else(|| {
                    format!("Implicit field {field:?} must be a list of target names")
                })?;
                let parsed: Result<Vec<EntityName>, String> = targets
                    .iter()
                    .map(|target| {
                        parse_entity_name_from_json(target, &name).map_err(|e| {
                            format!("Parsing implicit target in field {field:?} failed: {e}")
                        })
                    })
                    .collect();
                implicit_targets.insert(field.clone(), parsed?);
            }
        }

        let mut anonymous_definitions: IndexMap<String, AnonymousDefinition> = IndexMap::new();
        if let Some(anonymous) = desc.get("anonymous") {
            let anonymous = anonymous
                .as_object()
                .ok_or_else(|| "Rule key \"anonymous\" must be an object".to_string())?;
            for (field, definition) in anonymous {
                let definition = definition.as_object().ok_or_else(|| {
                    format!("Anonymous field {field:?} must be an object")
                })?;
                let target = definition
                    .get("target")
                    .and_then(Json::as_str)
                    .ok_or_else(|| {
                        format!("Anonymous field {field:?} lacks a \"target\" string")
                    })?;
                let provider = definition
                    .get("provider")
                    .and_then(Json::as_str)
                    .ok_or_else(|| {
                        format!("Anonymous field {field:?} lacks a \"provider\" string")
                    })?;
                // The rule map binds abstract node types to rule names, resolved
                // relative to this rule's module.
                let mut rule_map = expression::ExprMap::new();
                if let Some(mapping) = definition.get("rule_map") {
                    let mapping = mapping.as_object().ok_or_else(|| {
                        format!("Anonymous field {field:?} has a non-object \"rule_map\"")
                    })?;
                    for (node_type, rule_name) in mapping {
                        let parsed =
                            parse_entity_name_from_json(rule_name, &name).map_err(|e| {
                                format!(
                                    "Parsing rule name for node type {node_type:?} in \
                                     anonymous field {field:?} failed: {e}"
                                )
                            })?;
                        rule_map.insert(node_type.clone(), Expr::name(parsed));
                    }
                }
                let rule_map = Expr::map(rule_map);
                anonymous_definitions.insert(
                    field.clone(),
                    AnonymousDefinition {
                        target: target.to_string(),
                        provider: provider.to_string(),
                        rule_map,
                    },
                );
            }
        }

        // Field names must be unique across all declaration kinds and must not shadow the
        // reserved target-description keys.
        let mut seen: HashSet<&str> = HashSet::new();
        let all_fields = config_fields
            .iter()
            .chain(string_fields.iter())
            .chain(target_fields.iter())
            .chain(implicit_targets.keys())
            .chain(anonymous_definitions.keys());
        for field in all_fields {
            if RESERVED_FIELD_NAMES.contains(&field.as_str()) {
                return Err(format!("Rule field name {field:?} is reserved"));
            }
            if !seen.insert(field) {
                return Err(format!("Conflicting declarations of field {field:?}"));
            }
        }

        // Anonymous definitions must read providers from a declared dependency field.
        for (field, definition) in &anonymous_definitions {
            let known = target_fields.contains(&definition.target)
                || implicit_targets.contains_key(&definition.target);
            if !known {
                return Err(format!(
                    "Anonymous field {field:?} reads from unknown target field {:?}",
                    definition.target
                ));
            }
        }

        let mut config_transitions: HashMap<String, Expr> = HashMap::new();
        if let Some(transitions) = desc.get("config_transitions") {
            let transitions = transitions.as_object().ok_or_else(|| {
                "Rule key \"config_transitions\" must be an object".to_string()
            })?;
            for (field, expr) in transitions {
                let known = target_fields.contains(field)
                    || implicit_targets.contains_key(field)
                    || anonymous_definitions.contains_key(field);
                if !known {
                    return Err(format!(
                        "Config transition declared for unknown target field {field:?}"
                    ));
                }
                config_transitions.insert(field.clone(), Expr::from_json(expr));
            }
        }

        let expression = desc
            .get("expression")
            .map(Expr::from_json)
            .ok_or_else(|| "Rule description lacks an \"expression\"".to_string())?;

        Ok(UserRule {
            name,
            config_fields,
            string_fields,
            target_fields,
            implicit_targets,
            anonymous_definitions,
            config_vars,
            tainted,
            config_transitions,
            expression,
        })
    }
}
