// Copyright 2023 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(clippy::all)]
// Subjective style.
#![allow(clippy::len_without_is_empty, clippy::redundant_field_names)]

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use common::ArtifactDescription;
use hashing::Fingerprint;
use indexmap::IndexMap;
use serde_json::{json, Map as JsonMap, Number, Value as Json};

mod configuration;
mod entity;
mod evaluator;
mod target;

pub use configuration::Configuration;
pub use entity::{
    parse_entity_name, parse_entity_name_from_json, AnonymousTarget, EntityName, NamedTarget,
    ReferenceKind,
};
pub use evaluator::{
    evaluate, is_true, literal_arg, EvalResult, EvaluationError, Evaluator, FunctionMap,
};
pub use target::{AbstractNode, TargetNode, TargetResult};

///
/// How non-plain-JSON values are rendered by `Expr::to_json`.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JsonMode {
    /// Serialise everything, including full target nodes.
    SerializeAll,
    /// Serialise everything, but render nodes as `{"type": "NODE", "id": <hash>}`.
    SerializeAllButNodes,
    /// Replace values with no JSON equivalent by null.
    NullForNonJson,
}

///
/// An insertion-ordered string-to-expression map. Iteration order is exactly the order in
/// which keys were first inserted.
///
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExprMap(IndexMap<String, Expr>);

impl ExprMap {
    pub fn new() -> ExprMap {
        ExprMap(IndexMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&Expr> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    ///
    /// Inserts the value under the key. An existing key keeps its original position.
    ///
    pub fn insert(&mut self, key: String, value: Expr) {
        self.0.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Expr)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &Expr> {
        self.0.values()
    }
}

impl FromIterator<(String, Expr)> for ExprMap {
    fn from_iter<T: IntoIterator<Item = (String, Expr)>>(iter: T) -> ExprMap {
        ExprMap(iter.into_iter().collect())
    }
}

///
/// The payload of an expression value.
///
#[derive(Clone, Debug)]
pub enum Value {
    None,
    Bool(bool),
    Number(Number),
    String(String),
    Artifact(ArtifactDescription),
    Result(TargetResult),
    Node(TargetNode),
    Name(EntityName),
    List(Vec<Expr>),
    Map(ExprMap),
}

struct Inner {
    value: Value,
    cacheable: bool,
    hash: OnceLock<Fingerprint>,
}

///
/// An immutable expression value with a lazily computed content hash. Cloning is cheap;
/// structurally equal values constructed independently compare equal and share a hash.
///
#[derive(Clone)]
pub struct Expr(Arc<Inner>);

impl Expr {
    fn from_value(value: Value) -> Expr {
        let cacheable = match &value {
            Value::Name(_) => false,
            Value::Result(r) => r.is_cacheable,
            Value::Node(n) => n.is_cacheable(),
            Value::List(entries) => entries.iter().all(Expr::is_cacheable),
            Value::Map(map) => map.values().all(Expr::is_cacheable),
            _ => true,
        };
        Expr(Arc::new(Inner {
            value,
            cacheable,
            hash: OnceLock::new(),
        }))
    }

    pub fn none() -> Expr {
        static NONE: OnceLock<Expr> = OnceLock::new();
        NONE.get_or_init(|| Expr::from_value(Value::None)).clone()
    }

    pub fn empty_list() -> Expr {
        static EMPTY: OnceLock<Expr> = OnceLock::new();
        EMPTY
            .get_or_init(|| Expr::from_value(Value::List(vec![])))
            .clone()
    }

    pub fn empty_map() -> Expr {
        static EMPTY: OnceLock<Expr> = OnceLock::new();
        EMPTY
            .get_or_init(|| Expr::from_value(Value::Map(ExprMap::new())))
            .clone()
    }

    pub fn bool(b: bool) -> Expr {
        Expr::from_value(Value::Bool(b))
    }

    pub fn number(n: Number) -> Expr {
        Expr::from_value(Value::Number(n))
    }

    pub fn integer(i: i64) -> Expr {
        Expr::from_value(Value::Number(Number::from(i)))
    }

    pub fn string(s: impl Into<String>) -> Expr {
        Expr::from_value(Value::String(s.into()))
    }

    pub fn artifact(a: ArtifactDescription) -> Expr {
        Expr::from_value(Value::Artifact(a))
    }

    pub fn result(r: TargetResult) -> Expr {
        Expr::from_value(Value::Result(r))
    }

    pub fn node(n: TargetNode) -> Expr {
        Expr::from_value(Value::Node(n))
    }

    pub fn name(n: EntityName) -> Expr {
        Expr::from_value(Value::Name(n))
    }

    pub fn list(entries: Vec<Expr>) -> Expr {
        Expr::from_value(Value::List(entries))
    }

    pub fn map(map: ExprMap) -> Expr {
        Expr::from_value(Value::Map(map))
    }

    pub fn value(&self) -> &Value {
        &self.0.value
    }

    pub fn is_none(&self) -> bool {
        matches!(self.0.value, Value::None)
    }

    pub fn is_string(&self) -> bool {
        matches!(self.0.value, Value::String(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self.0.value, Value::List(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self.0.value, Value::Map(_))
    }

    pub fn is_artifact(&self) -> bool {
        matches!(self.0.value, Value::Artifact(_))
    }

    pub fn is_result(&self) -> bool {
        matches!(self.0.value, Value::Result(_))
    }

    pub fn is_node(&self) -> bool {
        matches!(self.0.value, Value::Node(_))
    }

    pub fn is_name(&self) -> bool {
        matches!(self.0.value, Value::Name(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &self.0.value {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<&Number> {
        match &self.0.value {
            Value::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.0.value {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Expr]> {
        match &self.0.value {
            Value::List(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ExprMap> {
        match &self.0.value {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_artifact(&self) -> Option<&ArtifactDescription> {
        match &self.0.value {
            Value::Artifact(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_result(&self) -> Option<&TargetResult> {
        match &self.0.value {
            Value::Result(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&TargetNode> {
        match &self.0.value {
            Value::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&EntityName> {
        match &self.0.value {
            Value::Name(n) => Some(n),
            _ => None,
        }
    }

    /// A short name for the value's tag, for error messages.
    pub fn type_string(&self) -> &'static str {
        match &self.0.value {
            Value::None => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Artifact(_) => "artifact",
            Value::Result(_) => "result",
            Value::Node(_) => "node",
            Value::Name(_) => "name",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    ///
    /// Whether this value may be serialised into a cache entry. Names are never cacheable,
    /// results carry their own flag, and containers are cacheable iff all members are.
    ///
    pub fn is_cacheable(&self) -> bool {
        self.0.cacheable
    }

    ///
    /// The content hash of this value. Computed once on first use; concurrent callers
    /// observe the same finished value. The hash of structurally equal values is equal
    /// regardless of how they were constructed.
    ///
    pub fn to_hash(&self) -> Fingerprint {
        *self.0.hash.get_or_init(|| self.compute_hash())
    }

    fn compute_hash(&self) -> Fingerprint {
        match &self.0.value {
            Value::List(entries) => {
                let mut buf: Vec<u8> = Vec::with_capacity(1 + entries.len() * 32);
                buf.extend_from_slice(b"[");
                for entry in entries {
                    buf.extend_from_slice(entry.to_hash().as_bytes());
                }
                Fingerprint::of_bytes(&buf)
            }
            Value::Map(map) => {
                let mut buf: Vec<u8> = Vec::with_capacity(1 + map.len() * 64);
                buf.extend_from_slice(b"{");
                for (key, value) in map.iter() {
                    buf.extend_from_slice(Fingerprint::of_bytes(key.as_bytes()).as_bytes());
                    buf.extend_from_slice(value.to_hash().as_bytes());
                }
                Fingerprint::of_bytes(&buf)
            }
            value => {
                // Hash the JSON representation, prefixed with a tag that keeps artifact,
                // result, node, and name values disjoint from plain JSON data.
                let prefix = match value {
                    Value::Artifact(_) => "@",
                    Value::Result(_) => "=",
                    Value::Node(_) => "#",
                    Value::Name(_) => "$",
                    _ => "",
                };
                let rendered = format!("{}{}", prefix, self.to_json(JsonMode::SerializeAll));
                Fingerprint::of_bytes(rendered.as_bytes())
            }
        }
    }

    pub fn to_json(&self, mode: JsonMode) -> Json {
        match &self.0.value {
            Value::None => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => Json::Number(n.clone()),
            Value::String(s) => Json::String(s.clone()),
            Value::Artifact(a) => {
                if mode == JsonMode::NullForNonJson {
                    Json::Null
                } else {
                    a.to_json()
                }
            }
            Value::Result(r) => {
                if mode == JsonMode::NullForNonJson {
                    Json::Null
                } else {
                    r.to_json()
                }
            }
            Value::Node(n) => match mode {
                JsonMode::SerializeAll => n.to_json(),
                JsonMode::SerializeAllButNodes => {
                    json!({"type": "NODE", "id": self.to_hash().to_hex()})
                }
                JsonMode::NullForNonJson => Json::Null,
            },
            Value::Name(n) => {
                if mode == JsonMode::NullForNonJson {
                    Json::Null
                } else {
                    n.to_json()
                }
            }
            Value::List(entries) => {
                Json::Array(entries.iter().map(|e| e.to_json(mode)).collect())
            }
            Value::Map(map) => {
                let mut obj = JsonMap::new();
                for (key, value) in map.iter() {
                    obj.insert(key.clone(), value.to_json(mode));
                }
                Json::Object(obj)
            }
        }
    }

    ///
    /// Parses plain JSON into a literal value. Objects become literal maps; the evaluator
    /// is what gives maps with a "type" key their meaning.
    ///
    pub fn from_json(json: &Json) -> Expr {
        match json {
            Json::Null => Expr::none(),
            Json::Bool(b) => Expr::bool(*b),
            Json::Number(n) => Expr::number(n.clone()),
            Json::String(s) => Expr::string(s.clone()),
            Json::Array(entries) => Expr::list(entries.iter().map(Expr::from_json).collect()),
            Json::Object(obj) => Expr::map(
                obj.iter()
                    .map(|(k, v)| (k.clone(), Expr::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Expr) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.to_hash() == other.to_hash()
    }
}

impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_hash().hash(state);
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr({})", self.to_json(JsonMode::SerializeAll))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json(JsonMode::SerializeAll))
    }
}

impl From<bool> for Expr {
    fn from(b: bool) -> Expr {
        Expr::bool(b)
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Expr {
        Expr::string(s)
    }
}

impl From<String> for Expr {
    fn from(s: String) -> Expr {
        Expr::string(s)
    }
}

impl From<Vec<Expr>> for Expr {
    fn from(entries: Vec<Expr>) -> Expr {
        Expr::list(entries)
    }
}

impl From<ExprMap> for Expr {
    fn from(map: ExprMap) -> Expr {
        Expr::map(map)
    }
}

#[cfg(test)]
mod tests;
