// Copyright 2023 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(clippy::all)]
// Subjective style.
#![allow(clippy::len_without_is_empty, clippy::redundant_field_names)]

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use hashing::{Digest, Fingerprint};
use serde_json::{json, Value};

mod config;
mod path;
pub use config::{RepositoryConfig, RepositoryInfo};
pub use path::{normalize_path, tree_conflict};

///
/// The kind of object a digest identifies.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum ObjectType {
    File,
    Executable,
    Tree,
    Symlink,
}

impl ObjectType {
    pub fn as_char(&self) -> char {
        match self {
            ObjectType::File => 'f',
            ObjectType::Executable => 'x',
            ObjectType::Tree => 't',
            ObjectType::Symlink => 'l',
        }
    }

    pub fn from_char(c: char) -> Result<ObjectType, String> {
        match c {
            'f' => Ok(ObjectType::File),
            'x' => Ok(ObjectType::Executable),
            't' => Ok(ObjectType::Tree),
            'l' => Ok(ObjectType::Symlink),
            other => Err(format!("Invalid object type {other:?}")),
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, ObjectType::Tree)
    }

    pub fn is_executable(&self) -> bool {
        matches!(self, ObjectType::Executable)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

///
/// A digest plus the object kind it identifies. Renders as `<hex>:<size>:<type>`.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct ObjectInfo {
    pub digest: Digest,
    pub object_type: ObjectType,
}

impl ObjectInfo {
    pub fn new(digest: Digest, object_type: ObjectType) -> ObjectInfo {
        ObjectInfo {
            digest,
            object_type,
        }
    }

    pub fn parse(s: &str) -> Result<ObjectInfo, String> {
        let (rest, type_char) = match s.rsplit_once(':') {
            Some((rest, t)) if t.len() == 1 => (rest, t.chars().next().unwrap()),
            _ => return Err(format!("Not a valid object info rendering: {s:?}")),
        };
        let object_type = ObjectType::from_char(type_char)?;
        let mut digest = Digest::parse(&format!(
            "{}:{}",
            rest,
            if object_type.is_tree() { "t" } else { "f" }
        ))?;
        digest.is_tree = object_type.is_tree();
        Ok(ObjectInfo {
            digest,
            object_type,
        })
    }
}

impl fmt::Display for ObjectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.digest.hash.to_hex(),
            self.digest.size_bytes,
            self.object_type
        )
    }
}

///
/// A blob of content together with its digest, the unit of CAS uploads.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Blob {
    pub digest: Digest,
    pub data: Bytes,
}

impl Blob {
    pub fn new(digest: Digest, data: Bytes) -> Blob {
        Blob { digest, data }
    }
}

///
/// The stable identifier of an artifact description: the hash of its canonical JSON form.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn json_hash(value: &Value) -> String {
    Fingerprint::of_bytes(value.to_string().as_bytes()).to_hex()
}

///
/// Where an artifact's content comes from.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ArtifactKind {
    /// Content supplied by a source repository root.
    Local { path: String, repository: String },
    /// Previously computed or externally supplied content.
    Known {
        digest: Digest,
        object_type: ObjectType,
    },
    /// The artifact at `path` among the outputs of the action `action_id`.
    Action { action_id: String, path: String },
    /// The tree object registered under `tree_id`.
    Tree { tree_id: String },
}

///
/// An artifact description together with its precomputed identifier.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ArtifactDescription {
    kind: ArtifactKind,
    id: ArtifactId,
}

impl ArtifactDescription {
    pub fn local(path: &str, repository: &str) -> ArtifactDescription {
        Self::new(ArtifactKind::Local {
            path: normalize_path(path),
            repository: repository.to_string(),
        })
    }

    pub fn known(digest: Digest, object_type: ObjectType) -> ArtifactDescription {
        Self::new(ArtifactKind::Known {
            digest,
            object_type,
        })
    }

    pub fn action(action_id: &str, path: &str) -> ArtifactDescription {
        Self::new(ArtifactKind::Action {
            action_id: action_id.to_string(),
            path: normalize_path(path),
        })
    }

    pub fn tree(tree_id: &str) -> ArtifactDescription {
        Self::new(ArtifactKind::Tree {
            tree_id: tree_id.to_string(),
        })
    }

    fn new(kind: ArtifactKind) -> ArtifactDescription {
        let id = ArtifactId(json_hash(&Self::kind_to_json(&kind)));
        ArtifactDescription { kind, id }
    }

    pub fn id(&self) -> &ArtifactId {
        &self.id
    }

    pub fn kind(&self) -> &ArtifactKind {
        &self.kind
    }

    pub fn is_tree(&self) -> bool {
        match &self.kind {
            ArtifactKind::Tree { .. } => true,
            ArtifactKind::Known { object_type, .. } => object_type.is_tree(),
            _ => false,
        }
    }

    fn kind_to_json(kind: &ArtifactKind) -> Value {
        match kind {
            ArtifactKind::Local { path, repository } => json!({
                "type": "LOCAL",
                "data": {"path": path, "repository": repository},
            }),
            ArtifactKind::Known {
                digest,
                object_type,
            } => json!({
                "type": "KNOWN",
                "data": {
                    "id": digest.hash.to_hex(),
                    "size": digest.size_bytes,
                    "file_type": object_type.as_char().to_string(),
                },
            }),
            ArtifactKind::Action { action_id, path } => json!({
                "type": "ACTION",
                "data": {"id": action_id, "path": path},
            }),
            ArtifactKind::Tree { tree_id } => json!({
                "type": "TREE",
                "data": {"id": tree_id},
            }),
        }
    }

    pub fn to_json(&self) -> Value {
        Self::kind_to_json(&self.kind)
    }

    pub fn from_json(value: &Value) -> Result<ArtifactDescription, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| format!("Artifact description must be an object, got {value}"))?;
        let type_str = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("Artifact description lacks a type: {value}"))?;
        let data = obj
            .get("data")
            .and_then(Value::as_object)
            .ok_or_else(|| format!("Artifact description lacks data: {value}"))?;
        let str_field = |name: &str| -> Result<&str, String> {
            data.get(name)
                .and_then(Value::as_str)
                .ok_or_else(|| format!("Artifact description field {name:?} missing in {value}"))
        };
        match type_str {
            "LOCAL" => Ok(Self::local(str_field("path")?, str_field("repository")?)),
            "KNOWN" => {
                let hash = Fingerprint::from_hex_string(str_field("id")?)?;
                let size = data
                    .get("size")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| format!("Artifact description size missing in {value}"))?;
                let object_type = ObjectType::from_char(
                    str_field("file_type")?
                        .chars()
                        .next()
                        .ok_or_else(|| "Empty file_type".to_string())?,
                )?;
                Ok(Self::known(
                    Digest::new(hash, size as usize, object_type.is_tree()),
                    object_type,
                ))
            }
            "ACTION" => Ok(Self::action(str_field("id")?, str_field("path")?)),
            "TREE" => Ok(Self::tree(str_field("id")?)),
            other => Err(format!("Unknown artifact description type {other:?}")),
        }
    }
}

///
/// The executable part of an action: what to run, in which environment, and how failures
/// and caching are to be treated.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Action {
    pub id: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub may_fail: Option<String>,
    pub no_cache: bool,
}

///
/// An action plus its declared inputs and outputs: one node of the dependency-action graph.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ActionDescription {
    output_files: Vec<String>,
    output_dirs: Vec<String>,
    action: Action,
    inputs: BTreeMap<String, ArtifactDescription>,
}

impl ActionDescription {
    pub fn new(
        output_files: Vec<String>,
        output_dirs: Vec<String>,
        action: Action,
        inputs: BTreeMap<String, ArtifactDescription>,
    ) -> ActionDescription {
        ActionDescription {
            output_files,
            output_dirs,
            action,
            inputs,
        }
    }

    ///
    /// Creates a description whose action id is the hash of the canonical JSON of the
    /// command, environment, inputs (by artifact id), and declared outputs.
    ///
    pub fn fresh(
        output_files: Vec<String>,
        output_dirs: Vec<String>,
        command: Vec<String>,
        env: BTreeMap<String, String>,
        may_fail: Option<String>,
        no_cache: bool,
        inputs: BTreeMap<String, ArtifactDescription>,
    ) -> ActionDescription {
        let input_ids: BTreeMap<&String, &str> = inputs
            .iter()
            .map(|(path, artifact)| (path, artifact.id().as_str()))
            .collect();
        let id = json_hash(&json!({
            "command": command,
            "env": env,
            "input": input_ids,
            "output": output_files,
            "output_dirs": output_dirs,
        }));
        ActionDescription {
            output_files,
            output_dirs,
            action: Action {
                id,
                command,
                env,
                may_fail,
                no_cache,
            },
            inputs,
        }
    }

    pub fn id(&self) -> &str {
        &self.action.id
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn output_files(&self) -> &[String] {
        &self.output_files
    }

    pub fn output_dirs(&self) -> &[String] {
        &self.output_dirs
    }

    pub fn inputs(&self) -> &BTreeMap<String, ArtifactDescription> {
        &self.inputs
    }

    ///
    /// All declared output paths, files before directories.
    ///
    pub fn output_paths(&self) -> impl Iterator<Item = &String> {
        self.output_files.iter().chain(self.output_dirs.iter())
    }

    pub fn to_json(&self) -> Value {
        let mut json = json!({"command": self.action.command});
        let obj = json.as_object_mut().unwrap();
        if !self.output_files.is_empty() {
            obj.insert("output".to_string(), json!(self.output_files));
        }
        if !self.output_dirs.is_empty() {
            obj.insert("output_dirs".to_string(), json!(self.output_dirs));
        }
        if !self.inputs.is_empty() {
            let inputs: serde_json::Map<String, Value> = self
                .inputs
                .iter()
                .map(|(path, artifact)| (path.clone(), artifact.to_json()))
                .collect();
            obj.insert("input".to_string(), Value::Object(inputs));
        }
        if !self.action.env.is_empty() {
            obj.insert("env".to_string(), json!(self.action.env));
        }
        if let Some(msg) = &self.action.may_fail {
            obj.insert("may_fail".to_string(), json!(msg));
        }
        if self.action.no_cache {
            obj.insert("no_cache".to_string(), json!(true));
        }
        json
    }

    pub fn from_json(id: &str, desc: &Value) -> Result<ActionDescription, String> {
        let obj = desc
            .as_object()
            .ok_or_else(|| format!("Action description for {id:?} must be an object"))?;
        let string_list = |name: &str| -> Result<Vec<String>, String> {
            match obj.get(name) {
                None => Ok(vec![]),
                Some(Value::Array(entries)) => entries
                    .iter()
                    .map(|e| {
                        e.as_str().map(str::to_string).ok_or_else(|| {
                            format!("Action description {name:?} must be an array of strings")
                        })
                    })
                    .collect(),
                Some(_) => Err(format!(
                    "Action description {name:?} must be an array of strings"
                )),
            }
        };
        let output_files = string_list("output")?;
        let output_dirs = string_list("output_dirs")?;
        let command = string_list("command")?;
        if output_files.is_empty() && output_dirs.is_empty() {
            return Err(format!(
                "Action description for action {id:?} incomplete: values for either \
                 \"output\" or \"output_dirs\" must be a non-empty array"
            ));
        }
        if command.is_empty() {
            return Err(format!(
                "Action description for action {id:?} incomplete: value for \"command\" \
                 must be a non-empty array"
            ));
        }
        let mut inputs = BTreeMap::new();
        if let Some(input) = obj.get("input") {
            let input = input
                .as_object()
                .ok_or_else(|| "Action description \"input\" must be an object".to_string())?;
            for (path, artifact) in input {
                inputs.insert(path.clone(), ArtifactDescription::from_json(artifact)?);
            }
        }
        let mut env = BTreeMap::new();
        if let Some(env_value) = obj.get("env") {
            let env_value = env_value
                .as_object()
                .ok_or_else(|| "Action description \"env\" must be an object".to_string())?;
            for (name, value) in env_value {
                let value = value
                    .as_str()
                    .ok_or_else(|| "Action description \"env\" must map to strings".to_string())?;
                env.insert(name.clone(), value.to_string());
            }
        }
        let may_fail = match obj.get("may_fail") {
            None | Some(Value::Null) => None,
            Some(Value::String(msg)) => Some(msg.clone()),
            Some(_) => return Err("may_fail has to be null or a string".to_string()),
        };
        let no_cache = match obj.get("no_cache") {
            None => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err("no_cache has to be a boolean".to_string()),
        };
        Ok(ActionDescription {
            output_files,
            output_dirs,
            action: Action {
                id: id.to_string(),
                command,
                env,
                may_fail,
                no_cache,
            },
            inputs,
        })
    }
}

///
/// A tree declaration: a flat mapping from normalized relative paths to the artifacts
/// staged at those paths. Registered during analysis and materialised during traversal.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tree {
    artifacts: BTreeMap<String, ArtifactDescription>,
    id: String,
}

impl Tree {
    pub fn new(artifacts: BTreeMap<String, ArtifactDescription>) -> Tree {
        let content: serde_json::Map<String, Value> = artifacts
            .iter()
            .map(|(path, artifact)| (path.clone(), artifact.to_json()))
            .collect();
        let id = json_hash(&json!({"type": "TREE", "content": Value::Object(content)}));
        Tree { artifacts, id }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn artifacts(&self) -> &BTreeMap<String, ArtifactDescription> {
        &self.artifacts
    }
}

#[cfg(test)]
mod tests;
