// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(clippy::all)]
// Subjective style.
#![allow(clippy::too_many_arguments, clippy::redundant_field_names)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::{ActionDescription, ArtifactDescription, Blob, ObjectInfo};
use hashing::{Digest, DigestFunction};
use serde_json::json;
use tokio::io::AsyncWrite;

mod local;
mod remote;
mod retry;
mod traverser;

pub use local::LocalApi;
pub use remote::RemoteApi;
pub use traverser::{BuildReport, Traverser};

///
/// A single execution of a command in a staged input directory. `inputs` maps staging
/// paths to already-ingested content; declared outputs are scanned in after the command
/// exits.
///
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub action_id: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub inputs: Vec<(String, ObjectInfo)>,
    pub output_files: Vec<String>,
    pub output_dirs: Vec<String>,
    pub timeout: Option<Duration>,
    pub no_cache: bool,
}

impl ExecutionRequest {
    ///
    /// Assembles the request for a graph action whose inputs have all become available.
    ///
    pub fn for_action(
        description: &ActionDescription,
        inputs: Vec<(String, ObjectInfo)>,
    ) -> ExecutionRequest {
        ExecutionRequest {
            action_id: description.id().to_string(),
            command: description.action().command.clone(),
            env: description.action().env.clone(),
            inputs,
            output_files: description.output_files().to_vec(),
            output_dirs: description.output_dirs().to_vec(),
            timeout: None,
            no_cache: description.action().no_cache,
        }
    }

    ///
    /// The action-cache key for this request: a digest over the canonical JSON of
    /// everything that determines the outcome. Stable for a given digest function.
    ///
    pub fn cache_key(&self, digests: DigestFunction) -> Digest {
        let inputs: BTreeMap<&String, String> = self
            .inputs
            .iter()
            .map(|(path, info)| (path, info.to_string()))
            .collect();
        let rendered = json!({
            "command": self.command,
            "env": self.env,
            "input": inputs,
            "output": self.output_files,
            "output_dirs": self.output_dirs,
        })
        .to_string();
        digests.blob_digest(rendered.as_bytes())
    }
}

///
/// The outcome of one action execution.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutionResponse {
    pub exit_code: i32,
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub artifacts: BTreeMap<String, ObjectInfo>,
    pub is_cached: bool,
}

///
/// The uniform interface over local and remote execution. One implementation spawns
/// processes in staging directories on this machine; the other speaks the Bazel Remote
/// Execution v2 protocol. Both are backed by the local CAS for staging and results.
///
#[async_trait]
pub trait ExecutionApi: Send + Sync {
    ///
    /// Runs the action (or satisfies it from the action cache) and returns its outcome.
    /// A zero exit code with caching allowed updates the action cache; non-zero exits
    /// are never cached.
    ///
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResponse, String>;

    ///
    /// Makes the given blobs available to this executor's CAS. The returned error names
    /// the first digest whose content did not match.
    ///
    async fn upload(&self, blobs: Vec<Blob>) -> Result<(), String>;

    ///
    /// Builds and registers the tree objects for a flat stage, returning the root.
    ///
    async fn upload_tree(&self, entries: Vec<(String, ObjectInfo)>) -> Result<ObjectInfo, String>;

    ///
    /// Resolves a source artifact (a local file or a known digest) into available CAS
    /// content.
    ///
    async fn ingest_source(&self, artifact: &ArtifactDescription) -> Result<ObjectInfo, String>;

    async fn is_available(&self, digest: &Digest) -> bool;

    ///
    /// The subset of the given digests this executor cannot serve.
    ///
    async fn missing(&self, digests: &[Digest]) -> Vec<Digest>;

    ///
    /// Materialises each object at the corresponding filesystem path; trees are unpacked
    /// recursively.
    ///
    async fn retrieve_to_paths(
        &self,
        infos: &[ObjectInfo],
        paths: &[PathBuf],
    ) -> Result<(), String>;

    ///
    /// Streams each object into the corresponding writer. `raw_tree` selects the raw
    /// serialised tree object over the per-entry listing.
    ///
    async fn retrieve_to_writers(
        &self,
        infos: &[ObjectInfo],
        writers: &mut [&mut (dyn AsyncWrite + Send + Unpin)],
        raw_tree: bool,
    ) -> Result<(), String>;

    ///
    /// Copies the given objects (trees recursively, content before referents) into the
    /// other executor's CAS.
    ///
    async fn retrieve_to_cas(
        &self,
        infos: &[ObjectInfo],
        other: &dyn ExecutionApi,
    ) -> Result<(), String>;
}

///
/// The address of a remote execution endpoint, `host:port`. Parsed once at startup; a
/// malformed value is fatal.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteAddress {
    pub host: String,
    pub port: u16,
}

impl RemoteAddress {
    pub fn parse(value: &str) -> Result<RemoteAddress, String> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| format!("Remote address must be of the form host:port, got {value:?}"))?;
        if host.is_empty() {
            return Err(format!("Remote address has an empty host: {value:?}"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("Invalid port in remote address {value:?}: {e}"))?;
        Ok(RemoteAddress {
            host: host.to_string(),
            port,
        })
    }

    pub fn uri(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests;
