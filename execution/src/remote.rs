// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use common::{ArtifactDescription, Blob, ObjectInfo, ObjectType};
use hashing::{Digest, DigestFunction};
use prost::Message;
use store::Store;
use tokio::io::AsyncWrite;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

use protos::conversions::{from_proto_digest, require_digest};
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use protos::gen::google::longrunning::{operation, Operation};
use remexec::{ActionCacheClient, ContentAddressableStorageClient, ExecutionClient};

use crate::retry::{retry_call, status_code_is_retryable};
use crate::{ExecutionApi, ExecutionRequest, ExecutionResponse, RemoteAddress};

/// How often a dropped operation stream is re-attached via WaitExecution before the
/// execution is reported as failed.
const MAX_WAIT_RECONNECTS: usize = 8;

///
/// Remote execution over the Bazel Remote Execution v2 protocol. Inputs are uploaded to
/// the remote CAS (missing blobs only), execution is streamed via the operations API, and
/// outputs are ingested back into the local store so later actions and retrievals can be
/// served locally.
///
#[derive(Clone)]
pub struct RemoteApi {
    instance_name: String,
    store: Store,
    local: crate::LocalApi,
    execution: ExecutionClient,
    action_cache: ActionCacheClient,
    cas: ContentAddressableStorageClient,
}

impl RemoteApi {
    pub fn connect(
        store: Store,
        repositories: common::RepositoryConfig,
        address: &RemoteAddress,
        instance_name: impl Into<String>,
    ) -> Result<RemoteApi, String> {
        if store.digest_function() != DigestFunction::Compatible {
            return Err(
                "Remote execution requires the compatible digest function".to_string(),
            );
        }
        let endpoint = Endpoint::from_shared(address.uri())
            .map_err(|e| format!("Invalid remote address {address:?}: {e}"))?;
        let channel: Channel = endpoint.connect_lazy();
        Ok(RemoteApi {
            instance_name: instance_name.into(),
            local: crate::LocalApi::new(store.clone(), repositories),
            store,
            execution: ExecutionClient::new(channel.clone()),
            action_cache: ActionCacheClient::new(channel.clone()),
            cas: ContentAddressableStorageClient::new(channel),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    async fn find_missing(&self, digests: Vec<Digest>) -> Result<Vec<Digest>, String> {
        if digests.is_empty() {
            return Ok(vec![]);
        }
        let is_tree: HashMap<String, bool> = digests
            .iter()
            .map(|d| (d.hash.to_hex(), d.is_tree))
            .collect();
        let request = remexec::FindMissingBlobsRequest {
            instance_name: self.instance_name.clone(),
            blob_digests: digests.iter().map(remexec::Digest::from).collect(),
        };
        let response = retry_call(
            self.cas.clone(),
            |mut client| {
                let request = request.clone();
                async move { client.find_missing_blobs(request).await }
            },
            |status: &Status| status_code_is_retryable(status.code()),
        )
        .await
        .map_err(|status| format!("FindMissingBlobs failed: {status}"))?;
        response
            .into_inner()
            .missing_blob_digests
            .iter()
            .map(|d| from_proto_digest(d, *is_tree.get(&d.hash).unwrap_or(&false)))
            .collect()
    }

    async fn upload_blobs(&self, blobs: Vec<Blob>) -> Result<(), String> {
        if blobs.is_empty() {
            return Ok(());
        }
        let request = remexec::BatchUpdateBlobsRequest {
            instance_name: self.instance_name.clone(),
            requests: blobs
                .iter()
                .map(|blob| remexec::batch_update_blobs_request::Request {
                    digest: Some((&blob.digest).into()),
                    data: blob.data.clone(),
                })
                .collect(),
        };
        let response = retry_call(
            self.cas.clone(),
            |mut client| {
                let request = request.clone();
                async move { client.batch_update_blobs(request).await }
            },
            |status: &Status| status_code_is_retryable(status.code()),
        )
        .await
        .map_err(|status| format!("BatchUpdateBlobs failed: {status}"))?;
        for entry in response.into_inner().responses {
            if let Some(status) = entry.status {
                if status.code != 0 {
                    return Err(format!(
                        "Upload of {} was rejected: {}",
                        entry.digest.map(|d| d.hash).unwrap_or_default(),
                        status.message
                    ));
                }
            }
        }
        Ok(())
    }

    async fn read_blobs(&self, digests: Vec<Digest>) -> Result<HashMap<Digest, Bytes>, String> {
        if digests.is_empty() {
            return Ok(HashMap::new());
        }
        let is_tree: HashMap<String, bool> = digests
            .iter()
            .map(|d| (d.hash.to_hex(), d.is_tree))
            .collect();
        let request = remexec::BatchReadBlobsRequest {
            instance_name: self.instance_name.clone(),
            digests: digests.iter().map(remexec::Digest::from).collect(),
        };
        let response = retry_call(
            self.cas.clone(),
            |mut client| {
                let request = request.clone();
                async move { client.batch_read_blobs(request).await }
            },
            |status: &Status| status_code_is_retryable(status.code()),
        )
        .await
        .map_err(|status| format!("BatchReadBlobs failed: {status}"))?;

        let mut blobs = HashMap::new();
        for entry in response.into_inner().responses {
            if let Some(status) = &entry.status {
                if status.code != 0 {
                    return Err(format!(
                        "Read of {} failed: {}",
                        entry.digest.map(|d| d.hash).unwrap_or_default(),
                        status.message
                    ));
                }
            }
            let digest = entry
                .digest
                .as_ref()
                .ok_or_else(|| "BatchReadBlobs response without digest".to_string())?;
            let digest =
                from_proto_digest(digest, *is_tree.get(&digest.hash).unwrap_or(&false))?;
            blobs.insert(digest, entry.data);
        }
        Ok(blobs)
    }

    ///
    /// The transitive closure of blobs the remote side needs to run against the given
    /// input root: every tree object plus every leaf blob reachable from it.
    ///
    fn input_closure(&self, root: &Digest) -> Result<Vec<Blob>, String> {
        let mut blobs = Vec::new();
        let mut stack = vec![*root];
        let mut seen = HashSet::new();
        while let Some(digest) = stack.pop() {
            if !seen.insert(digest) {
                continue;
            }
            if digest.is_tree {
                let info = ObjectInfo::new(digest, ObjectType::Tree);
                blobs.push(Blob::new(digest, self.store.load_object(&info)?));
                for (_, child) in self.store.read_direct_tree_entries(&digest)? {
                    stack.push(child.digest);
                }
            } else {
                let info = ObjectInfo::new(digest, ObjectType::File);
                blobs.push(Blob::new(digest, self.store.load_object(&info)?));
            }
        }
        Ok(blobs)
    }

    ///
    /// Downloads everything an action result references into the local store and
    /// converts it into an execution response.
    ///
    async fn ingest_action_result(
        &self,
        result: &remexec::ActionResult,
        is_cached: bool,
    ) -> Result<ExecutionResponse, String> {
        let mut artifacts = BTreeMap::new();

        let mut wanted_files: Vec<Digest> = Vec::new();
        for file in &result.output_files {
            let digest = require_digest(file.digest.as_ref(), false)?;
            let object_type = if file.is_executable {
                ObjectType::Executable
            } else {
                ObjectType::File
            };
            let info = ObjectInfo::new(digest, object_type);
            if !file.contents.is_empty() {
                self.store.store_blob(file.contents.clone(), file.is_executable).await?;
            } else if !self.store.has_object(&info) {
                wanted_files.push(digest);
            }
            artifacts.insert(file.path.clone(), info);
        }
        let fetched = self.read_blobs(wanted_files).await?;
        for file in &result.output_files {
            let digest = require_digest(file.digest.as_ref(), false)?;
            if let Some(data) = fetched.get(&digest) {
                self.store.store_blob(data.clone(), file.is_executable).await?;
            }
        }

        for dir in &result.output_directories {
            let tree_digest = require_digest(dir.tree_digest.as_ref(), false)?;
            let fetched = self.read_blobs(vec![tree_digest]).await?;
            let tree_bytes = fetched
                .get(&tree_digest)
                .ok_or_else(|| format!("Output tree {tree_digest} was not returned"))?;
            let tree = remexec::Tree::decode(tree_bytes.as_ref())
                .map_err(|e| format!("Invalid Tree message: {e}"))?;
            let root = tree
                .root
                .as_ref()
                .ok_or_else(|| "Tree message without root".to_string())?;
            // Store each directory level as a local tree object; fetch the file contents
            // the directories reference.
            let mut file_digests = Vec::new();
            for directory in std::iter::once(root).chain(tree.children.iter()) {
                self.store
                    .store_tree(Bytes::from(directory.encode_to_vec()))
                    .await?;
                for file in &directory.files {
                    let digest = require_digest(file.digest.as_ref(), false)?;
                    let info = ObjectInfo::new(digest, ObjectType::File);
                    if !self.store.has_object(&info) {
                        file_digests.push(digest);
                    }
                }
            }
            let contents = self.read_blobs(file_digests).await?;
            for data in contents.into_values() {
                self.store.store_blob(data, false).await?;
            }
            let root_digest = self
                .store
                .digest_function()
                .tree_digest(&root.encode_to_vec());
            artifacts.insert(
                dir.path.clone(),
                ObjectInfo::new(root_digest, ObjectType::Tree),
            );
        }

        Ok(ExecutionResponse {
            exit_code: result.exit_code,
            stdout: result.stdout_raw.clone(),
            stderr: result.stderr_raw.clone(),
            artifacts,
            is_cached,
        })
    }

    pub async fn get_action_result(
        &self,
        action_digest: &Digest,
    ) -> Result<Option<remexec::ActionResult>, String> {
        let request = remexec::GetActionResultRequest {
            instance_name: self.instance_name.clone(),
            action_digest: Some(action_digest.into()),
            inline_stdout: true,
            inline_stderr: true,
        };
        let result = retry_call(
            self.action_cache.clone(),
            |mut client| {
                let request = request.clone();
                async move { client.get_action_result(request).await }
            },
            |status: &Status| status_code_is_retryable(status.code()),
        )
        .await;
        match result {
            Ok(response) => Ok(Some(response.into_inner())),
            Err(status) if status.code() == Code::NotFound => {
                log::debug!("cache miss '{}'", status.message());
                Ok(None)
            }
            Err(status) => Err(format!("GetActionResult failed: {status}")),
        }
    }

    pub async fn update_action_result(
        &self,
        action_digest: &Digest,
        result: &remexec::ActionResult,
    ) -> Result<(), String> {
        let request = remexec::UpdateActionResultRequest {
            instance_name: self.instance_name.clone(),
            action_digest: Some(action_digest.into()),
            action_result: Some(result.clone()),
        };
        retry_call(
            self.action_cache.clone(),
            |mut client| {
                let request = request.clone();
                async move { client.update_action_result(request).await }
            },
            |status: &Status| status_code_is_retryable(status.code()),
        )
        .await
        .map(|_| ())
        .map_err(|status| format!("UpdateActionResult failed: {status}"))
    }

    ///
    /// Drains one operation stream. Returns the final response if the server reported
    /// completion, or the operation name to re-attach to if the stream ended early.
    ///
    async fn drain_operations(
        mut stream: tonic::codec::Streaming<Operation>,
        mut name: String,
    ) -> Result<std::result::Result<remexec::ExecuteResponse, String>, String> {
        loop {
            match stream.message().await {
                Ok(Some(op)) => {
                    if !op.name.is_empty() {
                        name = op.name.clone();
                    }
                    if op.done {
                        return match op.result {
                            Some(operation::Result::Response(any)) => {
                                let response =
                                    remexec::ExecuteResponse::decode(any.value.as_slice())
                                        .map_err(|e| {
                                            format!("Invalid ExecuteResponse message: {e}")
                                        })?;
                                Ok(Ok(response))
                            }
                            Some(operation::Result::Error(status)) => Err(format!(
                                "Remote execution failed: {} (code {})",
                                status.message, status.code
                            )),
                            None => {
                                Err("Operation completed without a result".to_string())
                            }
                        };
                    }
                }
                Ok(None) => return Ok(Err(name)),
                Err(status) => return Err(format!("Operation stream failed: {status}")),
            }
        }
    }
}

#[async_trait]
impl ExecutionApi for RemoteApi {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResponse, String> {
        let digests = self.store.digest_function();

        // Assemble the wire Action. The protocol requires sorted environment variables
        // and output lists.
        let mut output_files = request.output_files.clone();
        output_files.sort();
        let mut output_directories = request.output_dirs.clone();
        output_directories.sort();
        let command = remexec::Command {
            arguments: request.command.clone(),
            environment_variables: request
                .env
                .iter()
                .map(|(name, value)| remexec::command::EnvironmentVariable {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            output_files,
            output_directories,
            working_directory: String::new(),
        };
        let command_bytes = Bytes::from(command.encode_to_vec());
        let command_digest = digests.blob_digest(&command_bytes);

        let input_root = self
            .store
            .store_tree_from_entries(request.inputs.clone())
            .await?;

        let action = remexec::Action {
            command_digest: Some((&command_digest).into()),
            input_root_digest: Some((&input_root.digest).into()),
            timeout: request.timeout.map(|timeout| prost_types::Duration {
                seconds: timeout.as_secs() as i64,
                nanos: timeout.subsec_nanos() as i32,
            }),
            do_not_cache: request.no_cache,
        };
        let action_bytes = Bytes::from(action.encode_to_vec());
        let action_digest = digests.blob_digest(&action_bytes);

        // Layered cache read: local first, then the remote action cache.
        if !request.no_cache {
            if let Some(result) = self.store.cached_result(&action_digest).await {
                if let Ok(response) = self.ingest_action_result(&result, true).await {
                    return Ok(response);
                }
            }
            if let Some(result) = self.get_action_result(&action_digest).await? {
                let response = self.ingest_action_result(&result, true).await?;
                self.store.store_result(&action_digest, &result).await?;
                return Ok(response);
            }
        }

        // Upload whatever the remote side is missing of the input closure.
        let mut blobs = self.input_closure(&input_root.digest)?;
        blobs.push(Blob::new(command_digest, command_bytes));
        blobs.push(Blob::new(action_digest, action_bytes.clone()));
        let missing: HashSet<Digest> = self
            .find_missing(blobs.iter().map(|blob| blob.digest).collect())
            .await?
            .into_iter()
            .collect();
        blobs.retain(|blob| missing.contains(&blob.digest));
        self.upload_blobs(blobs).await?;

        // Execute, re-attaching via WaitExecution if the stream drops.
        let execute_request = remexec::ExecuteRequest {
            instance_name: self.instance_name.clone(),
            skip_cache_lookup: request.no_cache,
            action_digest: Some((&action_digest).into()),
        };
        let stream = retry_call(
            self.execution.clone(),
            |mut client| {
                let request = execute_request.clone();
                async move { client.execute(request).await }
            },
            |status: &Status| status_code_is_retryable(status.code()),
        )
        .await
        .map_err(|status| format!("Execute failed: {status}"))?
        .into_inner();

        let mut outcome = Self::drain_operations(stream, String::new()).await?;
        let mut reconnects = 0;
        let response = loop {
            match outcome {
                Ok(response) => break response,
                Err(name) => {
                    if name.is_empty() {
                        return Err("Execution stream ended before an operation name was \
                                    assigned"
                            .to_string());
                    }
                    reconnects += 1;
                    if reconnects > MAX_WAIT_RECONNECTS {
                        return Err(format!(
                            "Execution of action {} did not complete after {} reconnects",
                            request.action_id, MAX_WAIT_RECONNECTS
                        ));
                    }
                    let stream = retry_call(
                        self.execution.clone(),
                        |mut client| {
                            let request = remexec::WaitExecutionRequest { name: name.clone() };
                            async move { client.wait_execution(request).await }
                        },
                        |status: &Status| status_code_is_retryable(status.code()),
                    )
                    .await
                    .map_err(|status| format!("WaitExecution failed: {status}"))?
                    .into_inner();
                    outcome = Self::drain_operations(stream, name).await?;
                }
            }
        };

        if let Some(status) = &response.status {
            if status.code != 0 {
                return Err(format!(
                    "Remote execution failed: {} (code {})",
                    status.message, status.code
                ));
            }
        }
        let result = response
            .result
            .as_ref()
            .ok_or_else(|| "ExecuteResponse without a result".to_string())?;
        let execution_response = self
            .ingest_action_result(result, response.cached_result)
            .await?;

        // Write through to the local action cache; non-zero exits are never cached.
        if result.exit_code == 0 && !request.no_cache {
            self.store.store_result(&action_digest, result).await?;
        }
        Ok(execution_response)
    }

    async fn upload(&self, blobs: Vec<Blob>) -> Result<(), String> {
        let missing: HashSet<Digest> = self
            .find_missing(blobs.iter().map(|blob| blob.digest).collect())
            .await?
            .into_iter()
            .collect();
        let to_upload: Vec<Blob> = blobs
            .into_iter()
            .filter(|blob| missing.contains(&blob.digest))
            .collect();
        self.upload_blobs(to_upload).await
    }

    async fn upload_tree(&self, entries: Vec<(String, ObjectInfo)>) -> Result<ObjectInfo, String> {
        let root = if entries.is_empty() {
            let bytes = self.store.encode_tree_level(&[])?;
            let digest = self.store.store_tree(bytes).await?;
            ObjectInfo::new(digest, ObjectType::Tree)
        } else {
            self.store.store_tree_from_entries(entries).await?
        };
        let blobs = self.input_closure(&root.digest)?;
        let missing: HashSet<Digest> = self
            .find_missing(blobs.iter().map(|blob| blob.digest).collect())
            .await?
            .into_iter()
            .collect();
        self.upload_blobs(
            blobs
                .into_iter()
                .filter(|blob| missing.contains(&blob.digest))
                .collect(),
        )
        .await?;
        Ok(root)
    }

    async fn ingest_source(&self, artifact: &ArtifactDescription) -> Result<ObjectInfo, String> {
        // Ingest locally first, then make the content available remotely.
        let info = self.local.ingest_source(artifact).await?;
        if !self.find_missing(vec![info.digest]).await?.is_empty() {
            let data = self.store.load_object(&info)?;
            self.upload_blobs(vec![Blob::new(info.digest, data)]).await?;
        }
        Ok(info)
    }

    async fn is_available(&self, digest: &Digest) -> bool {
        matches!(self.find_missing(vec![*digest]).await, Ok(missing) if missing.is_empty())
    }

    async fn missing(&self, digests: &[Digest]) -> Vec<Digest> {
        self.find_missing(digests.to_vec()).await.unwrap_or_else(|e| {
            log::warn!("FindMissingBlobs failed, treating all blobs as missing: {e}");
            digests.to_vec()
        })
    }

    async fn retrieve_to_paths(
        &self,
        infos: &[ObjectInfo],
        paths: &[PathBuf],
    ) -> Result<(), String> {
        self.fetch_to_local(infos).await?;
        self.local.retrieve_to_paths(infos, paths).await
    }

    async fn retrieve_to_writers(
        &self,
        infos: &[ObjectInfo],
        writers: &mut [&mut (dyn AsyncWrite + Send + Unpin)],
        raw_tree: bool,
    ) -> Result<(), String> {
        self.fetch_to_local(infos).await?;
        self.local.retrieve_to_writers(infos, writers, raw_tree).await
    }

    async fn retrieve_to_cas(
        &self,
        infos: &[ObjectInfo],
        other: &dyn ExecutionApi,
    ) -> Result<(), String> {
        self.fetch_to_local(infos).await?;
        self.local.retrieve_to_cas(infos, other).await
    }
}

impl RemoteApi {
    ///
    /// Ensures the given objects (trees recursively) are present in the local store,
    /// fetching from the remote CAS where needed.
    ///
    async fn fetch_to_local(&self, infos: &[ObjectInfo]) -> Result<(), String> {
        let mut queue: Vec<ObjectInfo> = infos.to_vec();
        while let Some(info) = queue.pop() {
            if self.store.has_object(&info) {
                if info.object_type.is_tree() {
                    for (_, child) in self.store.read_direct_tree_entries(&info.digest)? {
                        if !self.store.has_object(&child) {
                            queue.push(child);
                        }
                    }
                }
                continue;
            }
            let fetched = self.read_blobs(vec![info.digest]).await?;
            let data = fetched
                .get(&info.digest)
                .ok_or_else(|| format!("Object {info} was not returned by the remote"))?;
            if info.object_type.is_tree() {
                self.store.store_tree(data.clone()).await?;
                for (_, child) in self.store.read_direct_tree_entries(&info.digest)? {
                    queue.push(child);
                }
            } else {
                self.store
                    .store_blob(data.clone(), info.object_type.is_executable())
                    .await?;
            }
        }
        Ok(())
    }
}
