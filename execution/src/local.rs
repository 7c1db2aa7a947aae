// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    ArtifactDescription, ArtifactKind, Blob, ObjectInfo, ObjectType, RepositoryConfig,
};
use futures::TryFutureExt;
use hashing::Digest;
use store::{ActionResult, Store};
use tokio::io::AsyncWrite;

use protos::conversions::require_digest;
use protos::gen::build::bazel::remote::execution::v2 as remexec;

use crate::{ExecutionApi, ExecutionRequest, ExecutionResponse};

///
/// Local execution: actions are spawned in a temporary staging directory populated from
/// the CAS, with a cleared environment; declared outputs are scanned back into the CAS.
///
#[derive(Clone)]
pub struct LocalApi {
    store: Store,
    repositories: RepositoryConfig,
}

impl LocalApi {
    pub fn new(store: Store, repositories: RepositoryConfig) -> LocalApi {
        LocalApi {
            store,
            repositories,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn stage_inputs(&self, workdir: &Path, request: &ExecutionRequest) -> Result<(), String> {
        for (path, info) in &request.inputs {
            let target = workdir.join(path);
            if info.object_type.is_tree() {
                for (leaf, leaf_info) in self
                    .store
                    .recursively_read_tree_leaves(&info.digest, &target)?
                {
                    self.stage_file(&leaf, &leaf_info)?;
                }
            } else {
                self.stage_file(&target, info)?;
            }
        }
        Ok(())
    }

    fn stage_file(&self, target: &Path, info: &ObjectInfo) -> Result<(), String> {
        let source = self
            .store
            .blob_path(&info.digest, info.object_type.is_executable())
            .ok_or_else(|| format!("Input {info} is not in the store"))?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
        }
        // Hard links preserve the store's read-only permissions and avoid the copy.
        std::fs::hard_link(&source, target)
            .or_else(|_| std::fs::copy(&source, target).map(|_| ()))
            .map_err(|e| format!("Failed to stage {}: {e}", target.display()))
    }

    async fn scan_outputs(
        &self,
        workdir: &Path,
        request: &ExecutionRequest,
    ) -> Result<BTreeMap<String, ObjectInfo>, String> {
        let mut artifacts = BTreeMap::new();
        for path in &request.output_files {
            let absolute = workdir.join(path);
            if !absolute.is_file() {
                continue;
            }
            let executable = is_executable(&absolute);
            let bytes = tokio::fs::read(&absolute)
                .await
                .map_err(|e| format!("Failed to read output {path:?}: {e}"))?;
            let digest = self.store.store_blob(Bytes::from(bytes), executable).await?;
            let object_type = if executable {
                ObjectType::Executable
            } else {
                ObjectType::File
            };
            artifacts.insert(path.clone(), ObjectInfo::new(digest, object_type));
        }
        for path in &request.output_dirs {
            let absolute = workdir.join(path);
            if !absolute.is_dir() {
                continue;
            }
            let mut entries = Vec::new();
            collect_files(&absolute, Path::new(""), &mut entries)?;
            let mut stage = Vec::with_capacity(entries.len());
            for (relative, file, executable) in entries {
                let bytes = tokio::fs::read(&file)
                    .await
                    .map_err(|e| format!("Failed to read output {}: {e}", file.display()))?;
                let digest = self.store.store_blob(Bytes::from(bytes), executable).await?;
                let object_type = if executable {
                    ObjectType::Executable
                } else {
                    ObjectType::File
                };
                stage.push((
                    relative.to_string_lossy().into_owned(),
                    ObjectInfo::new(digest, object_type),
                ));
            }
            let info = if stage.is_empty() {
                let bytes = self.store.encode_tree_level(&[])?;
                let digest = self.store.store_tree(bytes).await?;
                ObjectInfo::new(digest, ObjectType::Tree)
            } else {
                self.store.store_tree_from_entries(stage).await?
            };
            artifacts.insert(path.clone(), info);
        }
        Ok(artifacts)
    }

    fn response_from_cached(
        &self,
        result: &ActionResult,
    ) -> Result<ExecutionResponse, String> {
        let mut artifacts = BTreeMap::new();
        for file in &result.output_files {
            let digest = require_digest(file.digest.as_ref(), false)?;
            let object_type = if file.is_executable {
                ObjectType::Executable
            } else {
                ObjectType::File
            };
            let info = ObjectInfo::new(digest, object_type);
            if !self.store.has_object(&info) {
                return Err(format!("Cached output {info} has left the store"));
            }
            artifacts.insert(file.path.clone(), info);
        }
        for dir in &result.output_directories {
            let digest = require_digest(dir.tree_digest.as_ref(), true)?;
            let info = ObjectInfo::new(digest, ObjectType::Tree);
            if !self.store.has_object(&info) {
                return Err(format!("Cached output tree {info} has left the store"));
            }
            artifacts.insert(dir.path.clone(), info);
        }
        Ok(ExecutionResponse {
            exit_code: result.exit_code,
            stdout: result.stdout_raw.clone(),
            stderr: result.stderr_raw.clone(),
            artifacts,
            is_cached: true,
        })
    }

    fn action_result(
        exit_code: i32,
        stdout: &Bytes,
        stderr: &Bytes,
        artifacts: &BTreeMap<String, ObjectInfo>,
    ) -> ActionResult {
        let mut result = ActionResult {
            exit_code,
            stdout_raw: stdout.clone(),
            stderr_raw: stderr.clone(),
            ..Default::default()
        };
        for (path, info) in artifacts {
            if info.object_type.is_tree() {
                result.output_directories.push(remexec::OutputDirectory {
                    path: path.clone(),
                    tree_digest: Some((&info.digest).into()),
                });
            } else {
                result.output_files.push(remexec::OutputFile {
                    path: path.clone(),
                    digest: Some((&info.digest).into()),
                    is_executable: info.object_type.is_executable(),
                    contents: Bytes::new(),
                });
            }
        }
        result
    }
}

#[async_trait]
impl ExecutionApi for LocalApi {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResponse, String> {
        let cache_key = request.cache_key(self.store.digest_function());
        if !request.no_cache {
            if let Some(result) = self.store.cached_result(&cache_key).await {
                match self.response_from_cached(&result) {
                    Ok(response) => {
                        log::debug!("Action {} satisfied from the action cache", request.action_id);
                        return Ok(response);
                    }
                    Err(e) => {
                        log::warn!(
                            "Ignoring cache entry for action {}: {e}",
                            request.action_id
                        );
                    }
                }
            }
        }

        let workdir = tempfile::TempDir::new()
            .map_err(|e| format!("Failed to create a staging directory: {e}"))?;
        self.stage_inputs(workdir.path(), request)?;

        let program = request
            .command
            .first()
            .ok_or_else(|| "Cannot execute an empty command".to_string())?;
        let mut command = tokio::process::Command::new(program);
        command
            .args(&request.command[1..])
            .current_dir(workdir.path())
            .env_clear()
            .envs(&request.env)
            .kill_on_drop(true);

        let child = command
            .output()
            .map_err(|e| format!("Error executing process {program:?}: {e}"));
        let output = match request.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child)
                .await
                .map_err(|_| format!("Action {} timed out after {timeout:?}", request.action_id))??,
            None => child.await?,
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = Bytes::from(output.stdout);
        let stderr = Bytes::from(output.stderr);
        let artifacts = self.scan_outputs(workdir.path(), request).await?;

        if exit_code == 0 && !request.no_cache {
            let result = Self::action_result(exit_code, &stdout, &stderr, &artifacts);
            self.store.store_result(&cache_key, &result).await?;
        }

        Ok(ExecutionResponse {
            exit_code,
            stdout,
            stderr,
            artifacts,
            is_cached: false,
        })
    }

    async fn upload(&self, blobs: Vec<Blob>) -> Result<(), String> {
        for blob in blobs {
            let stored = if blob.digest.is_tree {
                self.store.store_tree(blob.data).await?
            } else {
                self.store.store_blob(blob.data, false).await?
            };
            if stored != blob.digest {
                return Err(format!(
                    "Uploaded content hashes to {stored}, not the declared {}",
                    blob.digest
                ));
            }
        }
        Ok(())
    }

    async fn upload_tree(&self, entries: Vec<(String, ObjectInfo)>) -> Result<ObjectInfo, String> {
        if entries.is_empty() {
            let bytes = self.store.encode_tree_level(&[])?;
            let digest = self.store.store_tree(bytes).await?;
            return Ok(ObjectInfo::new(digest, ObjectType::Tree));
        }
        self.store.store_tree_from_entries(entries).await
    }

    async fn ingest_source(&self, artifact: &ArtifactDescription) -> Result<ObjectInfo, String> {
        match artifact.kind() {
            ArtifactKind::Local { path, repository } => {
                let root = self.repositories.root(repository)?;
                let absolute = root.join(path);
                let executable = is_executable(&absolute);
                let bytes = tokio::fs::read(&absolute)
                    .await
                    .map_err(|e| format!("Failed to read source file {path:?}: {e}"))?;
                let digest = self.store.store_blob(Bytes::from(bytes), executable).await?;
                let object_type = if executable {
                    ObjectType::Executable
                } else {
                    ObjectType::File
                };
                Ok(ObjectInfo::new(digest, object_type))
            }
            ArtifactKind::Known {
                digest,
                object_type,
            } => {
                let info = ObjectInfo::new(*digest, *object_type);
                if self.store.has_object(&info) {
                    Ok(info)
                } else {
                    Err(format!("Known artifact {info} is not available"))
                }
            }
            _ => Err(format!(
                "Artifact {} is not a source artifact",
                artifact.id()
            )),
        }
    }

    async fn is_available(&self, digest: &Digest) -> bool {
        if digest.is_tree {
            self.store.tree_path(digest).is_some()
        } else {
            self.store.blob_path(digest, false).is_some()
        }
    }

    async fn missing(&self, digests: &[Digest]) -> Vec<Digest> {
        let mut missing = Vec::new();
        for digest in digests {
            if !self.is_available(digest).await {
                missing.push(*digest);
            }
        }
        missing
    }

    async fn retrieve_to_paths(
        &self,
        infos: &[ObjectInfo],
        paths: &[PathBuf],
    ) -> Result<(), String> {
        if infos.len() != paths.len() {
            return Err("Different number of objects and output paths".to_string());
        }
        for (info, path) in infos.iter().zip(paths) {
            if info.object_type.is_tree() {
                for (leaf, leaf_info) in
                    self.store.recursively_read_tree_leaves(&info.digest, path)?
                {
                    self.materialize_file(&leaf, &leaf_info)?;
                }
            } else {
                self.materialize_file(path, info)?;
            }
        }
        Ok(())
    }

    async fn retrieve_to_writers(
        &self,
        infos: &[ObjectInfo],
        writers: &mut [&mut (dyn AsyncWrite + Send + Unpin)],
        raw_tree: bool,
    ) -> Result<(), String> {
        if infos.len() != writers.len() {
            return Err("Different number of objects and writers".to_string());
        }
        for (info, writer) in infos.iter().zip(writers.iter_mut()) {
            self.store.dump_to_stream(info, writer, raw_tree).await?;
        }
        Ok(())
    }

    async fn retrieve_to_cas(
        &self,
        infos: &[ObjectInfo],
        other: &dyn ExecutionApi,
    ) -> Result<(), String> {
        let digests: Vec<Digest> = infos.iter().map(|info| info.digest).collect();
        let missing = other.missing(&digests).await;
        let missing: std::collections::HashSet<Digest> = missing.into_iter().collect();

        let mut blobs = Vec::new();
        for info in infos {
            if !missing.contains(&info.digest) {
                continue;
            }
            // Trees ship their content first, so the remote never holds a dangling tree.
            if info.object_type.is_tree() {
                let children: Vec<ObjectInfo> = self
                    .store
                    .read_direct_tree_entries(&info.digest)?
                    .into_iter()
                    .map(|(_, child)| child)
                    .collect();
                self.retrieve_to_cas(&children, other).await?;
            }
            let data = self.store.load_object(info)?;
            blobs.push(Blob::new(info.digest, data));
        }
        other.upload(blobs).await
    }
}

impl LocalApi {
    fn materialize_file(&self, target: &Path, info: &ObjectInfo) -> Result<(), String> {
        let source = self
            .store
            .blob_path(&info.digest, info.object_type.is_executable())
            .ok_or_else(|| format!("Object {info} is not in the store"))?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
        }
        std::fs::copy(&source, target)
            .map_err(|e| format!("Failed to materialize {}: {e}", target.display()))?;
        // Materialized copies belong to the user, unlike the read-only store content.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if info.object_type.is_executable() {
                0o755
            } else {
                0o644
            };
            std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode))
                .map_err(|e| format!("Failed to chmod {}: {e}", target.display()))?;
        }
        Ok(())
    }
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|meta| meta.permissions().mode() & 0o100 == 0o100)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}

fn collect_files(
    root: &Path,
    prefix: &Path,
    entries: &mut Vec<(PathBuf, PathBuf, bool)>,
) -> Result<(), String> {
    let listing = std::fs::read_dir(root)
        .map_err(|e| format!("Failed to list output directory {}: {e}", root.display()))?;
    for entry in listing {
        let entry = entry.map_err(|e| format!("Failed to list {}: {e}", root.display()))?;
        let path = entry.path();
        let relative = prefix.join(entry.file_name());
        if path.is_dir() {
            collect_files(&path, &relative, entries)?;
        } else {
            let executable = is_executable(&path);
            entries.push((relative, path, executable));
        }
    }
    Ok(())
}
