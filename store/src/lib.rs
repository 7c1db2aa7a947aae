// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(clippy::all)]
// Subjective style.
#![allow(clippy::len_without_is_empty, clippy::redundant_field_names)]

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use common::{ObjectInfo, ObjectType};
use hashing::{Digest, DigestFunction};
use prost::Message;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use task_executor::Executor;
use tokio::io::{AsyncWrite, AsyncWriteExt};

mod action_cache;
mod tree;

pub use protos::gen::build::bazel::remote::execution::v2::ActionResult;

const BLOB_PERMISSIONS: u32 = 0o444;
const EXECUTABLE_PERMISSIONS: u32 = 0o555;

///
/// The local content-addressed store: file blobs, executable blobs, and tree objects in
/// sharded directories, plus the action-cache index. All inserts go through a temp file
/// in `tmp/` followed by an atomic rename, so concurrent tool invocations sharing one
/// store directory cannot observe partial objects.
///
/// Layout under the store root:
///   cas/<xx>/<hex>   file blobs
///   casx/<xx>/<hex>  executable blobs
///   tree/<xx>/<hex>  tree objects
///   ac/<xx>/<hex>    action-cache index entries (rendered result digests)
///   tmp/             staging for atomic renames
///
#[derive(Clone)]
pub struct Store {
    inner: Arc<InnerStore>,
}

struct InnerStore {
    root: PathBuf,
    digests: DigestFunction,
    executor: Executor,
}

impl Store {
    pub fn new<P: AsRef<Path>>(
        executor: Executor,
        root: P,
        digests: DigestFunction,
    ) -> Result<Store, String> {
        let root = root.as_ref().to_path_buf();
        for dir in ["cas", "casx", "tree", "ac", "tmp"] {
            std::fs::create_dir_all(root.join(dir))
                .map_err(|e| format!("Failed to create store directory {dir:?}: {e}"))?;
        }
        Ok(Store {
            inner: Arc::new(InnerStore {
                root,
                digests,
                executor,
            }),
        })
    }

    pub fn digest_function(&self) -> DigestFunction {
        self.inner.digests
    }

    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    fn shard_path(&self, kind: &str, digest: &Digest) -> PathBuf {
        let hex = digest.hash.to_hex();
        self.inner.root.join(kind).join(&hex[..2]).join(&hex[2..])
    }

    fn object_path(&self, info: &ObjectInfo) -> Option<PathBuf> {
        if info.object_type.is_tree() {
            self.tree_path(&info.digest)
        } else {
            self.blob_path(&info.digest, info.object_type.is_executable())
        }
    }

    ///
    /// The path of the blob with the given digest, if present. A blob stored with the
    /// other executable-ness is re-ingested into the requested shard first, so the
    /// returned path always carries the right permissions.
    ///
    pub fn blob_path(&self, digest: &Digest, executable: bool) -> Option<PathBuf> {
        let (wanted_kind, other_kind) = if executable {
            ("casx", "cas")
        } else {
            ("cas", "casx")
        };
        let wanted = self.shard_path(wanted_kind, digest);
        if wanted.exists() {
            return Some(wanted);
        }
        let other = self.shard_path(other_kind, digest);
        if other.exists() {
            let bytes = std::fs::read(&other).ok()?;
            let mode = if executable {
                EXECUTABLE_PERMISSIONS
            } else {
                BLOB_PERMISSIONS
            };
            self.atomic_write(&wanted, &bytes, mode).ok()?;
            return Some(wanted);
        }
        None
    }

    pub fn tree_path(&self, digest: &Digest) -> Option<PathBuf> {
        let path = self.shard_path("tree", digest);
        path.exists().then_some(path)
    }

    pub fn has_object(&self, info: &ObjectInfo) -> bool {
        self.object_path(info).is_some()
    }

    ///
    /// Stores a blob, returning its digest. Idempotent, and safe against concurrent
    /// stores of identical content from this or other processes.
    ///
    pub async fn store_blob(&self, bytes: Bytes, executable: bool) -> Result<Digest, String> {
        let digest = self.inner.digests.blob_digest(&bytes);
        let kind = if executable { "casx" } else { "cas" };
        let path = self.shard_path(kind, &digest);
        if path.exists() {
            return Ok(digest);
        }
        let store = self.clone();
        let mode = if executable {
            EXECUTABLE_PERMISSIONS
        } else {
            BLOB_PERMISSIONS
        };
        self.inner
            .executor
            .spawn_blocking(
                move || store.atomic_write(&path, &bytes, mode),
                |e| Err(format!("Store task failed: {e}")),
            )
            .await?;
        Ok(digest)
    }

    ///
    /// Stores a serialised tree object, returning its digest.
    ///
    pub async fn store_tree(&self, bytes: Bytes) -> Result<Digest, String> {
        let digest = self.inner.digests.tree_digest(&bytes);
        let path = self.shard_path("tree", &digest);
        if path.exists() {
            return Ok(digest);
        }
        let store = self.clone();
        self.inner
            .executor
            .spawn_blocking(
                move || store.atomic_write(&path, &bytes, BLOB_PERMISSIONS),
                |e| Err(format!("Store task failed: {e}")),
            )
            .await?;
        Ok(digest)
    }

    ///
    /// Reads the content of a blob or tree object.
    ///
    pub fn load_object(&self, info: &ObjectInfo) -> Result<Bytes, String> {
        let path = self
            .object_path(info)
            .ok_or_else(|| format!("Object {info} is not in the store"))?;
        std::fs::read(&path)
            .map(Bytes::from)
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))
    }

    ///
    /// Writes the object's content to the stream. For trees, `raw_tree` selects the raw
    /// serialised tree object; otherwise a JSON listing of the direct entries is written.
    ///
    pub async fn dump_to_stream<W: AsyncWrite + Unpin>(
        &self,
        info: &ObjectInfo,
        writer: &mut W,
        raw_tree: bool,
    ) -> Result<(), String> {
        let bytes = if info.object_type.is_tree() && !raw_tree {
            let entries = self.read_direct_tree_entries(&info.digest)?;
            let listing: serde_json::Map<String, serde_json::Value> = entries
                .into_iter()
                .map(|(name, info)| (name, serde_json::Value::String(info.to_string())))
                .collect();
            Bytes::from(serde_json::Value::Object(listing).to_string())
        } else {
            self.load_object(info)?
        };
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| format!("Failed to dump {info}: {e}"))
    }

    ///
    /// One-level expansion of a tree object: its direct entries, by name.
    ///
    pub fn read_direct_tree_entries(
        &self,
        digest: &Digest,
    ) -> Result<Vec<(String, ObjectInfo)>, String> {
        let info = ObjectInfo::new(*digest, ObjectType::Tree);
        let bytes = self.load_object(&info)?;
        tree::decode(self.inner.digests, &bytes)
    }

    ///
    /// Yields `(relative path, info)` for every leaf reachable from the tree digest,
    /// prefixed with `prefix`.
    ///
    pub fn recursively_read_tree_leaves(
        &self,
        root: &Digest,
        prefix: &Path,
    ) -> Result<Vec<(PathBuf, ObjectInfo)>, String> {
        let mut leaves = Vec::new();
        self.walk_tree(root, prefix, &mut leaves)?;
        Ok(leaves)
    }

    fn walk_tree(
        &self,
        digest: &Digest,
        prefix: &Path,
        leaves: &mut Vec<(PathBuf, ObjectInfo)>,
    ) -> Result<(), String> {
        for (name, info) in self.read_direct_tree_entries(digest)? {
            let path = prefix.join(&name);
            if info.object_type.is_tree() {
                self.walk_tree(&info.digest, &path, leaves)?;
            } else {
                leaves.push((path, info));
            }
        }
        Ok(())
    }

    ///
    /// Builds and stores the tree objects for a flat stage of `path -> info` entries,
    /// returning the root tree. Paths may be nested; every intermediate directory becomes
    /// its own stored tree object.
    ///
    pub async fn store_tree_from_entries(
        &self,
        entries: Vec<(String, ObjectInfo)>,
    ) -> Result<ObjectInfo, String> {
        let mut root = StageDir::default();
        for (path, info) in entries {
            root.insert(&path, info)?;
        }
        let store = self.clone();
        self.inner
            .executor
            .spawn_blocking(
                move || store.store_stage_dir(&root),
                |e| Err(format!("Store task failed: {e}")),
            )
            .await
    }

    fn store_stage_dir(&self, dir: &StageDir) -> Result<ObjectInfo, String> {
        let mut entries: Vec<(String, ObjectInfo)> = Vec::new();
        for (name, sub) in &dir.dirs {
            let info = self.store_stage_dir(sub)?;
            entries.push((name.clone(), info));
        }
        for (name, info) in &dir.files {
            entries.push((name.clone(), *info));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let bytes = tree::encode(self.inner.digests, &entries)?;
        let digest = self.inner.digests.tree_digest(&bytes);
        let path = self.shard_path("tree", &digest);
        if !path.exists() {
            self.atomic_write(&path, &bytes, BLOB_PERMISSIONS)?;
        }
        Ok(ObjectInfo::new(digest, ObjectType::Tree))
    }

    ///
    /// Serialises the direct entries of one tree level, without storing.
    ///
    pub fn encode_tree_level(&self, entries: &[(String, ObjectInfo)]) -> Result<Bytes, String> {
        tree::encode(self.inner.digests, entries).map(Bytes::from)
    }

    fn atomic_write(&self, target: &Path, bytes: &[u8], mode: u32) -> Result<(), String> {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
        }
        let tmp_dir = self.inner.root.join("tmp");
        let mut tmp = tempfile::NamedTempFile::new_in(&tmp_dir)
            .map_err(|e| format!("Failed to create temp file in {}: {e}", tmp_dir.display()))?;
        tmp.write_all(bytes)
            .map_err(|e| format!("Failed to write temp file: {e}"))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| format!("Failed to sync temp file: {e}"))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))
                .map_err(|e| format!("Failed to set permissions: {e}"))?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        match tmp.persist(target) {
            Ok(_) => Ok(()),
            // A concurrent store of the same content won the rename.
            Err(_) if target.exists() => Ok(()),
            Err(e) => Err(format!("Failed to persist {}: {e}", target.display())),
        }
    }
}

///
/// A nested staging directory under construction.
///
#[derive(Default)]
struct StageDir {
    files: BTreeMap<String, ObjectInfo>,
    dirs: BTreeMap<String, StageDir>,
}

impl StageDir {
    fn insert(&mut self, path: &str, info: ObjectInfo) -> Result<(), String> {
        match path.split_once('/') {
            None => {
                if self.dirs.contains_key(path) || self.files.insert(path.to_string(), info).is_some()
                {
                    return Err(format!("Staging conflict at {path:?}"));
                }
                Ok(())
            }
            Some((dir, rest)) => {
                if self.files.contains_key(dir) {
                    return Err(format!("Staging conflict at {dir:?}"));
                }
                self.dirs.entry(dir.to_string()).or_default().insert(rest, info)
            }
        }
    }
}

///
/// Converts a stored tree into its wire `Directory` message. Only meaningful in
/// compatible mode, where tree objects are `Directory` serialisations.
///
pub fn directory_from_bytes(bytes: &[u8]) -> Result<remexec::Directory, String> {
    remexec::Directory::decode(bytes).map_err(|e| format!("Invalid Directory message: {e}"))
}

#[cfg(test)]
mod tests;
