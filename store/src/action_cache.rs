// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The local action cache. The serialised `ActionResult` lives in the CAS; the index
//! entry `ac/<xx>/<hex>` holds the rendered digest of that blob and is replaced
//! atomically, so the last write for an action digest wins.

use bytes::Bytes;
use common::{ObjectInfo, ObjectType};
use hashing::Digest;
use prost::Message;

use crate::{Store, ActionResult, BLOB_PERMISSIONS};

impl Store {
    ///
    /// The cached result for the action digest, if any. A present but unreadable entry is
    /// treated as a miss (and logged), never as an error: the caller simply re-executes.
    ///
    pub async fn cached_result(&self, action_digest: &Digest) -> Option<ActionResult> {
        let index = self.shard_path("ac", action_digest);
        let rendered = tokio::fs::read_to_string(&index).await.ok()?;
        let load = || -> Result<ActionResult, String> {
            let result_digest = Digest::parse(rendered.trim())?;
            let bytes = self.load_object(&ObjectInfo::new(result_digest, ObjectType::File))?;
            ActionResult::decode(bytes.as_ref())
                .map_err(|e| format!("Invalid ActionResult message: {e}"))
        };
        match load() {
            Ok(result) => Some(result),
            Err(e) => {
                log::warn!("Ignoring unreadable action cache entry for {action_digest}: {e}");
                None
            }
        }
    }

    ///
    /// Stores the result for the action digest, replacing any previous entry.
    ///
    pub async fn store_result(
        &self,
        action_digest: &Digest,
        result: &ActionResult,
    ) -> Result<(), String> {
        let bytes = Bytes::from(result.encode_to_vec());
        let result_digest = self.store_blob(bytes, false).await?;
        let index = self.shard_path("ac", action_digest);
        let store = self.clone();
        self.executor()
            .spawn_blocking(
                move || {
                    store.atomic_write(&index, result_digest.render().as_bytes(), BLOB_PERMISSIONS)
                },
                |e| Err(format!("Store task failed: {e}")),
            )
            .await
    }
}
