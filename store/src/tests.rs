// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use super::{ActionResult, Store};

use std::path::Path;

use bytes::Bytes;
use common::{ObjectInfo, ObjectType};
use hashing::DigestFunction;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use task_executor::Executor;
use tempfile::TempDir;

fn new_store(dir: &Path, digests: DigestFunction) -> Store {
    Store::new(Executor::new(), dir, digests).unwrap()
}

#[tokio::test]
async fn blob_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), DigestFunction::Native);

    let digest = store.store_blob(Bytes::from_static(b"roland"), false).await.unwrap();
    assert_eq!(digest, DigestFunction::Native.blob_digest(b"roland"));

    let info = ObjectInfo::new(digest, ObjectType::File);
    assert!(store.has_object(&info));
    assert_eq!(store.load_object(&info).unwrap(), Bytes::from_static(b"roland"));
}

#[tokio::test]
async fn store_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), DigestFunction::Native);

    let first = store.store_blob(Bytes::from_static(b"meep"), false).await.unwrap();
    let second = store.store_blob(Bytes::from_static(b"meep"), false).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn concurrent_identical_stores() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), DigestFunction::Native);

    let stores = (0..16).map(|_| store.store_blob(Bytes::from_static(b"shared"), false));
    let digests = futures::future::try_join_all(stores).await.unwrap();
    assert!(digests.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn executable_blobs_live_in_their_own_shard() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), DigestFunction::Native);

    let digest = store.store_blob(Bytes::from_static(b"#!/bin/sh"), true).await.unwrap();
    let exec_path = store.blob_path(&digest, true).unwrap();
    assert!(exec_path.starts_with(dir.path().join("casx")));

    // Requesting the non-executable flavor re-ingests into the plain shard.
    let plain_path = store.blob_path(&digest, false).unwrap();
    assert!(plain_path.starts_with(dir.path().join("cas")));
    assert_eq!(std::fs::read(&plain_path).unwrap(), b"#!/bin/sh");
}

#[tokio::test]
async fn missing_blobs_have_no_path() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), DigestFunction::Native);
    let digest = DigestFunction::Native.blob_digest(b"never stored");
    assert_eq!(store.blob_path(&digest, false), None);
}

#[tokio::test]
async fn tree_from_entries_and_leaves_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), DigestFunction::Native);

    let a = store.store_blob(Bytes::from_static(b"a"), false).await.unwrap();
    let b = store.store_blob(Bytes::from_static(b"b"), true).await.unwrap();
    let entries = vec![
        ("src/a.txt".to_string(), ObjectInfo::new(a, ObjectType::File)),
        ("bin/tool".to_string(), ObjectInfo::new(b, ObjectType::Executable)),
    ];
    let root = store.store_tree_from_entries(entries).await.unwrap();
    assert_eq!(root.object_type, ObjectType::Tree);

    let mut leaves = store
        .recursively_read_tree_leaves(&root.digest, Path::new(""))
        .unwrap();
    leaves.sort();
    assert_eq!(
        leaves,
        vec![
            (
                Path::new("bin/tool").to_path_buf(),
                ObjectInfo::new(b, ObjectType::Executable)
            ),
            (
                Path::new("src/a.txt").to_path_buf(),
                ObjectInfo::new(a, ObjectType::File)
            ),
        ]
    );

    // One-level expansion sees the two subdirectories.
    let direct = store.read_direct_tree_entries(&root.digest).unwrap();
    let names: Vec<&str> = direct.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["bin", "src"]);
}

#[tokio::test]
async fn compatible_trees_are_directory_messages() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), DigestFunction::Compatible);

    let a = store.store_blob(Bytes::from_static(b"a"), false).await.unwrap();
    let root = store
        .store_tree_from_entries(vec![(
            "a.txt".to_string(),
            ObjectInfo::new(a, ObjectType::File),
        )])
        .await
        .unwrap();

    let bytes = store.load_object(&root).unwrap();
    let directory = super::directory_from_bytes(&bytes).unwrap();
    assert_eq!(directory.files.len(), 1);
    assert_eq!(directory.files[0].name, "a.txt");
    assert_eq!(
        directory.files[0].digest,
        Some((&a).into()),
    );

    let entries = store.read_direct_tree_entries(&root.digest).unwrap();
    assert_eq!(entries[0].0, "a.txt");
}

#[tokio::test]
async fn staging_conflicts_are_rejected() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), DigestFunction::Native);
    let a = store.store_blob(Bytes::from_static(b"a"), false).await.unwrap();
    let info = ObjectInfo::new(a, ObjectType::File);

    let err = store
        .store_tree_from_entries(vec![
            ("x".to_string(), info),
            ("x/y".to_string(), info),
        ])
        .await
        .unwrap_err();
    assert!(err.contains("Staging conflict"), "{err}");
}

#[tokio::test]
async fn dump_to_stream_raw_and_listing() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), DigestFunction::Native);

    let blob = store.store_blob(Bytes::from_static(b"content"), false).await.unwrap();
    let mut out: Vec<u8> = Vec::new();
    store
        .dump_to_stream(&ObjectInfo::new(blob, ObjectType::File), &mut out, false)
        .await
        .unwrap();
    assert_eq!(out, b"content");

    let root = store
        .store_tree_from_entries(vec![(
            "f".to_string(),
            ObjectInfo::new(blob, ObjectType::File),
        )])
        .await
        .unwrap();
    let mut listing: Vec<u8> = Vec::new();
    store.dump_to_stream(&root, &mut listing, false).await.unwrap();
    let listing: serde_json::Value = serde_json::from_slice(&listing).unwrap();
    assert!(listing.get("f").is_some());

    let mut raw: Vec<u8> = Vec::new();
    store.dump_to_stream(&root, &mut raw, true).await.unwrap();
    assert_eq!(Bytes::from(raw), store.load_object(&root).unwrap());
}

fn result_with_output(path: &str) -> ActionResult {
    ActionResult {
        output_files: vec![remexec::OutputFile {
            path: path.to_string(),
            digest: None,
            is_executable: false,
            contents: Bytes::new(),
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn action_cache_single_action_single_result() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), DigestFunction::Native);

    let action_digest = DigestFunction::Native.blob_digest(b"action");
    assert!(store.cached_result(&action_digest).await.is_none());

    store
        .store_result(&action_digest, &result_with_output("result"))
        .await
        .unwrap();
    let cached = store.cached_result(&action_digest).await.unwrap();
    assert_eq!(cached, result_with_output("result"));
}

#[tokio::test]
async fn action_cache_two_actions_two_results() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), DigestFunction::Native);

    let action1 = DigestFunction::Native.blob_digest(b"action1");
    let action2 = DigestFunction::Native.blob_digest(b"action2");
    store.store_result(&action1, &result_with_output("result1")).await.unwrap();
    store.store_result(&action2, &result_with_output("result2")).await.unwrap();

    assert_eq!(
        store.cached_result(&action1).await.unwrap(),
        result_with_output("result1")
    );
    assert_eq!(
        store.cached_result(&action2).await.unwrap(),
        result_with_output("result2")
    );
}

#[tokio::test]
async fn action_cache_last_write_wins() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), DigestFunction::Native);

    let action_digest = DigestFunction::Native.blob_digest(b"same action");
    store.store_result(&action_digest, &result_with_output("result1")).await.unwrap();
    store.store_result(&action_digest, &result_with_output("result2")).await.unwrap();

    assert_eq!(
        store.cached_result(&action_digest).await.unwrap(),
        result_with_output("result2")
    );
}
