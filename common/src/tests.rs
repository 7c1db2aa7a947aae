// Copyright 2023 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use super::{ActionDescription, ArtifactDescription, ObjectInfo, ObjectType};

use std::collections::BTreeMap;

use hashing::DigestFunction;
use serde_json::json;

#[test]
fn artifact_ids_are_stable() {
    let a = ArtifactDescription::local("src/main.cpp", "repo");
    let b = ArtifactDescription::local("src/main.cpp", "repo");
    assert_eq!(a.id(), b.id());
    assert_eq!(a, b);

    let c = ArtifactDescription::local("src/main.cpp", "other");
    assert_ne!(a.id(), c.id());
}

#[test]
fn artifact_ids_distinguish_variants() {
    let digest = DigestFunction::Native.blob_digest(b"content");
    let ids = [
        ArtifactDescription::local("p", "r").id().clone(),
        ArtifactDescription::known(digest, ObjectType::File).id().clone(),
        ArtifactDescription::action("act", "p").id().clone(),
        ArtifactDescription::tree("tree-id").id().clone(),
    ];
    for (i, a) in ids.iter().enumerate() {
        for b in &ids[i + 1..] {
            assert_ne!(a, b);
        }
    }
}

#[test]
fn artifact_json_round_trip() {
    let digest = DigestFunction::Compatible.blob_digest(b"x");
    for artifact in [
        ArtifactDescription::local("foo/bar", "repo"),
        ArtifactDescription::known(digest, ObjectType::Executable),
        ArtifactDescription::action("action-id", "out/lib.a"),
        ArtifactDescription::tree("tree-id"),
    ] {
        let parsed = ArtifactDescription::from_json(&artifact.to_json()).unwrap();
        assert_eq!(parsed, artifact);
        assert_eq!(parsed.id(), artifact.id());
    }
}

#[test]
fn artifact_local_paths_are_normalized() {
    let a = ArtifactDescription::local("./foo/../bar", "");
    let b = ArtifactDescription::local("bar", "");
    assert_eq!(a.id(), b.id());
}

#[test]
fn action_id_covers_all_identity_fields() {
    let inputs: BTreeMap<String, ArtifactDescription> =
        [("main.cpp".to_string(), ArtifactDescription::local("main.cpp", ""))]
            .into_iter()
            .collect();
    let base = ActionDescription::fresh(
        vec!["out".to_string()],
        vec![],
        vec!["cc".to_string(), "main.cpp".to_string()],
        BTreeMap::new(),
        None,
        false,
        inputs.clone(),
    );
    let same = ActionDescription::fresh(
        vec!["out".to_string()],
        vec![],
        vec!["cc".to_string(), "main.cpp".to_string()],
        BTreeMap::new(),
        None,
        false,
        inputs.clone(),
    );
    assert_eq!(base.id(), same.id());

    let other_cmd = ActionDescription::fresh(
        vec!["out".to_string()],
        vec![],
        vec!["cc".to_string(), "-O2".to_string(), "main.cpp".to_string()],
        BTreeMap::new(),
        None,
        false,
        inputs.clone(),
    );
    assert_ne!(base.id(), other_cmd.id());

    let other_env = ActionDescription::fresh(
        vec!["out".to_string()],
        vec![],
        vec!["cc".to_string(), "main.cpp".to_string()],
        [("LANG".to_string(), "C".to_string())].into_iter().collect(),
        None,
        false,
        inputs,
    );
    assert_ne!(base.id(), other_env.id());
}

#[test]
fn action_json_round_trip() {
    let inputs: BTreeMap<String, ArtifactDescription> =
        [("main.cpp".to_string(), ArtifactDescription::local("main.cpp", ""))]
            .into_iter()
            .collect();
    let action = ActionDescription::fresh(
        vec!["out".to_string()],
        vec!["gen".to_string()],
        vec!["sh".to_string(), "-c".to_string(), "make".to_string()],
        [("PATH".to_string(), "/bin".to_string())].into_iter().collect(),
        Some("allowed to fail".to_string()),
        true,
        inputs,
    );
    let parsed = ActionDescription::from_json(action.id(), &action.to_json()).unwrap();
    assert_eq!(parsed, action);
}

#[test]
fn action_from_json_requires_outputs_and_command() {
    ActionDescription::from_json("id", &json!({"command": ["true"]})).expect_err("Want err");
    ActionDescription::from_json("id", &json!({"output": ["out"]})).expect_err("Want err");
    ActionDescription::from_json("id", &json!({"output": ["out"], "command": []}))
        .expect_err("Want err");
}

#[test]
fn object_info_round_trip() {
    let digest = DigestFunction::Native.tree_digest(b"entries");
    let info = ObjectInfo::new(digest, ObjectType::Tree);
    assert_eq!(ObjectInfo::parse(&info.to_string()).unwrap(), info);

    let digest = DigestFunction::Native.blob_digest(b"bin");
    let info = ObjectInfo::new(digest, ObjectType::Executable);
    assert_eq!(ObjectInfo::parse(&info.to_string()).unwrap(), info);
}
