// Copyright 2023 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use super::{Digest, DigestFunction, Fingerprint, WriterHasher};

use std::io::Write;

#[test]
fn from_hex_string() {
    let want = Fingerprint([
        0xab, 0xcd, 0xef, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0xff,
    ]);
    assert_eq!(
        Fingerprint::from_hex_string(
            "abcdef0000000000000000000000000000000000000000000000000000000000ff"
        )
        .unwrap(),
        want
    );
}

#[test]
fn hex_round_trip() {
    let fp = Fingerprint::of_bytes(b"roland");
    assert_eq!(Fingerprint::from_hex_string(&fp.to_hex()).unwrap(), fp);
}

#[test]
fn from_hex_string_not_long_enough() {
    Fingerprint::from_hex_string("abcdef").expect_err("Want err");
}

#[test]
fn compatible_empty_digest() {
    // The well-known SHA-256 of the empty string.
    assert_eq!(
        DigestFunction::Compatible.empty_blob().hash.to_hex(),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}

#[test]
fn native_tags_preimage() {
    let compatible = DigestFunction::Compatible.blob_digest(b"content");
    let native = DigestFunction::Native.blob_digest(b"content");
    assert_eq!(compatible.size_bytes, native.size_bytes);
    assert_ne!(compatible.hash, native.hash);
}

#[test]
fn native_blob_and_tree_disjoint() {
    let blob = DigestFunction::Native.blob_digest(b"content");
    let tree = DigestFunction::Native.tree_digest(b"content");
    assert_ne!(blob.hash, tree.hash);
    assert!(tree.is_tree);
    assert!(!blob.is_tree);
}

#[test]
fn digest_is_stable() {
    // compute_digest must be deterministic across runs and hosts.
    assert_eq!(
        DigestFunction::Compatible.blob_digest(b"roland").hash.to_hex(),
        "9f45aa99ad9ab5c822155c4a44f9d64d010faeaea76468a939d2d4f046e340bd"
    );
}

#[test]
fn render_parse_round_trip() {
    let digest = DigestFunction::Native.tree_digest(b"entries");
    assert_eq!(Digest::parse(&digest.render()).unwrap(), digest);
    Digest::parse("not-a-digest").expect_err("Want err");
    Digest::parse("abcd:12:f").expect_err("Want err");
}

#[test]
fn digest_serde_round_trip() {
    let digest = DigestFunction::Compatible.blob_digest(b"roland");
    let json = serde_json::to_string(&digest).unwrap();
    assert_eq!(serde_json::from_str::<Digest>(&json).unwrap(), digest);
}

#[test]
fn writer_hasher_matches_compatible_digest() {
    let mut hasher = WriterHasher::new(Vec::new());
    hasher.write_all(b"meep").unwrap();
    let (fingerprint, size, written) = hasher.finish();
    assert_eq!(
        fingerprint,
        DigestFunction::Compatible.blob_digest(b"meep").hash
    );
    assert_eq!(size, 4);
    assert_eq!(written, b"meep".to_vec());
}
