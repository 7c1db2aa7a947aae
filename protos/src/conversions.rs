// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use hashing::Fingerprint;

use crate::gen::build::bazel::remote::execution::v2 as remexec;

impl From<&hashing::Digest> for remexec::Digest {
    fn from(digest: &hashing::Digest) -> remexec::Digest {
        remexec::Digest {
            hash: digest.hash.to_hex(),
            size_bytes: digest.size_bytes as i64,
        }
    }
}

///
/// Converts a wire digest back into a `hashing::Digest`. The wire format does not carry
/// the tree flag, so the caller must say what the digest identifies.
///
pub fn from_proto_digest(
    digest: &remexec::Digest,
    is_tree: bool,
) -> Result<hashing::Digest, String> {
    let hash = Fingerprint::from_hex_string(&digest.hash)
        .map_err(|e| format!("Bad fingerprint in digest {:?}: {e}", digest.hash))?;
    Ok(hashing::Digest::new(
        hash,
        digest.size_bytes as usize,
        is_tree,
    ))
}

///
/// As `from_proto_digest`, for the ubiquitous optional-message field shape.
///
pub fn require_digest(
    digest: Option<&remexec::Digest>,
    is_tree: bool,
) -> Result<hashing::Digest, String> {
    match digest {
        Some(digest) => from_proto_digest(digest, is_tree),
        None => Err("Protocol violation: expected a digest, but none was set".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::{from_proto_digest, require_digest};
    use crate::gen::build::bazel::remote::execution::v2 as remexec;
    use hashing::DigestFunction;

    #[test]
    fn digest_round_trip() {
        let digest = DigestFunction::Compatible.blob_digest(b"roland");
        let proto: remexec::Digest = (&digest).into();
        assert_eq!(proto.size_bytes, 6);
        assert_eq!(from_proto_digest(&proto, false).unwrap(), digest);
    }

    #[test]
    fn require_digest_rejects_absent_and_malformed() {
        require_digest(None, false).expect_err("Want err");
        let bad = remexec::Digest {
            hash: "not-hex".to_string(),
            size_bytes: 3,
        };
        from_proto_digest(&bad, false).expect_err("Want err");
    }
}
