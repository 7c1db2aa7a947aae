// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Tree-object encodings. In native mode a tree level is a text record, one entry per
//! line, `<type> <hex>:<size> <name>`; in compatible mode it is the wire `Directory`
//! serialisation of the remote-execution protocol. Entries are sorted by name in both.

use common::{ObjectInfo, ObjectType};
use hashing::{Digest, DigestFunction};
use prost::Message;
use protos::conversions::require_digest;
use protos::gen::build::bazel::remote::execution::v2 as remexec;

pub fn encode(
    digests: DigestFunction,
    entries: &[(String, ObjectInfo)],
) -> Result<Vec<u8>, String> {
    for (name, _) in entries {
        if name.is_empty() || name.contains('/') || name.contains('\n') || name == "." {
            return Err(format!("Invalid tree entry name {name:?}"));
        }
    }
    match digests {
        DigestFunction::Native => {
            let mut out = String::new();
            for (name, info) in entries {
                out.push_str(&format!(
                    "{} {}:{} {}\n",
                    info.object_type,
                    info.digest.hash.to_hex(),
                    info.digest.size_bytes,
                    name
                ));
            }
            Ok(out.into_bytes())
        }
        DigestFunction::Compatible => {
            let mut directory = remexec::Directory::default();
            for (name, info) in entries {
                match info.object_type {
                    ObjectType::Tree => directory.directories.push(remexec::DirectoryNode {
                        name: name.clone(),
                        digest: Some((&info.digest).into()),
                    }),
                    ObjectType::Symlink => {
                        return Err(format!(
                            "Symlink {name:?} cannot be encoded in a compatible tree"
                        ))
                    }
                    _ => directory.files.push(remexec::FileNode {
                        name: name.clone(),
                        digest: Some((&info.digest).into()),
                        is_executable: info.object_type.is_executable(),
                    }),
                }
            }
            Ok(directory.encode_to_vec())
        }
    }
}

pub fn decode(digests: DigestFunction, bytes: &[u8]) -> Result<Vec<(String, ObjectInfo)>, String> {
    match digests {
        DigestFunction::Native => {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| format!("Tree object is not valid UTF-8: {e}"))?;
            let mut entries = Vec::new();
            for line in text.lines() {
                let mut parts = line.splitn(3, ' ');
                let (kind, digest, name) = match (parts.next(), parts.next(), parts.next()) {
                    (Some(k), Some(d), Some(n)) => (k, d, n),
                    _ => return Err(format!("Malformed tree entry {line:?}")),
                };
                let object_type = ObjectType::from_char(
                    kind.chars()
                        .next()
                        .ok_or_else(|| format!("Malformed tree entry {line:?}"))?,
                )?;
                let (hex, size) = digest
                    .split_once(':')
                    .ok_or_else(|| format!("Malformed tree entry {line:?}"))?;
                let digest = Digest::parse(&format!(
                    "{}:{}:{}",
                    hex,
                    size,
                    if object_type.is_tree() { "t" } else { "f" }
                ))?;
                entries.push((name.to_string(), ObjectInfo::new(digest, object_type)));
            }
            Ok(entries)
        }
        DigestFunction::Compatible => {
            let directory = remexec::Directory::decode(bytes)
                .map_err(|e| format!("Invalid Directory message: {e}"))?;
            let mut entries = Vec::new();
            for file in &directory.files {
                let digest = require_digest(file.digest.as_ref(), false)?;
                let object_type = if file.is_executable {
                    ObjectType::Executable
                } else {
                    ObjectType::File
                };
                entries.push((file.name.clone(), ObjectInfo::new(digest, object_type)));
            }
            for dir in &directory.directories {
                let digest = require_digest(dir.digest.as_ref(), true)?;
                entries.push((dir.name.clone(), ObjectInfo::new(digest, ObjectType::Tree)));
            }
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(entries)
        }
    }
}
