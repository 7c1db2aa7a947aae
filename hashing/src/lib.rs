// Copyright 2023 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(clippy::all)]
// Subjective style.
#![allow(clippy::len_without_is_empty, clippy::redundant_field_names)]

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use serde::de::{MapAccess, Visitor};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde::{Deserialize, Deserializer};
use sha2::{Digest as Sha256Digest, Sha256};

pub const FINGERPRINT_SIZE: usize = 32;

///
/// A SHA-256 value identifying some content.
///
#[derive(Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn from_bytes_unsafe(bytes: &[u8]) -> Fingerprint {
        if bytes.len() != FINGERPRINT_SIZE {
            panic!(
                "Input value was not a fingerprint; had length: {}",
                bytes.len()
            );
        }

        let mut fingerprint = [0; FINGERPRINT_SIZE];
        fingerprint.clone_from_slice(&bytes[0..FINGERPRINT_SIZE]);
        Fingerprint(fingerprint)
    }

    pub fn from_hex_string(hex_string: &str) -> Result<Fingerprint, String> {
        <[u8; FINGERPRINT_SIZE] as hex::FromHex>::from_hex(hex_string)
            .map(Fingerprint)
            .map_err(|e| format!("{e:?}"))
    }

    ///
    /// A raw SHA-256 over the given bytes, with no preimage tagging. Used for internal
    /// identifiers (artifact ids, action ids, expression hashes), which must be deterministic
    /// but are never exchanged with a remote endpoint.
    ///
    pub fn of_bytes(bytes: &[u8]) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Fingerprint(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", self.to_hex())
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::from_hex_string(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_hex().as_str())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FingerprintVisitor;

        impl Visitor<'_> for FingerprintVisitor {
            type Value = Fingerprint;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> Result<(), fmt::Error> {
                formatter.write_str("struct Fingerprint")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Fingerprint::from_hex_string(v).map_err(|err| {
                    serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(&format!("{v:?}: {err}")),
                        &format!("A hex representation of a {FINGERPRINT_SIZE} byte value")
                            .as_str(),
                    )
                })
            }
        }

        deserializer.deserialize_string(FingerprintVisitor)
    }
}

///
/// A Fingerprint together with the size in bytes of the hashed content, and whether the
/// content is a tree object rather than a file blob.
///
/// In compatible mode this is equivalent to a Bazel Remote Execution Digest (with the tree
/// flag carried out of band, as that protocol does); in native mode the preimage tagging
/// makes blob and tree digests disjoint.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Digest {
    pub hash: Fingerprint,
    pub size_bytes: usize,
    pub is_tree: bool,
}

impl Digest {
    pub fn new(hash: Fingerprint, size_bytes: usize, is_tree: bool) -> Digest {
        Digest {
            hash,
            size_bytes,
            is_tree,
        }
    }

    ///
    /// Renders as `<hex>:<size>:<f|t>`, the form used by object info listings and the
    /// action cache index files. `parse` is the inverse.
    ///
    pub fn render(&self) -> String {
        format!(
            "{}:{}:{}",
            self.hash.to_hex(),
            self.size_bytes,
            if self.is_tree { "t" } else { "f" }
        )
    }

    pub fn parse(s: &str) -> Result<Digest, String> {
        let mut parts = s.split(':');
        let (hash, size, kind) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(s), Some(k), None) => (h, s, k),
            _ => return Err(format!("Not a valid digest rendering: {s:?}")),
        };
        let hash = Fingerprint::from_hex_string(hash)?;
        let size_bytes = size
            .parse::<usize>()
            .map_err(|e| format!("Invalid digest size {size:?}: {e}"))?;
        let is_tree = match kind {
            "f" => false,
            "t" => true,
            other => return Err(format!("Invalid digest kind {other:?}")),
        };
        Ok(Digest::new(hash, size_bytes, is_tree))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut obj = serializer.serialize_struct("digest", 3)?;
        obj.serialize_field("fingerprint", &self.hash)?;
        obj.serialize_field("size_bytes", &self.size_bytes)?;
        obj.serialize_field("is_tree", &self.is_tree)?;
        obj.end()
    }
}

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "snake_case")]
enum Field {
    Fingerprint,
    SizeBytes,
    IsTree,
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DigestVisitor;

        impl<'de> Visitor<'de> for DigestVisitor {
            type Value = Digest;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("struct digest")
            }

            fn visit_map<V>(self, mut map: V) -> Result<Digest, V::Error>
            where
                V: MapAccess<'de>,
            {
                use serde::de;

                let mut fingerprint = None;
                let mut size_bytes = None;
                let mut is_tree = None;
                while let Some(key) = map.next_key()? {
                    match key {
                        Field::Fingerprint => {
                            if fingerprint.is_some() {
                                return Err(de::Error::duplicate_field("fingerprint"));
                            }
                            fingerprint = Some(map.next_value()?);
                        }
                        Field::SizeBytes => {
                            if size_bytes.is_some() {
                                return Err(de::Error::duplicate_field("size_bytes"));
                            }
                            size_bytes = Some(map.next_value()?);
                        }
                        Field::IsTree => {
                            if is_tree.is_some() {
                                return Err(de::Error::duplicate_field("is_tree"));
                            }
                            is_tree = Some(map.next_value()?);
                        }
                    }
                }
                let fingerprint =
                    fingerprint.ok_or_else(|| de::Error::missing_field("fingerprint"))?;
                let size_bytes =
                    size_bytes.ok_or_else(|| de::Error::missing_field("size_bytes"))?;
                Ok(Digest::new(
                    fingerprint,
                    size_bytes,
                    is_tree.unwrap_or(false),
                ))
            }
        }

        const FIELDS: &[&str] = &["fingerprint", "size_bytes", "is_tree"];
        deserializer.deserialize_struct("digest", FIELDS, DigestVisitor)
    }
}

///
/// The digest function used for all content exchanged with a store or an execution endpoint.
/// Chosen once at startup and threaded through every component; all digests within one run
/// use the same function.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestFunction {
    ///
    /// Matches the Bazel remote-execution protocol: SHA-256 over the raw bytes, for blobs
    /// and tree (`Directory` message) serialisations alike.
    ///
    Compatible,
    ///
    /// SHA-256 over a tagged preimage (`blob <size>\0` / `tree <size>\0` followed by the
    /// content), so blob and tree digests cannot collide.
    ///
    Native,
}

impl DigestFunction {
    pub fn blob_digest(&self, bytes: &[u8]) -> Digest {
        Digest::new(self.fingerprint("blob", bytes), bytes.len(), false)
    }

    pub fn tree_digest(&self, bytes: &[u8]) -> Digest {
        Digest::new(self.fingerprint("tree", bytes), bytes.len(), true)
    }

    pub fn empty_blob(&self) -> Digest {
        self.blob_digest(&[])
    }

    fn fingerprint(&self, tag: &str, bytes: &[u8]) -> Fingerprint {
        let mut hasher = Sha256::new();
        if let DigestFunction::Native = self {
            hasher.update(format!("{} {}\0", tag, bytes.len()).as_bytes());
        }
        hasher.update(bytes);
        Fingerprint(hasher.finalize().into())
    }
}

///
/// A Write instance that fingerprints all data that passes through it.
///
/// Computes the untagged (compatible-mode) fingerprint: callers verifying a native digest
/// must hash the complete content through `DigestFunction` instead.
///
pub struct WriterHasher<T> {
    hasher: Sha256,
    byte_count: usize,
    inner: T,
}

impl<T> WriterHasher<T> {
    pub fn new(inner: T) -> WriterHasher<T> {
        WriterHasher {
            hasher: Sha256::new(),
            byte_count: 0,
            inner: inner,
        }
    }

    ///
    /// Returns the result of fingerprinting this stream, and Drops the stream.
    ///
    pub fn finish(self) -> (Fingerprint, usize, T) {
        (
            Fingerprint(self.hasher.finalize().into()),
            self.byte_count,
            self.inner,
        )
    }
}

impl<W: Write> Write for WriterHasher<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        // Hash the bytes that were successfully written.
        self.hasher.update(&buf[0..written]);
        self.byte_count += written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests;
