//! Core type definitions for Tessera
//!
//! Partition names and partition-relative paths, with the validation and
//! encoding rules shared by the journal, the caches and the on-disk layout.

use crate::error::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Name of the per-partition directory holding in-flight transactions
pub const TRANSACTIONS_DIR: &str = "transactions";

/// Name of the root directory holding all partitions
pub const PARTITIONS_DIR: &str = "partitions";

/// Suffixes reserved for crash markers of safe single-file writes
pub const RESERVED_SUFFIXES: [&str; 3] = [".$", ".R", ".RM"];

/// Encode an arbitrary string as a single filesystem-safe path component
pub fn encode_component(raw: &[u8]) -> String {
    URL_SAFE.encode(raw)
}

/// Decode a component produced by [`encode_component`]
pub fn decode_component(encoded: &str) -> Result<Vec<u8>> {
    URL_SAFE
        .decode(encoded)
        .map_err(|e| Error::Deserialization(format!("bad path component {encoded:?}: {e}")))
}

/// Name of a partition
///
/// Arbitrary strings are allowed; on disk the name is stored base64url-encoded.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionName(String);

impl PartitionName {
    /// Create a partition name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Decode from an on-disk directory name
    pub fn from_dir_name(dir_name: &str) -> Result<Self> {
        let raw = decode_component(dir_name)?;
        let name = String::from_utf8(raw)
            .map_err(|e| Error::Deserialization(format!("partition name is not utf-8: {e}")))?;
        Ok(Self(name))
    }

    /// On-disk directory name
    pub fn dir_name(&self) -> String {
        encode_component(self.0.as_bytes())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A validated path relative to a partition directory
///
/// Only normal components are allowed, the reserved `transactions` directory
/// cannot be addressed, and no component may end in a safe-write marker suffix.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelPath(String);

impl RelPath {
    /// Validate and normalize a relative path (separators become `/`)
    pub fn new(path: impl AsRef<str>) -> Result<Self> {
        let raw = path.as_ref();
        let invalid = || Error::InvalidPath(raw.to_string());

        let mut parts = Vec::new();
        for component in Path::new(raw).components() {
            match component {
                Component::Normal(part) => {
                    let part = part.to_str().ok_or_else(invalid)?;
                    if RESERVED_SUFFIXES.iter().any(|s| part.ends_with(s)) {
                        return Err(invalid());
                    }
                    parts.push(part);
                }
                Component::CurDir => {}
                _ => return Err(invalid()),
            }
        }

        if parts.is_empty() || parts[0] == TRANSACTIONS_DIR {
            return Err(invalid());
        }
        Ok(Self(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve against a base directory
    pub fn to_path(&self, base: &Path) -> PathBuf {
        self.0.split('/').fold(base.to_path_buf(), |p, c| p.join(c))
    }

    /// Join a further relative component
    pub fn join(&self, tail: impl AsRef<str>) -> Result<Self> {
        Self::new(format!("{}/{}", self.0, tail.as_ref()))
    }

    /// Whether `self` equals `other` or lies beneath it
    pub fn starts_with(&self, other: &RelPath) -> bool {
        self.0 == other.0
            || (self.0.len() > other.0.len()
                && self.0.starts_with(&other.0)
                && self.0.as_bytes()[other.0.len()] == b'/')
    }

    /// Replace the `from` prefix with `to`; `None` if `self` is not under `from`
    pub fn rebase(&self, from: &RelPath, to: &RelPath) -> Option<RelPath> {
        if !self.starts_with(from) {
            return None;
        }
        let suffix = &self.0[from.0.len()..];
        Some(RelPath(format!("{}{}", to.0, suffix)))
    }
}

impl TryFrom<String> for RelPath {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<RelPath> for String {
    fn from(p: RelPath) -> Self {
        p.0
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
