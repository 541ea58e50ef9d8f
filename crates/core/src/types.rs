//! Identifiers and small value types used across the platform.
//!
//! Every engine-visible entity is addressed by one of the types here:
//! projects by [`ProjectId`], storage slots by [`Key`], transactions by
//! [`TxnId`]. Keeping these in one place keeps the crates below free of
//! stringly-typed plumbing.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Monotonic transaction identifier, unique within one engine.
pub type TxnId = u64;

/// Log sequence number. Strictly increasing across all WAL records of
/// one engine, regardless of transaction.
pub type Lsn = u64;

/// Commit sequence number. Assigned under the engine's commit mutex, so
/// commits are totally ordered by it.
pub type CommitSeq = u64;

/// Tenant identifier. One engine is opened per project id.
///
/// Project ids become directory names under the data root, so the
/// constructor rejects anything that cannot be a safe path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidArgument("project id must not be empty".into()));
        }
        if id.len() > 128 {
            return Err(Error::InvalidArgument(format!(
                "project id too long: {} bytes (max 128)",
                id.len()
            )));
        }
        if id
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c == '.')
        {
            return Err(Error::InvalidArgument(format!(
                "project id {:?} contains a path separator or reserved character",
                id
            )));
        }
        Ok(ProjectId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// Isolation levels supported by the transaction manager.
///
/// See the manager for the exact read rules. `Serializable` adds
/// first-committer-wins validation on top of `RepeatableRead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

/// Namespaced storage key.
///
/// The WAL, the MVCC version store and the change bus all address state
/// through `Key`. Two namespaces exist: document slots (collection +
/// document id) and the auxiliary key/value surface used by neighbouring
/// services.
///
/// # Encoding
///
/// ```text
/// document: 'd' | collection | 0x00 | id
/// kv:       'k' | key
/// ```
///
/// Collection names and document ids reject the 0x00 separator at
/// validation time, so decoding splits at the first NUL unambiguously.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Key {
    Document { collection: String, id: String },
    Kv { key: String },
}

const KEY_TAG_DOCUMENT: u8 = b'd';
const KEY_TAG_KV: u8 = b'k';

impl Key {
    pub fn document(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Key::Document {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn kv(key: impl Into<String>) -> Self {
        Key::Kv { key: key.into() }
    }

    /// Collection this key belongs to, if it is a document key.
    pub fn collection(&self) -> Option<&str> {
        match self {
            Key::Document { collection, .. } => Some(collection),
            Key::Kv { .. } => None,
        }
    }

    /// Serialize to the WAL byte form.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Key::Document { collection, id } => {
                let mut out = Vec::with_capacity(2 + collection.len() + id.len());
                out.push(KEY_TAG_DOCUMENT);
                out.extend_from_slice(collection.as_bytes());
                out.push(0);
                out.extend_from_slice(id.as_bytes());
                out
            }
            Key::Kv { key } => {
                let mut out = Vec::with_capacity(1 + key.len());
                out.push(KEY_TAG_KV);
                out.extend_from_slice(key.as_bytes());
                out
            }
        }
    }

    /// Parse the WAL byte form back into a key.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&tag, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::Corruption("empty storage key".into()))?;
        match tag {
            KEY_TAG_DOCUMENT => {
                let sep = rest
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| Error::Corruption("document key missing separator".into()))?;
                let collection = std::str::from_utf8(&rest[..sep])
                    .map_err(|_| Error::Corruption("document key is not utf-8".into()))?;
                let id = std::str::from_utf8(&rest[sep + 1..])
                    .map_err(|_| Error::Corruption("document key is not utf-8".into()))?;
                Ok(Key::document(collection, id))
            }
            KEY_TAG_KV => {
                let key = std::str::from_utf8(rest)
                    .map_err(|_| Error::Corruption("kv key is not utf-8".into()))?;
                Ok(Key::kv(key))
            }
            other => Err(Error::Corruption(format!("unknown key tag {:#04x}", other))),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Document { collection, id } => write!(f, "{}/{}", collection, id),
            Key::Kv { key } => write!(f, "kv/{}", key),
        }
    }
}

/// Validate a collection name: used as a directory component and inside
/// encoded keys.
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("collection name must not be empty".into()));
    }
    if name.len() > 255 {
        return Err(Error::InvalidArgument(format!(
            "collection name too long: {} bytes (max 255)",
            name.len()
        )));
    }
    if name.starts_with('_') {
        return Err(Error::InvalidArgument(format!(
            "collection name {:?} uses the reserved '_' prefix",
            name
        )));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == '\\' || c == '\0' || c == '.')
    {
        return Err(Error::InvalidArgument(format!(
            "collection name {:?} contains a reserved character",
            name
        )));
    }
    Ok(())
}

/// Validate a document id supplied by a caller.
pub fn validate_document_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidArgument("document id must not be empty".into()));
    }
    if id.len() > 512 {
        return Err(Error::InvalidArgument(format!(
            "document id too long: {} bytes (max 512)",
            id.len()
        )));
    }
    if id.contains('\0') {
        return Err(Error::InvalidArgument("document id contains NUL".into()));
    }
    Ok(())
}
