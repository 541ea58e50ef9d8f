//! Unified error type for the platform.
//!
//! Every public API returns [`Result`]. The variants follow the error
//! taxonomy of the platform:
//!
//! - **Validation**: bad input; never retried.
//! - **NotFound**: the entity does not exist; never retried.
//! - **Conflict**: unique violation or serialization conflict; the caller
//!   may retry the whole transaction.
//! - **Transient**: timeouts and recoverable I/O; retried locally with
//!   backoff inside the WAL and network paths.
//! - **Critical**: corruption or unrecoverable I/O; poisons the owning
//!   transaction and surfaces to operators.
//! - **Lifecycle**: engine/pool/manager already closed; the caller must
//!   obtain a fresh handle.
//! - **Protocol**: malformed or oversized wire frames.
//!
//! Wire replies carry [`Error::code`], which is stable, and the `Display`
//! string, which never leaks file paths or pointers.

use std::io;
use thiserror::Error;

use crate::types::{Key, TxnId};

/// Result type alias for Loam operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the Loam platform.
#[derive(Debug, Error)]
pub enum Error {
    // --- Validation ---------------------------------------------------
    /// Malformed or oversized document payload.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// Malformed query filter or options.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Bad argument outside documents and queries (names, ids, options).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration record failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // --- NotFound -----------------------------------------------------
    /// Document does not exist (or is not visible to the snapshot).
    #[error("document not found: {key}")]
    DocumentNotFound { key: Key },

    /// Collection does not exist in the engine catalog.
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    /// Secondary index does not exist.
    #[error("index not found: {collection}.{field}")]
    IndexNotFound { collection: String, field: String },

    // --- Conflict -----------------------------------------------------
    /// Insert with an `_id` that already exists.
    #[error("duplicate document id: {key}")]
    DuplicateKey { key: Key },

    /// Collection create with a name that already exists.
    #[error("collection already exists: {0}")]
    CollectionExists(String),

    /// First-committer-wins validation failed under Serializable.
    #[error("serialization conflict on {key}")]
    SerializationConflict { key: Key },

    /// Operation on a transaction that is no longer active.
    #[error("transaction {0} is not active")]
    TransactionNotActive(TxnId),

    // --- Transient ----------------------------------------------------
    /// Recoverable condition; retried with capped backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Transaction exceeded its configured timeout and was rolled back.
    #[error("transaction timed out after {elapsed_ms} ms")]
    TransactionTimeout { elapsed_ms: u64 },

    // --- Critical -----------------------------------------------------
    /// I/O error from the filesystem or the network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// CRC mismatch or violated on-disk invariant.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Encoding or decoding failure (JSON, bincode).
    #[error("serialization error: {0}")]
    Serialization(String),

    // --- Lifecycle ----------------------------------------------------
    /// Engine has been closed; the handle is stale.
    #[error("engine is closed")]
    EngineClosed,

    /// Connection pool has no idle handle and is at max size.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Connection pool has been closed.
    #[error("connection pool is closed")]
    PoolClosed,

    /// Release of a handle that does not belong to this pool.
    #[error("connection does not belong to this pool")]
    ForeignConnection,

    /// Instance manager has been closed.
    #[error("instance manager is closed")]
    ManagerClosed,

    // --- Protocol -----------------------------------------------------
    /// Frame length exceeded the configured maximum.
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Opcode not recognised by this server.
    #[error("unknown opcode {0:#06x}")]
    UnknownOpcode(u16),

    /// Frame header or body did not parse.
    #[error("protocol error: {0}")]
    Protocol(String),

    // --- Replication --------------------------------------------------
    /// Operation requires the raft leader and this node is not it.
    #[error("not the leader")]
    NotLeader,
}

impl Error {
    /// Stable machine-readable code carried on wire replies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidDocument(_) => "validation/document",
            Error::InvalidQuery(_) => "validation/query",
            Error::InvalidArgument(_) => "validation/argument",
            Error::InvalidConfig(_) => "validation/config",
            Error::DocumentNotFound { .. } => "not_found/document",
            Error::CollectionNotFound(_) => "not_found/collection",
            Error::IndexNotFound { .. } => "not_found/index",
            Error::DuplicateKey { .. } => "conflict/duplicate_key",
            Error::CollectionExists(_) => "conflict/collection_exists",
            Error::SerializationConflict { .. } => "conflict/serialization",
            Error::TransactionNotActive(_) => "conflict/txn_not_active",
            Error::Transient(_) => "transient/general",
            Error::TransactionTimeout { .. } => "transient/txn_timeout",
            Error::Io(_) => "critical/io",
            Error::Corruption(_) => "critical/corruption",
            Error::Serialization(_) => "critical/serialization",
            Error::EngineClosed => "lifecycle/engine_closed",
            Error::PoolExhausted => "lifecycle/pool_exhausted",
            Error::PoolClosed => "lifecycle/pool_closed",
            Error::ForeignConnection => "lifecycle/foreign_connection",
            Error::ManagerClosed => "lifecycle/manager_closed",
            Error::FrameTooLarge { .. } => "protocol/frame_too_large",
            Error::UnknownOpcode(_) => "protocol/unknown_opcode",
            Error::Protocol(_) => "protocol/malformed",
            Error::NotLeader => "replication/not_leader",
        }
    }

    /// Whether a local retry with backoff is appropriate.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) | Error::TransactionTimeout { .. } => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Whether this is a commit-time conflict the caller should retry
    /// as a whole new transaction.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::SerializationConflict { .. }
                | Error::DuplicateKey { .. }
                | Error::CollectionExists(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::DocumentNotFound { .. }
                | Error::CollectionNotFound(_)
                | Error::IndexNotFound { .. }
        )
    }

    /// Critical errors poison the owning transaction and are surfaced to
    /// operators; corruption additionally queues the page for healing.
    pub fn is_critical(&self) -> bool {
        match self {
            Error::Corruption(_) | Error::Serialization(_) => true,
            Error::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(Error::Transient("slow disk".into()).is_transient());
        assert!(Error::SerializationConflict { key: Key::kv("a") }.is_conflict());
        assert!(Error::CollectionNotFound("c".into()).is_not_found());
        assert!(Error::Corruption("bad crc".into()).is_critical());
        assert!(!Error::EngineClosed.is_transient());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::EngineClosed.code(), "lifecycle/engine_closed");
        assert_eq!(
            Error::FrameTooLarge { size: 1, max: 0 }.code(),
            "protocol/frame_too_large"
        );
    }

    #[test]
    fn io_timeouts_are_transient_not_critical() {
        let e = Error::Io(io::Error::new(io::ErrorKind::TimedOut, "t"));
        assert!(e.is_transient());
        assert!(!e.is_critical());

        let e = Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "t"));
        assert!(e.is_critical());
    }
}
