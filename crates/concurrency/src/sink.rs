//! The commit-sink port.
//!
//! The transaction manager never reaches up into the engine. The engine
//! hands an implementation of this trait into reads and commits; it is
//! how committed writes land in the data file and indexes, how cold
//! keys are loaded, and how the change bus hears about commits.

use loam_core::{CommitSeq, Key, Result};

use crate::version::WriteOp;

/// Engine-side effects of the transaction pipeline.
pub trait CommitSink: Send + Sync {
    /// Current committed payload for a key that has no version chain
    /// yet (document file via the primary index, or the KV store).
    fn load_baseline(&self, key: &Key) -> Result<Option<Vec<u8>>>;

    /// Write one committed mutation through to durable storage
    /// (data-file append plus index maintenance). Called in commit-
    /// sequence order, after the WAL fsync for the owning transaction.
    fn apply(&self, key: &Key, op: &WriteOp, seq: CommitSeq) -> Result<()>;

    /// Called once after every `apply` of a commit has run. The engine
    /// persists catalog changes (index roots) here, one rewrite per
    /// commit rather than one per touched index.
    fn commit_applied(&self, _seq: CommitSeq) -> Result<()> {
        Ok(())
    }

    /// Announce a committed mutation on the change bus. Called after
    /// `apply`, still in commit order.
    fn publish(&self, key: &Key, op: &WriteOp, seq: CommitSeq);
}

/// Sink that stores nothing. Used by tests exercising pure transaction
/// semantics.
#[derive(Debug, Default)]
pub struct NullSink;

impl CommitSink for NullSink {
    fn load_baseline(&self, _key: &Key) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn apply(&self, _key: &Key, _op: &WriteOp, _seq: CommitSeq) -> Result<()> {
        Ok(())
    }

    fn publish(&self, _key: &Key, _op: &WriteOp, _seq: CommitSeq) {}
}
