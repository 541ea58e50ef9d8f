//! Snapshots and the garbage-collection watermark.
//!
//! A snapshot is an immutable token: the commit sequence it was taken
//! at plus the transactions in flight at that moment. A version is
//! visible iff its creator committed at or before the snapshot sequence
//! and was not in flight when the snapshot was taken.

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::sync::Arc;

use loam_core::{CommitSeq, TxnId};

/// Stable view of committed data as of `seq`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub seq: CommitSeq,
    /// Transactions active when the snapshot was taken. Shared because
    /// many snapshots are minted per second under ReadCommitted.
    pub in_flight: Arc<FxHashSet<TxnId>>,
}

/// Tracks which snapshot sequences are still pinned by live
/// transactions, so the garbage collector knows the oldest sequence any
/// reader can still demand.
#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    pins: Mutex<BTreeMap<CommitSeq, usize>>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        SnapshotRegistry::default()
    }

    /// Pin `seq` for the lifetime of a transaction.
    pub fn pin(&self, seq: CommitSeq) {
        *self.pins.lock().entry(seq).or_insert(0) += 1;
    }

    /// Release one pin on `seq`.
    pub fn unpin(&self, seq: CommitSeq) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&seq);
            }
        }
    }

    /// Oldest pinned sequence, or `None` when no reader is live.
    pub fn oldest_pinned(&self) -> Option<CommitSeq> {
        self.pins.lock().keys().next().copied()
    }
}
