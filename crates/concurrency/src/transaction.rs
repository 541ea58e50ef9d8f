//! Transaction records.

use rustc_hash::{FxHashMap, FxHashSet};
use std::time::Instant;

use loam_core::{IsolationLevel, Key, TxnId, TxnState};

use crate::snapshot::Snapshot;
use crate::version::WriteOp;

/// One transaction. Owned by the manager; callers hold only the id.
#[derive(Debug)]
pub struct Transaction {
    pub id: TxnId,
    pub isolation: IsolationLevel,
    pub state: TxnState,
    /// Bound at begin for RepeatableRead/Serializable. ReadCommitted
    /// re-samples per read; ReadUncommitted has no snapshot at all.
    pub snapshot: Option<Snapshot>,
    /// Sequence pinned in the snapshot registry until the transaction
    /// finishes.
    pub pinned_seq: loam_core::CommitSeq,
    pub read_set: FxHashSet<Key>,
    /// Write order is preserved: WAL records are emitted in the order
    /// the transaction issued its writes.
    writes: Vec<(Key, WriteOp)>,
    write_index: FxHashMap<Key, usize>,
    /// Total payload bytes staged; bounded by the engine's WAL budget.
    pub staged_bytes: u64,
    pub started_at: Instant,
}

impl Transaction {
    pub fn new(
        id: TxnId,
        isolation: IsolationLevel,
        snapshot: Option<Snapshot>,
        pinned_seq: loam_core::CommitSeq,
    ) -> Self {
        Transaction {
            id,
            isolation,
            state: TxnState::Active,
            snapshot,
            pinned_seq,
            read_set: FxHashSet::default(),
            writes: Vec::new(),
            write_index: FxHashMap::default(),
            staged_bytes: 0,
            started_at: Instant::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    /// Stage a write, replacing any earlier write to the same key (the
    /// earlier write keeps its position in the order).
    pub fn stage(&mut self, key: Key, op: WriteOp) {
        self.staged_bytes += op.payload_len() as u64;
        match self.write_index.get(&key) {
            Some(&idx) => {
                self.staged_bytes -= self.writes[idx].1.payload_len() as u64;
                self.writes[idx].1 = op;
            }
            None => {
                self.write_index.insert(key.clone(), self.writes.len());
                self.writes.push((key, op));
            }
        }
    }

    /// The staged write for `key`, honouring read-own-writes.
    pub fn staged(&self, key: &Key) -> Option<&WriteOp> {
        self.write_index.get(key).map(|&idx| &self.writes[idx].1)
    }

    pub fn writes(&self) -> &[(Key, WriteOp)] {
        &self.writes
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    pub fn write_keys(&self) -> impl Iterator<Item = &Key> {
        self.writes.iter().map(|(k, _)| k)
    }

    pub fn take_writes(&mut self) -> Vec<(Key, WriteOp)> {
        self.write_index.clear();
        std::mem::take(&mut self.writes)
    }
}
