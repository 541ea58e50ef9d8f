//! Version chains.
//!
//! Each key written since engine open has a chain of versions in append
//! order. Commit sequence numbers are assigned in that same order, so a
//! chain's committed versions are sorted by sequence. The committed
//! on-disk value from before the first in-memory overwrite is kept as a
//! *baseline* version at sequence zero, which every snapshot can see.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use loam_core::{CommitSeq, Key, TxnId};

use crate::snapshot::Snapshot;

/// Baseline versions carry this transaction id.
pub const BASELINE_TXN: TxnId = 0;

/// A versioned mutation. `Expire` behaves like `Put` for visibility;
/// it exists so the WAL records the refreshed time-to-live envelope
/// under its own record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put(Vec<u8>),
    Expire(Vec<u8>),
    Delete,
}

impl WriteOp {
    /// Payload visible to readers; `None` marks a tombstone.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            WriteOp::Put(bytes) | WriteOp::Expire(bytes) => Some(bytes),
            WriteOp::Delete => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, WriteOp::Delete)
    }

    pub fn payload_len(&self) -> usize {
        self.payload().map(<[u8]>::len).unwrap_or(0)
    }
}

/// One version in a chain.
#[derive(Debug, Clone)]
pub struct Version {
    pub txn_id: TxnId,
    /// `None` while the creating transaction is active.
    pub commit_seq: Option<CommitSeq>,
    pub op: WriteOp,
}

impl Version {
    fn committed_at(&self) -> Option<CommitSeq> {
        self.commit_seq
    }
}

#[derive(Debug, Default)]
struct Chain {
    versions: Vec<Version>,
}

impl Chain {
    /// Newest version visible to `snapshot`.
    fn visible(&self, snapshot: &Snapshot) -> Option<&Version> {
        self.versions
            .iter()
            .rev()
            .find(|v| match v.committed_at() {
                Some(seq) => seq <= snapshot.seq && !snapshot.in_flight.contains(&v.txn_id),
                None => false,
            })
    }

    fn tip(&self) -> Option<&Version> {
        self.versions.last()
    }

    fn latest_committed_seq(&self) -> Option<CommitSeq> {
        self.versions.iter().rev().find_map(Version::committed_at)
    }
}

/// All version chains of one engine.
#[derive(Debug, Default)]
pub struct VersionStore {
    chains: RwLock<FxHashMap<Key, Chain>>,
}

impl VersionStore {
    pub fn new() -> Self {
        VersionStore::default()
    }

    pub fn has_chain(&self, key: &Key) -> bool {
        self.chains.read().contains_key(key)
    }

    /// Seed a chain with the committed on-disk value, so snapshots taken
    /// before the upcoming overwrite keep reading it. No-op when a chain
    /// already exists.
    pub fn install_baseline(&self, key: &Key, payload: Option<Vec<u8>>) {
        let mut chains = self.chains.write();
        let chain = chains.entry(key.clone()).or_default();
        if chain.versions.is_empty() {
            let op = match payload {
                Some(bytes) => WriteOp::Put(bytes),
                None => WriteOp::Delete,
            };
            chain.versions.push(Version {
                txn_id: BASELINE_TXN,
                commit_seq: Some(0),
                op,
            });
        }
    }

    /// Install or replace the uncommitted version of `txn_id` for `key`.
    pub fn install_uncommitted(&self, key: &Key, txn_id: TxnId, op: WriteOp) {
        let mut chains = self.chains.write();
        let chain = chains.entry(key.clone()).or_default();
        if let Some(existing) = chain
            .versions
            .iter_mut()
            .find(|v| v.commit_seq.is_none() && v.txn_id == txn_id)
        {
            existing.op = op;
        } else {
            chain.versions.push(Version {
                txn_id,
                commit_seq: None,
                op,
            });
        }
    }

    /// Stamp the uncommitted version of `txn_id` at `key` with its
    /// commit sequence and move it to the chain tail, preserving commit
    /// order within the chain.
    pub fn mark_committed(&self, key: &Key, txn_id: TxnId, seq: CommitSeq) {
        let mut chains = self.chains.write();
        if let Some(chain) = chains.get_mut(key) {
            if let Some(idx) = chain
                .versions
                .iter()
                .position(|v| v.commit_seq.is_none() && v.txn_id == txn_id)
            {
                let mut version = chain.versions.remove(idx);
                version.commit_seq = Some(seq);
                chain.versions.push(version);
            }
        }
    }

    /// Remove every version a transaction installed, whatever its
    /// commit state. Used on rollback and when a commit fails after
    /// sequence assignment (its versions were never published).
    pub fn discard_txn(&self, keys: impl Iterator<Item = Key>, txn_id: TxnId) {
        debug_assert_ne!(txn_id, BASELINE_TXN);
        let mut chains = self.chains.write();
        for key in keys {
            if let Some(chain) = chains.get_mut(&key) {
                chain.versions.retain(|v| v.txn_id != txn_id);
                if chain.versions.is_empty() {
                    chains.remove(&key);
                }
            }
        }
    }

    /// Newest version visible to `snapshot`, if the key has a chain.
    /// `None` means "no chain", where the caller falls back to disk.
    pub fn visible(&self, key: &Key, snapshot: &Snapshot) -> Option<Option<Version>> {
        let chains = self.chains.read();
        chains
            .get(key)
            .map(|chain| chain.visible(snapshot).cloned())
    }

    /// Chain tip regardless of commit state (ReadUncommitted).
    pub fn tip(&self, key: &Key) -> Option<Option<Version>> {
        let chains = self.chains.read();
        chains.get(key).map(|chain| chain.tip().cloned())
    }

    /// Sequence of the newest committed version, for first-committer-
    /// wins validation.
    pub fn latest_committed_seq(&self, key: &Key) -> Option<CommitSeq> {
        self.chains.read().get(key).and_then(Chain::latest_committed_seq)
    }

    /// Drop committed versions strictly older than the newest committed
    /// version at or below `upto`. That newest version is retained as
    /// the baseline for snapshots at `upto`; uncommitted versions are
    /// untouched.
    pub fn collect(&self, upto: CommitSeq) -> usize {
        let mut chains = self.chains.write();
        let mut dropped = 0;
        for chain in chains.values_mut() {
            let keep_from = chain
                .versions
                .iter()
                .rev()
                .find_map(|v| v.committed_at().filter(|seq| *seq <= upto));
            if let Some(baseline_seq) = keep_from {
                let before = chain.versions.len();
                chain
                    .versions
                    .retain(|v| match v.committed_at() {
                        Some(seq) => seq >= baseline_seq,
                        None => true,
                    });
                dropped += before - chain.versions.len();
            }
        }
        dropped
    }

    pub fn chain_count(&self) -> usize {
        self.chains.read().len()
    }

    pub fn version_count(&self) -> usize {
        self.chains.read().values().map(|c| c.versions.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;
    use std::sync::Arc;

    fn snapshot(seq: CommitSeq) -> Snapshot {
        Snapshot {
            seq,
            in_flight: Arc::new(FxHashSet::default()),
        }
    }

    #[test]
    fn visibility_follows_commit_seq() {
        let store = VersionStore::new();
        let key = Key::kv("k");

        store.install_baseline(&key, Some(b"v0".to_vec()));
        store.install_uncommitted(&key, 7, WriteOp::Put(b"v1".to_vec()));

        // Uncommitted writes are invisible to snapshots
        let visible = store.visible(&key, &snapshot(10)).unwrap().unwrap();
        assert_eq!(visible.op.payload(), Some(&b"v0"[..]));

        store.mark_committed(&key, 7, 5);
        let visible = store.visible(&key, &snapshot(10)).unwrap().unwrap();
        assert_eq!(visible.op.payload(), Some(&b"v1"[..]));

        // An older snapshot still reads the baseline
        let visible = store.visible(&key, &snapshot(4)).unwrap().unwrap();
        assert_eq!(visible.op.payload(), Some(&b"v0"[..]));
    }

    #[test]
    fn tip_sees_uncommitted() {
        let store = VersionStore::new();
        let key = Key::kv("k");
        store.install_uncommitted(&key, 3, WriteOp::Put(b"dirty".to_vec()));

        let tip = store.tip(&key).unwrap().unwrap();
        assert_eq!(tip.op.payload(), Some(&b"dirty"[..]));
        assert_eq!(tip.commit_seq, None);
    }

    #[test]
    fn discard_removes_aborted_writes() {
        let store = VersionStore::new();
        let key = Key::kv("k");
        store.install_baseline(&key, Some(b"v0".to_vec()));
        store.install_uncommitted(&key, 3, WriteOp::Put(b"doomed".to_vec()));
        store.discard_txn(std::iter::once(key.clone()), 3);

        let visible = store.visible(&key, &snapshot(10)).unwrap().unwrap();
        assert_eq!(visible.op.payload(), Some(&b"v0"[..]));
    }

    #[test]
    fn collect_keeps_newest_at_or_below_watermark() {
        let store = VersionStore::new();
        let key = Key::kv("k");
        store.install_baseline(&key, Some(b"v0".to_vec()));
        for (txn, seq, val) in [(2u64, 2u64, "v2"), (3, 3, "v3"), (4, 9, "v9")] {
            store.install_uncommitted(&key, txn, WriteOp::Put(val.as_bytes().to_vec()));
            store.mark_committed(&key, txn, seq);
        }

        // Oldest live snapshot at seq 3: baseline v0 and v2 are dead
        let dropped = store.collect(3);
        assert_eq!(dropped, 2);

        let visible = store.visible(&key, &snapshot(3)).unwrap().unwrap();
        assert_eq!(visible.op.payload(), Some(&b"v3"[..]));
        let visible = store.visible(&key, &snapshot(9)).unwrap().unwrap();
        assert_eq!(visible.op.payload(), Some(&b"v9"[..]));
    }

    #[test]
    fn same_txn_rewrite_replaces_uncommitted_version() {
        let store = VersionStore::new();
        let key = Key::kv("k");
        store.install_uncommitted(&key, 3, WriteOp::Put(b"a".to_vec()));
        store.install_uncommitted(&key, 3, WriteOp::Put(b"b".to_vec()));
        assert_eq!(store.version_count(), 1);
    }
}
