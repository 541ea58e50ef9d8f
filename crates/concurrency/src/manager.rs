//! The transaction manager.
//!
//! Owns the active-transaction table, the version store, and the commit
//! pipeline. One manager per engine.
//!
//! # Commit pipeline
//!
//! 1. Under the commit mutex: first-committer-wins validation
//!    (Serializable only), commit-sequence assignment, WAL data records
//!    plus the Commit record, and committed-stamping of the
//!    transaction's versions.
//! 2. Outside the mutex: wait for the group-commit fsync.
//! 3. In sequence order: write through to storage via the
//!    [`CommitSink`], publish change events, and advance the published
//!    watermark that snapshots are taken against.
//!
//! Splitting "assigned" from "published" keeps the fsync out of the
//! commit mutex (group commit needs concurrent waiters) while readers
//! never observe sequence N before N-1.

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loam_core::{CommitSeq, Error, IsolationLevel, Key, Result, TxnId, TxnState};
use loam_durability::{RecordKind, Wal, WalRecord};
use tracing::{debug, error, warn};

use crate::sink::CommitSink;
use crate::snapshot::{Snapshot, SnapshotRegistry};
use crate::transaction::Transaction;
use crate::version::{VersionStore, WriteOp};

/// Counters surfaced through engine stats.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxnManagerStats {
    pub active: usize,
    pub commits: u64,
    pub rollbacks: u64,
    pub conflicts: u64,
    pub published_seq: CommitSeq,
    pub version_chains: usize,
    pub versions: usize,
}

/// Per-engine transaction manager.
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    last_assigned_seq: AtomicU64,
    published: Mutex<CommitSeq>,
    published_cv: Condvar,
    commit_mutex: Mutex<()>,
    active: RwLock<FxHashMap<TxnId, Arc<Mutex<Transaction>>>>,
    versions: VersionStore,
    snapshots: SnapshotRegistry,
    wal: Arc<Wal>,
    timeout: Duration,
    max_wal_bytes: u64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    conflicts: AtomicU64,
}

impl TransactionManager {
    pub fn new(wal: Arc<Wal>, timeout: Duration, max_wal_bytes: u64) -> Self {
        TransactionManager {
            next_txn_id: AtomicU64::new(1),
            last_assigned_seq: AtomicU64::new(0),
            published: Mutex::new(0),
            published_cv: Condvar::new(),
            commit_mutex: Mutex::new(()),
            active: RwLock::new(FxHashMap::default()),
            versions: VersionStore::new(),
            snapshots: SnapshotRegistry::new(),
            wal,
            timeout,
            max_wal_bytes,
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
        }
    }

    /// Start a transaction at the given isolation level.
    pub fn begin(&self, isolation: IsolationLevel) -> TxnId {
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let snapshot = match isolation {
            IsolationLevel::ReadUncommitted => None,
            IsolationLevel::ReadCommitted
            | IsolationLevel::RepeatableRead
            | IsolationLevel::Serializable => Some(self.snapshot_now()),
        };
        let pinned_seq = snapshot.as_ref().map(|s| s.seq).unwrap_or(0);
        self.snapshots.pin(pinned_seq);

        let txn = Transaction::new(id, isolation, snapshot, pinned_seq);
        self.active.write().insert(id, Arc::new(Mutex::new(txn)));
        debug!(txn = id, ?isolation, "transaction started");
        id
    }

    /// Read a key within a transaction. Precedence: own staged write,
    /// then the visible chain version, then the disk baseline.
    pub fn read(&self, txn_id: TxnId, key: &Key, sink: &dyn CommitSink) -> Result<Option<Vec<u8>>> {
        let txn_arc = self.lookup(txn_id)?;
        let mut txn = txn_arc.lock();
        self.enforce_deadline(&mut txn)?;

        if let Some(op) = txn.staged(key) {
            return Ok(op.payload().map(<[u8]>::to_vec));
        }
        txn.read_set.insert(key.clone());

        match txn.isolation {
            IsolationLevel::ReadUncommitted => match self.versions.tip(key) {
                Some(Some(version)) => Ok(version.op.payload().map(<[u8]>::to_vec)),
                Some(None) | None => sink.load_baseline(key),
            },
            IsolationLevel::ReadCommitted => {
                // A fresh snapshot per statement
                let snapshot = self.snapshot_now();
                self.read_snapshot(key, &snapshot, sink)
            }
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                let snapshot = txn.snapshot.clone().expect("snapshot bound at begin");
                self.read_snapshot(key, &snapshot, sink)
            }
        }
    }

    /// Query-scan read: the transaction's own staged write for `key`
    /// wins, otherwise the explicit statement snapshot decides. Keeps a
    /// whole scan on one consistent view while preserving
    /// read-own-writes.
    pub fn read_at(
        &self,
        txn_id: TxnId,
        key: &Key,
        snapshot: &Snapshot,
        sink: &dyn CommitSink,
    ) -> Result<Option<Vec<u8>>> {
        let txn_arc = self.lookup(txn_id)?;
        {
            let txn = txn_arc.lock();
            if let Some(op) = txn.staged(key) {
                return Ok(op.payload().map(<[u8]>::to_vec));
            }
        }
        self.read_snapshot(key, snapshot, sink)
    }

    /// Read against an explicit snapshot (used by query scans so one
    /// statement sees one consistent view).
    pub fn read_snapshot(
        &self,
        key: &Key,
        snapshot: &Snapshot,
        sink: &dyn CommitSink,
    ) -> Result<Option<Vec<u8>>> {
        match self.versions.visible(key, snapshot) {
            // No chain: the durable state predates every snapshot
            None => sink.load_baseline(key),
            Some(None) => Ok(None),
            Some(Some(version)) => Ok(version.op.payload().map(<[u8]>::to_vec)),
        }
    }

    /// Snapshot for the statement starting now.
    pub fn snapshot_now(&self) -> Snapshot {
        let seq = *self.published.lock();
        let in_flight: FxHashSet<TxnId> = self.active.read().keys().copied().collect();
        Snapshot {
            seq,
            in_flight: Arc::new(in_flight),
        }
    }

    /// Snapshot bound inside a transaction: the begin snapshot for
    /// RepeatableRead/Serializable, a fresh one otherwise.
    pub fn statement_snapshot(&self, txn_id: TxnId) -> Result<Snapshot> {
        let txn_arc = self.lookup(txn_id)?;
        let txn = txn_arc.lock();
        match txn.isolation {
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                Ok(txn.snapshot.clone().expect("snapshot bound at begin"))
            }
            _ => Ok(self.snapshot_now()),
        }
    }

    /// Stage a write. Visible to this transaction's own reads at once;
    /// to others only after commit (except ReadUncommitted tips).
    pub fn write(&self, txn_id: TxnId, key: Key, op: WriteOp, sink: &dyn CommitSink) -> Result<()> {
        let txn_arc = self.lookup(txn_id)?;
        let mut txn = txn_arc.lock();
        self.enforce_deadline(&mut txn)?;

        if !self.versions.has_chain(&key) {
            let baseline = sink.load_baseline(&key)?;
            self.versions.install_baseline(&key, baseline);
        }
        self.versions.install_uncommitted(&key, txn.id, op.clone());
        txn.stage(key, op);

        if txn.staged_bytes > self.max_wal_bytes {
            let id = txn.id;
            drop(txn);
            self.rollback_arc(&txn_arc);
            return Err(Error::InvalidArgument(format!(
                "transaction {} exceeds the per-transaction WAL budget",
                id
            )));
        }
        Ok(())
    }

    /// Commit: WAL, fsync, storage write-through, change events.
    pub fn commit(&self, txn_id: TxnId, sink: &dyn CommitSink) -> Result<CommitSeq> {
        let txn_arc = self.lookup(txn_id)?;
        let mut txn = txn_arc.lock();
        self.enforce_deadline(&mut txn)?;

        if txn.write_count() == 0 {
            let pinned = txn.pinned_seq;
            txn.state = TxnState::Committed;
            drop(txn);
            self.retire(txn_id, pinned);
            self.commits.fetch_add(1, Ordering::Relaxed);
            return Ok(*self.published.lock());
        }

        // Phase 1: validate, take a sequence, hit the WAL
        let seq = {
            let _commit = self.commit_mutex.lock();

            if txn.isolation == IsolationLevel::Serializable {
                let snapshot_seq = txn.snapshot.as_ref().expect("snapshot bound at begin").seq;
                let conflicted = txn.write_keys().find(|key| {
                    self.versions
                        .latest_committed_seq(key)
                        .map(|committed| committed > snapshot_seq)
                        .unwrap_or(false)
                });
                if let Some(key) = conflicted.cloned() {
                    drop(txn);
                    self.rollback_arc(&txn_arc);
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::SerializationConflict { key });
                }
            }

            let seq = self.last_assigned_seq.fetch_add(1, Ordering::AcqRel) + 1;
            let appended: Result<()> = (|| {
                for (key, op) in txn.writes() {
                    let (kind, payload) = match op {
                        WriteOp::Put(bytes) => (RecordKind::Insert, bytes.clone()),
                        WriteOp::Expire(bytes) => (RecordKind::Expire, bytes.clone()),
                        WriteOp::Delete => (RecordKind::Delete, Vec::new()),
                    };
                    self.wal
                        .append(WalRecord::data(kind, txn.id, key.encode(), payload))?;
                }
                self.wal
                    .append(WalRecord::control(RecordKind::Commit, txn.id))?;
                Ok(())
            })();
            if let Err(e) = appended {
                // The sequence is already assigned; release the
                // watermark with no effects or later commits wedge.
                error!(txn = txn_id, seq, error = %e, "commit WAL append failed");
                let keys: Vec<Key> = txn.write_keys().cloned().collect();
                let pinned = txn.pinned_seq;
                txn.state = TxnState::Aborted;
                drop(txn);
                self.publish_in_order(seq, || Ok(())).ok();
                self.versions.discard_txn(keys.into_iter(), txn_id);
                self.retire(txn_id, pinned);
                self.rollbacks.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }

            // Stamp versions now so later validators see this commit;
            // visibility still waits on the published watermark.
            for (key, _) in txn.writes() {
                self.versions.mark_committed(key, txn.id, seq);
            }
            seq
        };

        let writes = txn.take_writes();
        let pinned = txn.pinned_seq;
        txn.state = TxnState::Committed;
        drop(txn);

        // Phase 2: durability
        if let Err(e) = self.wal.commit_durable() {
            error!(txn = txn_id, error = %e, "commit fsync failed");
            // Advance the watermark with no effects so later commits
            // are not wedged, then drop the never-published versions.
            self.publish_in_order(seq, || Ok(())).ok();
            self.versions
                .discard_txn(writes.iter().map(|(k, _)| k.clone()), txn_id);
            self.retire(txn_id, pinned);
            self.rollbacks.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        // Phase 3: storage write-through and change events, in order
        let apply_result = self.publish_in_order(seq, || {
            for (key, op) in &writes {
                sink.apply(key, op, seq)?;
            }
            sink.commit_applied(seq)?;
            for (key, op) in &writes {
                sink.publish(key, op, seq);
            }
            Ok(())
        });

        self.retire(txn_id, pinned);
        match apply_result {
            Ok(()) => {
                self.commits.fetch_add(1, Ordering::Relaxed);
                Ok(seq)
            }
            Err(e) => {
                // The WAL already holds the commit; storage converges on
                // the next recovery replay.
                error!(txn = txn_id, seq, error = %e, "storage write-through failed");
                Err(e)
            }
        }
    }

    /// Roll back: an Abort record, discarded staging, retired id.
    pub fn rollback(&self, txn_id: TxnId) -> Result<()> {
        let txn_arc = self.lookup(txn_id)?;
        self.rollback_arc(&txn_arc);
        Ok(())
    }

    /// Force-abort every active transaction (engine shutdown).
    pub fn abort_all(&self) {
        let ids: Vec<TxnId> = self.active.read().keys().copied().collect();
        for id in ids {
            if let Ok(txn_arc) = self.lookup(id) {
                warn!(txn = id, "force-rolling back at shutdown");
                self.rollback_arc(&txn_arc);
            }
        }
    }

    /// Drop versions no live snapshot can reach. Returns how many were
    /// collected.
    pub fn collect_garbage(&self) -> usize {
        let upto = self
            .snapshots
            .oldest_pinned()
            .unwrap_or_else(|| *self.published.lock());
        self.versions.collect(upto)
    }

    pub fn is_active(&self, txn_id: TxnId) -> bool {
        self.active.read().contains_key(&txn_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    /// Published commit sequence: the newest state any reader can see.
    pub fn published_seq(&self) -> CommitSeq {
        *self.published.lock()
    }

    pub fn stats(&self) -> TxnManagerStats {
        TxnManagerStats {
            active: self.active.read().len(),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            published_seq: *self.published.lock(),
            version_chains: self.versions.chain_count(),
            versions: self.versions.version_count(),
        }
    }

    // --- internals ----------------------------------------------------

    fn lookup(&self, txn_id: TxnId) -> Result<Arc<Mutex<Transaction>>> {
        self.active
            .read()
            .get(&txn_id)
            .cloned()
            .ok_or(Error::TransactionNotActive(txn_id))
    }

    fn enforce_deadline(&self, txn: &mut Transaction) -> Result<()> {
        let elapsed = txn.started_at.elapsed();
        if elapsed <= self.timeout {
            return Ok(());
        }
        let id = txn.id;
        let pinned = txn.pinned_seq;
        txn.state = TxnState::Aborted;
        let keys: Vec<Key> = txn.write_keys().cloned().collect();
        self.versions.discard_txn(keys.into_iter(), id);
        let _ = self
            .wal
            .append(WalRecord::control(RecordKind::Abort, id));
        self.retire(id, pinned);
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        Err(Error::TransactionTimeout {
            elapsed_ms: elapsed.as_millis() as u64,
        })
    }

    fn rollback_arc(&self, txn_arc: &Arc<Mutex<Transaction>>) {
        let mut txn = txn_arc.lock();
        if !txn.is_active() {
            return;
        }
        txn.state = TxnState::Aborted;
        let id = txn.id;
        let pinned = txn.pinned_seq;
        let keys: Vec<Key> = txn.write_keys().cloned().collect();
        drop(txn);

        self.versions.discard_txn(keys.into_iter(), id);
        // The Abort record is not awaited: it exists so recovery can
        // tell an aborted transaction from a torn one deterministically.
        if let Err(e) = self.wal.append(WalRecord::control(RecordKind::Abort, id)) {
            warn!(txn = id, error = %e, "failed to log abort record");
        }
        self.retire(id, pinned);
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn retire(&self, txn_id: TxnId, pinned_seq: CommitSeq) {
        self.active.write().remove(&txn_id);
        self.snapshots.unpin(pinned_seq);
    }

    fn publish_in_order(&self, seq: CommitSeq, effects: impl FnOnce() -> Result<()>) -> Result<()> {
        let mut published = self.published.lock();
        while *published != seq - 1 {
            self.published_cv.wait(&mut published);
        }
        let result = effects();
        *published = seq;
        self.published_cv.notify_all();
        result
    }
}
