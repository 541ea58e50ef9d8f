//! WAL recovery.
//!
//! Two passes over the segments in order:
//!
//! 1. Collect the set of transaction ids that reached a Commit record,
//!    truncating the log at the first corrupt or torn record.
//! 2. Stream the data records of committed transactions, in LSN order,
//!    to the caller's apply function.
//!
//! Records of aborted or unfinished transactions are discarded. Only
//! the committed-id set is held in memory, so replaying one huge
//! transaction stays within a bounded budget. Identical WALs produce
//! identical apply sequences.

use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};

use loam_core::{Lsn, Result, TxnId};
use tracing::{info, warn};

use crate::reader::{ScanItem, SegmentReader};
use crate::record::{RecordKind, WalRecord};
use crate::segment::{segments_in_order, truncate_segment};

/// Summary of one recovery run.
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    pub segments: usize,
    pub records_seen: u64,
    pub committed_txns: usize,
    pub applied: u64,
    /// Whether a torn or corrupt tail was truncated.
    pub truncated: bool,
    /// Highest LSN observed; the WAL reopens after it.
    pub max_lsn: Lsn,
}

/// Replay committed records with LSN greater than `from_lsn` through
/// `apply`. Returns the recovery summary; the caller reopens the WAL at
/// `stats.max_lsn`.
pub fn recover(
    dir: &Path,
    project: &str,
    from_lsn: Lsn,
    mut apply: impl FnMut(&WalRecord) -> Result<()>,
) -> Result<RecoveryStats> {
    let paths = segments_in_order(dir, project)?;
    let mut stats = RecoveryStats {
        segments: paths.len(),
        ..RecoveryStats::default()
    };

    // Pass 1: committed-transaction set, plus tail validation
    let mut committed: FxHashSet<TxnId> = FxHashSet::default();
    let mut usable: Vec<PathBuf> = Vec::new();
    'segments: for path in &paths {
        let mut reader = SegmentReader::open(path)?;
        loop {
            match reader.next_item()? {
                ScanItem::Record(record) => {
                    stats.records_seen += 1;
                    stats.max_lsn = stats.max_lsn.max(record.lsn);
                    if record.kind == RecordKind::Commit {
                        committed.insert(record.txn_id);
                    }
                }
                ScanItem::Eof => {
                    usable.push(path.clone());
                    break;
                }
                ScanItem::Torn { good_len, detail } => {
                    warn!(
                        segment = %path.display(),
                        good_len,
                        detail,
                        "truncating WAL at corrupt record"
                    );
                    truncate_segment(path, good_len)?;
                    stats.truncated = true;
                    usable.push(path.clone());
                    // Everything after the torn point is unreliable
                    break 'segments;
                }
            }
        }
    }
    stats.committed_txns = committed.len();

    // Pass 2: apply committed data records in LSN order
    for path in &usable {
        let mut reader = SegmentReader::open(path)?;
        loop {
            match reader.next_item()? {
                ScanItem::Record(record) => {
                    if record.lsn > from_lsn
                        && record.kind.is_data()
                        && committed.contains(&record.txn_id)
                    {
                        apply(&record)?;
                        stats.applied += 1;
                    }
                }
                ScanItem::Eof => break,
                // Pass 1 already truncated; a torn tail here means the
                // file changed underneath us
                ScanItem::Torn { detail, .. } => {
                    warn!(segment = %path.display(), detail, "tail changed during recovery");
                    break;
                }
            }
        }
    }

    info!(
        project,
        segments = stats.segments,
        records = stats.records_seen,
        applied = stats.applied,
        truncated = stats.truncated,
        "WAL recovery complete"
    );
    Ok(stats)
}
