//! Background corruption scanning.
//!
//! Walks the data file's frames in bounded batches, re-verifying CRCs.
//! Corrupt frames are counted and reported for operators; the WAL and
//! replication are the recovery paths for their content. A CRC failure
//! on the foreground read path can trigger an immediate scan.

use parking_lot::Mutex;
use tracing::{info, warn};

use loam_core::config::HealingConfig;

use crate::engine::EngineShared;

pub struct HealState {
    resume: Mutex<u64>,
    max_batch: usize,
}

impl HealState {
    pub fn new(config: &HealingConfig) -> Self {
        HealState {
            resume: Mutex::new(0),
            max_batch: config.max_batch_per_scan.max(1),
        }
    }

    /// One bounded pass. Wraps to the start of the file after reaching
    /// the end, so every frame is eventually re-verified.
    pub fn scan(&self, shared: &EngineShared, triggered_by_read: bool) {
        let from = {
            let mut resume = self.resume.lock();
            if triggered_by_read {
                // Re-verify from the start when the foreground hit
                // corruption
                *resume = 0;
            }
            *resume
        };

        match shared.data.scan_frames(from, self.max_batch) {
            Ok(report) => {
                for offset in &report.corrupt {
                    warn!(offset, "healing scan found corrupt frame");
                }
                if !report.corrupt.is_empty() {
                    shared
                        .corrupt_frames
                        .fetch_add(report.corrupt.len() as u64, std::sync::atomic::Ordering::Relaxed);
                    info!(
                        verified = report.verified,
                        corrupt = report.corrupt.len(),
                        "healing scan pass complete"
                    );
                }
                *self.resume.lock() = report.resume_at.unwrap_or(0);
            }
            Err(e) => warn!(error = %e, "healing scan failed"),
        }
    }
}
