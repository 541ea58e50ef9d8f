//! Node roles and persisted hard state.
//!
//! `term` and `voted_for` must survive restarts or a node could vote
//! twice in one term. They are bincoded into `hard_state` in the raft
//! storage directory and rewritten atomically on every change.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use loam_core::{Error, Result};

use crate::message::NodeId;

/// Raft roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
}

/// The durable part of a node's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
}

const HARD_STATE_FILE: &str = "hard_state";

impl HardState {
    pub fn load(dir: &Path) -> Result<HardState> {
        let path = dir.join(HARD_STATE_FILE);
        if !path.exists() {
            return Ok(HardState::default());
        }
        let bytes = fs::read(&path)?;
        bincode::deserialize(&bytes).map_err(|e| Error::Corruption(format!("hard state: {}", e)))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join(HARD_STATE_FILE);
        let tmp: PathBuf = dir.join(format!("{}.tmp", HARD_STATE_FILE));
        let bytes = bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}
