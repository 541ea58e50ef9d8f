//! Configuration records.
//!
//! The platform consumes validated configuration constructed by its
//! embedder; there is no file or environment parsing here. Every struct
//! derives serde with `deny_unknown_fields`, so a record deserialized
//! from an embedder's own config source rejects unrecognised options.
//!
//! Durations are carried as integer milliseconds to keep the serde form
//! unambiguous; accessors convert to [`Duration`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// WAL fsync policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncMode {
    /// fsync after every record.
    Always,
    /// Group commit: one fsync per batch of commit intents.
    Group,
    /// fsync on a fixed interval.
    Interval,
    /// No fsync. Benchmarks only.
    None,
}

impl Default for FsyncMode {
    fn default() -> Self {
        FsyncMode::Group
    }
}

/// Write-ahead-log options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WalOptions {
    /// Segment rotation threshold in MiB.
    pub max_segment_mib: u64,
    pub fsync: FsyncMode,
    /// Flush a group-commit batch at this many intents.
    pub group_batch_size: usize,
    /// Flush a group-commit batch after this long even if under-full.
    pub group_batch_interval_ms: u64,
    /// Delete rotated segments wholly below the checkpoint LSN.
    pub trim_after_checkpoint: bool,
    /// Rotated segments to keep regardless of trimming.
    pub keep_segments: usize,
}

impl Default for WalOptions {
    fn default() -> Self {
        WalOptions {
            max_segment_mib: 64,
            fsync: FsyncMode::default(),
            group_batch_size: 100,
            group_batch_interval_ms: 3,
            trim_after_checkpoint: true,
            keep_segments: 2,
        }
    }
}

impl WalOptions {
    pub fn max_segment_bytes(&self) -> u64 {
        self.max_segment_mib * 1024 * 1024
    }

    pub fn group_batch_interval(&self) -> Duration {
        Duration::from_millis(self.group_batch_interval_ms)
    }
}

/// Buffer-pool memory caps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MemoryConfig {
    /// Process-wide resident budget in MiB.
    pub global_mib: u64,
    /// Per-engine resident budget in MiB.
    pub per_engine_mib: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            global_mib: 1024,
            per_engine_mib: 128,
        }
    }
}

/// Checkpoint policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CheckpointConfig {
    /// Take a checkpoint after this many MiB of WAL growth.
    pub interval_mib: u64,
    pub auto_create: bool,
    pub max_retained: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            interval_mib: 64,
            auto_create: true,
            max_retained: 3,
        }
    }
}

/// Background scheduler sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SchedulerConfig {
    pub queue_depth: usize,
    pub worker_count: usize,
    /// Concurrent foreground operations admitted per engine.
    pub max_concurrent_ops: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            queue_depth: 256,
            worker_count: 2,
            max_concurrent_ops: 64,
        }
    }
}

/// Instance-manager knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ManagerConfig {
    /// Soft cap on simultaneously open engines.
    pub max_hot_engines: usize,
    /// Idle time before a refcount-zero slot becomes evictable.
    pub idle_ttl_ms: u64,
    /// Eviction scan period.
    pub evict_interval_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            max_hot_engines: 64,
            idle_ttl_ms: 10 * 60 * 1000,
            evict_interval_ms: 60 * 1000,
        }
    }
}

impl ManagerConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    pub fn evict_interval(&self) -> Duration {
        Duration::from_millis(self.evict_interval_ms)
    }
}

/// Per-engine connection-pool knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub idle_timeout_ms: u64,
    pub health_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_size: 1,
            max_size: 16,
            idle_timeout_ms: 5 * 60 * 1000,
            health_interval_ms: 30 * 1000,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}

/// Query-engine limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueryConfig {
    pub max_partitions: usize,
    pub max_concurrent_queries: usize,
    pub timeout_ms: u64,
    /// Clamp on `limit` and `skip`.
    pub max_result_limit: usize,
    /// Per-engine WAL budget for a single transaction's writes.
    pub max_wal_bytes: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            max_partitions: 8,
            max_concurrent_queries: 32,
            timeout_ms: 30_000,
            max_result_limit: crate::limits::MAX_RESULT_LIMIT,
            max_wal_bytes: 256 * 1024 * 1024,
        }
    }
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Background corruption-healing knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HealingConfig {
    pub enabled: bool,
    pub scan_interval_ms: u64,
    /// Queue a page for healing when a read fails its CRC.
    pub trigger_on_read_corruption: bool,
    /// Frames verified per scan pass.
    pub max_batch_per_scan: usize,
}

impl Default for HealingConfig {
    fn default() -> Self {
        HealingConfig {
            enabled: true,
            scan_interval_ms: 60 * 1000,
            trigger_on_read_corruption: true,
            max_batch_per_scan: 1024,
        }
    }
}

/// Replication (raft) knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationConfig {
    #[serde(default = "default_election_min_ms")]
    pub election_min_ms: u64,
    #[serde(default = "default_election_max_ms")]
    pub election_max_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Directory for the raft log and hard state. The raft log is
    /// physically separate from the engine WAL.
    pub storage_path: PathBuf,
}

fn default_election_min_ms() -> u64 {
    150
}

fn default_election_max_ms() -> u64 {
    300
}

fn default_heartbeat_ms() -> u64 {
    50
}

/// Options for one engine open. A subset of the platform config scoped
/// to a single project.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineOptions {
    pub wal: WalOptions,
    pub memory: MemoryConfig,
    pub checkpoint: CheckpointConfig,
    pub scheduler: SchedulerConfig,
    pub query: QueryConfig,
    pub healing: HealingConfig,
}

impl EngineOptions {
    pub fn validate(&self) -> Result<()> {
        if self.wal.max_segment_mib == 0 {
            return Err(Error::InvalidConfig("wal.max_segment_mib must be > 0".into()));
        }
        if self.wal.group_batch_size == 0 {
            return Err(Error::InvalidConfig("wal.group_batch_size must be > 0".into()));
        }
        if self.memory.per_engine_mib == 0 {
            return Err(Error::InvalidConfig("memory.per_engine_mib must be > 0".into()));
        }
        if self.query.max_result_limit == 0
            || self.query.max_result_limit > crate::limits::MAX_RESULT_LIMIT
        {
            return Err(Error::InvalidConfig(format!(
                "query.max_result_limit must be in 1..={}",
                crate::limits::MAX_RESULT_LIMIT
            )));
        }
        if self.scheduler.worker_count == 0 {
            return Err(Error::InvalidConfig("scheduler.worker_count must be > 0".into()));
        }
        Ok(())
    }
}

/// Top-level platform configuration consumed by the instance manager
/// and the network front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PlatformConfig {
    /// Root under which per-project subtrees live.
    pub data_root: PathBuf,
    pub engine: EngineOptions,
    pub manager: ManagerConfig,
    pub pool: PoolConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationConfig>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            data_root: PathBuf::from("loam-data"),
            engine: EngineOptions::default(),
            manager: ManagerConfig::default(),
            pool: PoolConfig::default(),
            replication: None,
        }
    }
}

impl PlatformConfig {
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        if self.pool.min_size > self.pool.max_size {
            return Err(Error::InvalidConfig(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                self.pool.min_size, self.pool.max_size
            )));
        }
        if self.pool.max_size == 0 {
            return Err(Error::InvalidConfig("pool.max_size must be > 0".into()));
        }
        if self.manager.max_hot_engines == 0 {
            return Err(Error::InvalidConfig("manager.max_hot_engines must be > 0".into()));
        }
        if let Some(repl) = &self.replication {
            if repl.election_min_ms == 0 || repl.election_min_ms >= repl.election_max_ms {
                return Err(Error::InvalidConfig(
                    "replication election window must satisfy 0 < min < max".into(),
                ));
            }
            if repl.heartbeat_ms >= repl.election_min_ms {
                return Err(Error::InvalidConfig(
                    "replication heartbeat must be shorter than the election minimum".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        PlatformConfig::default().validate().unwrap();
    }

    #[test]
    fn unknown_options_rejected() {
        let parsed: std::result::Result<WalOptions, _> =
            serde_json::from_str(r#"{"max_segment_mib": 8, "surprise": true}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn pool_bounds_checked() {
        let mut config = PlatformConfig::default();
        config.pool.min_size = 9;
        config.pool.max_size = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn replication_window_checked() {
        let mut config = PlatformConfig::default();
        config.replication = Some(ReplicationConfig {
            election_min_ms: 300,
            election_max_ms: 150,
            heartbeat_ms: 50,
            storage_path: "raft".into(),
        });
        assert!(config.validate().is_err());
    }
}
