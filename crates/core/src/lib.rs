//! Core types shared by every Loam crate.
//!
//! This crate has no I/O and no background threads. It defines the
//! vocabulary of the system: identifiers, documents, the unified error
//! type, configuration records, and global limits.

pub mod config;
pub mod document;
pub mod error;
pub mod limits;
pub mod retry;
pub mod types;

pub use config::{
    CheckpointConfig, EngineOptions, FsyncMode, HealingConfig, ManagerConfig, MemoryConfig,
    PlatformConfig, PoolConfig, QueryConfig, ReplicationConfig, SchedulerConfig, WalOptions,
};
pub use document::{compare_values, Document};
pub use error::{Error, Result};
pub use types::{CommitSeq, IsolationLevel, Key, Lsn, ProjectId, TxnId, TxnState};
