//! MVCC transactions.
//!
//! Per-key version chains, snapshot visibility, and the transaction
//! manager that drives the WAL-then-storage commit pipeline. The
//! manager talks to the engine only through the [`CommitSink`] port:
//! subcomponents never reach back up into the engine.

pub mod manager;
pub mod sink;
pub mod snapshot;
pub mod transaction;
pub mod version;

pub use manager::{TransactionManager, TxnManagerStats};
pub use sink::CommitSink;
pub use snapshot::{Snapshot, SnapshotRegistry};
pub use transaction::Transaction;
pub use version::{Version, VersionStore, WriteOp};
