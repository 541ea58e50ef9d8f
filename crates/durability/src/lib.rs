//! Write-ahead log.
//!
//! Append-only, CRC-checksummed records in segmented files with
//! group-commit batching and deterministic recovery. One WAL per engine;
//! the auxiliary key/value surface shares it through namespaced keys.
//!
//! # Layout on disk
//!
//! ```text
//! wal/<project>.wal        active segment
//! wal/<project>.wal.<n>    rotated segments, monotonic n
//! ```
//!
//! Segments contain nothing but records; see [`record`] for the
//! bit-exact framing.

pub mod flusher;
pub mod reader;
pub mod record;
pub mod recovery;
pub mod segment;
pub mod writer;

pub use record::{RecordKind, WalRecord, WalRecordError, RECORD_HEADER_SIZE, TXN_ENVELOPE_SIZE};
pub use recovery::{recover, RecoveryStats};
pub use writer::{Wal, WalStats};
