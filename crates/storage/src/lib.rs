//! Storage primitives: the document data file, the buffer pool, and the
//! B+Tree used for primary and secondary indexes.
//!
//! Everything here is per-engine. Durability of logical state is the
//! WAL's job; these files are the replayable projection of it, which is
//! why tree and data-file writes do not fsync individually (checkpoints
//! do).

pub mod btree;
pub mod buffer;
pub mod datafile;

pub use btree::{encode_f64_key, BTree, Comparator};
pub use buffer::{BufferPool, BufferPoolStats};
pub use datafile::{DataFile, StoragePointer};
