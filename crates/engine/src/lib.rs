//! The project engine.
//!
//! Bundles WAL, storage, MVCC, catalog, collections, the query
//! pipeline, the change bus and the auxiliary key/value surface into
//! one opened storage domain. One engine per project; engines share
//! nothing with each other.

pub mod background;
pub mod catalog;
pub mod changebus;
pub mod collection;
pub mod encoding;
pub mod engine;
pub mod healing;
pub mod kv;
pub mod schema;

pub use background::{BackgroundScheduler, TaskPriority, Ticker};
pub use changebus::{ChangeEvent, ChangeKind, StreamItem, Subscription};
pub use collection::{Collection, PatchOp};
pub use engine::{Engine, EngineStats};
pub use kv::{KvEntry, KvSurface, KvValue};
pub use schema::{FieldSpec, FieldType, Schema};
