//! The query engine: filter AST, parser, predicate evaluation, the
//! iterator pipeline, and the planner that picks between table scans
//! and secondary-index range scans.
//!
//! Execution against real storage lives in the engine crate; this crate
//! is pure: documents in, documents out.

pub mod ast;
pub mod eval;
pub mod iter;
pub mod parser;
pub mod plan;

pub use ast::{CompareOp, Filter};
pub use eval::matches;
pub use iter::{filter_stream, limit_stream, skip_stream, sort_documents, DocIter};
pub use parser::parse_filter;
pub use plan::{plan, Plan, QueryOptions, ScanPlan};
