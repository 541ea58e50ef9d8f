//! Global limits.
//!
//! Hard caps that hold regardless of configuration. Configurable knobs
//! (result limits, frame size) default to the values here and may only be
//! lowered by the embedder.
//!
//! | Limit | Value | Constant |
//! |-------|-------|----------|
//! | Max document size | 16 MB | [`MAX_DOCUMENT_SIZE`] |
//! | Max nesting depth | 100 levels | [`MAX_NESTING_DEPTH`] |
//! | Max wire frame | 16 MB | [`MAX_FRAME_SIZE`] |
//! | Max query nodes | 256 | [`MAX_QUERY_NODES`] |
//! | Max result limit | 10k documents | [`MAX_RESULT_LIMIT`] |

/// Maximum document size in bytes (16 MB).
///
/// Checked on insert, update and patch.
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Maximum nesting depth of a document (100 levels).
///
/// Prevents stack overflow in recursive traversal.
pub const MAX_NESTING_DEPTH: usize = 100;

/// Default maximum wire frame size (16 MB). Frames above the configured
/// maximum are rejected with a `FrameTooLarge` reply.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum number of nodes in a parsed query filter.
///
/// This is the only depth bound on nested `$and`/`$or`.
pub const MAX_QUERY_NODES: usize = 256;

/// Upper bound on `limit` (and `skip`) per query.
pub const MAX_RESULT_LIMIT: usize = 10_000;
