//! Recursive B+Tree for primary and secondary indexes.

pub mod node;
pub mod tree;

pub use node::{decode_f64_key, encode_f64_key, Comparator, Node, ORDER};
pub use tree::{BTree, EMPTY_ROOT};
