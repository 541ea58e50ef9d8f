//! Index key encoding.
//!
//! Secondary indexes map an encoded field value to the posting of
//! document ids holding it. Two encodings exist, matching the tree's
//! comparator:
//!
//! - **Lexicographic** (default): a type tag byte followed by an
//!   order-preserving payload. Values of different types group by tag,
//!   numbers order numerically inside their tag.
//! - **Numeric**: the bare 8-byte order-preserving float encoding.
//!   Non-numeric values are not representable and simply have no entry
//!   in the index, which is sound because a range predicate on numbers
//!   can never match them.

use serde_json::Value;

use loam_core::{Error, Result};
use loam_storage::btree::{encode_f64_key, Comparator};

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_NUMBER: u8 = 0x02;
const TAG_STRING: u8 = 0x03;
const TAG_COMPOSITE: u8 = 0x04;

/// Encode a field value as an index key under `comparator`. `None`
/// means the value has no entry in this index.
pub fn encode_index_value(comparator: Comparator, value: &Value) -> Option<Vec<u8>> {
    match comparator {
        Comparator::Numeric => value.as_f64().map(|n| encode_f64_key(n).to_vec()),
        Comparator::Lexicographic => Some(match value {
            Value::Null => vec![TAG_NULL],
            Value::Bool(b) => vec![TAG_BOOL, *b as u8],
            Value::Number(n) => {
                let mut key = Vec::with_capacity(9);
                key.push(TAG_NUMBER);
                key.extend_from_slice(&encode_f64_key(n.as_f64().unwrap_or(f64::NAN)));
                key
            }
            Value::String(s) => {
                let mut key = Vec::with_capacity(1 + s.len());
                key.push(TAG_STRING);
                key.extend_from_slice(s.as_bytes());
                key
            }
            // Arrays and objects index by canonical text; the planner
            // never derives bounds from them
            composite => {
                let mut key = vec![TAG_COMPOSITE];
                key.extend_from_slice(composite.to_string().as_bytes());
                key
            }
        }),
    }
}

/// Posting list codec: the sorted document ids holding one value.
pub fn encode_posting(ids: &[String]) -> Result<Vec<u8>> {
    bincode::serialize(ids).map_err(|e| Error::Serialization(e.to_string()))
}

pub fn decode_posting(bytes: &[u8]) -> Result<Vec<String>> {
    bincode::deserialize(bytes).map_err(|e| Error::Corruption(format!("index posting: {}", e)))
}
