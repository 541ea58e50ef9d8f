//! B+Tree nodes and their on-disk frames.
//!
//! Nodes are bincode-encoded and written as CRC-trailed frames appended
//! to the tree file (same frame shape as the data file). The tree is
//! copy-on-write: a mutation rewrites the path from leaf to root and
//! never touches existing frames, so concurrent readers can keep
//! traversing an old root safely.

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use loam_core::{Error, Result};

/// Maximum entries in a leaf and children in an internal node. A node
/// that grows past this splits.
pub const ORDER: usize = 64;

/// Key ordering for one tree.
///
/// `Numeric` expects 8-byte order-preserving f64 keys (see
/// [`encode_f64_key`]); anything else falls back to byte order, which
/// keeps mixed-type secondary indexes total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Lexicographic,
    Numeric,
}

impl Default for Comparator {
    fn default() -> Self {
        Comparator::Lexicographic
    }
}

impl Comparator {
    pub fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Comparator::Lexicographic => a.cmp(b),
            Comparator::Numeric => match (decode_f64_key(a), decode_f64_key(b)) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => a.cmp(b),
            },
        }
    }
}

/// Encode an f64 so that byte order equals numeric order: flip all bits
/// for negatives, flip the sign bit for positives. NaN sorts last.
pub fn encode_f64_key(value: f64) -> [u8; 8] {
    let bits = value.to_bits();
    let ordered = if bits & (1 << 63) != 0 { !bits } else { bits | (1 << 63) };
    ordered.to_be_bytes()
}

/// Inverse of [`encode_f64_key`]. `None` when the slice is not 8 bytes.
pub fn decode_f64_key(bytes: &[u8]) -> Option<f64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    let ordered = u64::from_be_bytes(arr);
    let bits = if ordered & (1 << 63) != 0 { ordered & !(1 << 63) } else { !ordered };
    Some(f64::from_bits(bits))
}

/// One tree node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        /// Sorted `(key, value)` pairs.
        entries: Vec<(Vec<u8>, Vec<u8>)>,
    },
    Internal {
        /// `separators[i]` is the smallest key reachable via
        /// `children[i + 1]`.
        separators: Vec<Vec<u8>>,
        /// File offsets of child frames. One more than separators.
        children: Vec<u64>,
    },
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    /// Serialize into a `len | bincode | crc32` frame.
    pub fn encode_frame(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))?;
        let mut frame = Vec::with_capacity(body.len() + 8);
        let mut len_bytes = [0u8; 4];
        LittleEndian::write_u32(&mut len_bytes, body.len() as u32);
        frame.extend_from_slice(&len_bytes);
        frame.extend_from_slice(&body);
        let mut hasher = Hasher::new();
        hasher.update(&body);
        let mut crc_bytes = [0u8; 4];
        LittleEndian::write_u32(&mut crc_bytes, hasher.finalize());
        frame.extend_from_slice(&crc_bytes);
        Ok(frame)
    }

    /// Decode a frame previously produced by [`Node::encode_frame`].
    pub fn decode_frame(frame: &[u8]) -> Result<Node> {
        if frame.len() < 8 {
            return Err(Error::Corruption("tree frame shorter than its overhead".into()));
        }
        let body_len = LittleEndian::read_u32(&frame[0..4]) as usize;
        if frame.len() != body_len + 8 {
            return Err(Error::Corruption(format!(
                "tree frame length {} does not match declared {}",
                frame.len(),
                body_len + 8
            )));
        }
        let body = &frame[4..4 + body_len];
        let stored = LittleEndian::read_u32(&frame[4 + body_len..]);
        let mut hasher = Hasher::new();
        hasher.update(body);
        let computed = hasher.finalize();
        if stored != computed {
            return Err(Error::Corruption(format!(
                "tree node crc mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            )));
        }
        bincode::deserialize(body).map_err(|e| Error::Corruption(format!("tree node: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f64_key_encoding_preserves_order() {
        let values = [
            f64::NEG_INFINITY,
            -1e300,
            -42.5,
            -1.0,
            -0.0,
            0.0,
            1e-9,
            1.0,
            42.5,
            1e300,
            f64::INFINITY,
        ];
        for pair in values.windows(2) {
            let a = encode_f64_key(pair[0]);
            let b = encode_f64_key(pair[1]);
            assert!(a <= b, "{} should encode <= {}", pair[0], pair[1]);
        }
        for v in values {
            assert_eq!(decode_f64_key(&encode_f64_key(v)), Some(v));
        }
    }

    #[test]
    fn numeric_comparator_orders_by_value() {
        let cmp = Comparator::Numeric;
        let two = encode_f64_key(2.0);
        let ten = encode_f64_key(10.0);
        assert_eq!(cmp.cmp(&two, &ten), Ordering::Less);
        // The encoding is order-preserving, so byte order agrees
        assert_eq!(Comparator::Lexicographic.cmp(&two, &ten), Ordering::Less);
        // Non-8-byte keys fall back to byte order without panicking
        assert_eq!(cmp.cmp(b"ab", b"b"), Ordering::Less);
    }

    #[test]
    fn frame_roundtrip() {
        let node = Node::Leaf {
            entries: vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())],
        };
        let frame = node.encode_frame().unwrap();
        match Node::decode_frame(&frame).unwrap() {
            Node::Leaf { entries } => assert_eq!(entries.len(), 2),
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn frame_corruption_detected() {
        let node = Node::Leaf { entries: vec![(b"k".to_vec(), b"v".to_vec())] };
        let mut frame = node.encode_frame().unwrap();
        frame[6] ^= 0xFF;
        assert!(Node::decode_frame(&frame).is_err());
    }
}
