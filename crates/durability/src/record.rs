//! WAL record framing.
//!
//! # Record layout
//!
//! ```text
//! ┌──────────┬─────────┬──────────┬─────────────┬─────────────┬─────┬─────┐
//! │ CRC32 (4)│ LSN (8) │ kind (1) │ key-len (4) │ val-len (4) │ key │ val │
//! └──────────┴─────────┴──────────┴─────────────┴─────────────┴─────┴─────┘
//! ```
//!
//! All integers are little-endian. The CRC is IEEE-802.3 over every byte
//! after the CRC field. The val region opens with a fixed 16-byte
//! transaction envelope `{txn_id (8 LE), timestamp-ms (8 LE)}` followed
//! by the payload, so data records carry their creator and wall-clock
//! time without widening the outer header.

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use thiserror::Error;

use loam_core::{Error, Lsn, TxnId};

/// Fixed header size: CRC + LSN + kind + key-len + val-len.
pub const RECORD_HEADER_SIZE: usize = 4 + 8 + 1 + 4 + 4;

/// Size of the transaction envelope at the head of the val region.
pub const TXN_ENVELOPE_SIZE: usize = 8 + 8;

/// Record kinds. The on-disk byte values are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    Insert = 1,
    Delete = 2,
    Expire = 3,
    Commit = 4,
    Abort = 5,
    Checkpoint = 6,
}

impl RecordKind {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(RecordKind::Insert),
            2 => Some(RecordKind::Delete),
            3 => Some(RecordKind::Expire),
            4 => Some(RecordKind::Commit),
            5 => Some(RecordKind::Abort),
            6 => Some(RecordKind::Checkpoint),
            _ => None,
        }
    }

    /// Data records mutate a key; control records delimit transactions.
    pub fn is_data(&self) -> bool {
        matches!(self, RecordKind::Insert | RecordKind::Delete | RecordKind::Expire)
    }
}

/// Errors from the record codec. Converted to the unified corruption
/// error at the recovery boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WalRecordError {
    #[error("insufficient data for a complete record")]
    InsufficientData,

    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("unknown record kind {0}")]
    UnknownKind(u8),

    #[error("val region shorter than the transaction envelope")]
    TruncatedEnvelope,
}

impl From<WalRecordError> for Error {
    fn from(e: WalRecordError) -> Self {
        Error::Corruption(format!("wal record: {}", e))
    }
}

/// One write-ahead-log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Strictly increasing across all records of one engine. Assigned by
    /// the writer at append time; zero until then.
    pub lsn: Lsn,
    pub kind: RecordKind,
    pub txn_id: TxnId,
    /// Wall-clock milliseconds at record creation.
    pub timestamp_ms: i64,
    /// Encoded storage key. Empty for Commit/Abort/Checkpoint.
    pub key: Vec<u8>,
    /// Payload bytes. Empty for Delete and control records.
    pub payload: Vec<u8>,
}

impl WalRecord {
    /// Build a data record (Insert/Delete/Expire) for a transaction.
    pub fn data(kind: RecordKind, txn_id: TxnId, key: Vec<u8>, payload: Vec<u8>) -> Self {
        debug_assert!(kind.is_data());
        WalRecord {
            lsn: 0,
            kind,
            txn_id,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            key,
            payload,
        }
    }

    /// Build a control record (Commit/Abort/Checkpoint).
    pub fn control(kind: RecordKind, txn_id: TxnId) -> Self {
        debug_assert!(!kind.is_data());
        WalRecord {
            lsn: 0,
            kind,
            txn_id,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            key: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Total encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.key.len() + TXN_ENVELOPE_SIZE + self.payload.len()
    }

    /// Serialize into the on-disk form.
    pub fn encode(&self) -> Vec<u8> {
        let val_len = TXN_ENVELOPE_SIZE + self.payload.len();
        let mut out = vec![0u8; self.encoded_len()];

        LittleEndian::write_u64(&mut out[4..12], self.lsn);
        out[12] = self.kind as u8;
        LittleEndian::write_u32(&mut out[13..17], self.key.len() as u32);
        LittleEndian::write_u32(&mut out[17..21], val_len as u32);

        let key_end = RECORD_HEADER_SIZE + self.key.len();
        out[RECORD_HEADER_SIZE..key_end].copy_from_slice(&self.key);
        LittleEndian::write_u64(&mut out[key_end..key_end + 8], self.txn_id);
        LittleEndian::write_i64(&mut out[key_end + 8..key_end + 16], self.timestamp_ms);
        out[key_end + 16..].copy_from_slice(&self.payload);

        let mut hasher = Hasher::new();
        hasher.update(&out[4..]);
        LittleEndian::write_u32(&mut out[0..4], hasher.finalize());
        out
    }

    /// Parse one record from the front of `buf`. Returns the record and
    /// the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), WalRecordError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(WalRecordError::InsufficientData);
        }
        let stored_crc = LittleEndian::read_u32(&buf[0..4]);
        let lsn = LittleEndian::read_u64(&buf[4..12]);
        let kind_byte = buf[12];
        let key_len = LittleEndian::read_u32(&buf[13..17]) as usize;
        let val_len = LittleEndian::read_u32(&buf[17..21]) as usize;

        let total = RECORD_HEADER_SIZE + key_len + val_len;
        if buf.len() < total {
            return Err(WalRecordError::InsufficientData);
        }

        let mut hasher = Hasher::new();
        hasher.update(&buf[4..total]);
        let computed = hasher.finalize();
        if computed != stored_crc {
            return Err(WalRecordError::ChecksumMismatch {
                stored: stored_crc,
                computed,
            });
        }

        let kind = RecordKind::from_u8(kind_byte).ok_or(WalRecordError::UnknownKind(kind_byte))?;
        if val_len < TXN_ENVELOPE_SIZE {
            return Err(WalRecordError::TruncatedEnvelope);
        }

        let key_end = RECORD_HEADER_SIZE + key_len;
        let key = buf[RECORD_HEADER_SIZE..key_end].to_vec();
        let txn_id = LittleEndian::read_u64(&buf[key_end..key_end + 8]);
        let timestamp_ms = LittleEndian::read_i64(&buf[key_end + 8..key_end + 16]);
        let payload = buf[key_end + 16..total].to_vec();

        Ok((
            WalRecord {
                lsn,
                kind,
                txn_id,
                timestamp_ms,
                key,
                payload,
            },
            total,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> WalRecord {
        WalRecord {
            lsn: 42,
            kind: RecordKind::Insert,
            txn_id: 7,
            timestamp_ms: 1_700_000_000_000,
            key: b"dusers\x00u1".to_vec(),
            payload: br#"{"_id":"u1"}"#.to_vec(),
        }
    }

    #[test]
    fn roundtrip() {
        let record = sample();
        let bytes = record.encode();
        let (decoded, consumed) = WalRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn control_records_have_empty_key() {
        let record = WalRecord::control(RecordKind::Commit, 9);
        let bytes = record.encode();
        let (decoded, _) = WalRecord::decode(&bytes).unwrap();
        assert_eq!(decoded.kind, RecordKind::Commit);
        assert_eq!(decoded.txn_id, 9);
        assert!(decoded.key.is_empty());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn checksum_detects_corruption() {
        let bytes = sample().encode();
        for i in 0..bytes.len() {
            let mut corrupted = bytes.clone();
            corrupted[i] ^= 0x01;
            let result = WalRecord::decode(&corrupted);
            // A flip in the length fields may instead surface as
            // InsufficientData; it must never decode cleanly.
            assert!(result.is_err(), "flip at byte {} went unnoticed", i);
        }
    }

    #[test]
    fn short_buffers_rejected() {
        assert_eq!(
            WalRecord::decode(&[0u8; 3]).unwrap_err(),
            WalRecordError::InsufficientData
        );
        let bytes = sample().encode();
        assert_eq!(
            WalRecord::decode(&bytes[..bytes.len() - 1]).unwrap_err(),
            WalRecordError::InsufficientData
        );
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut bytes = sample().encode();
        bytes[12] = 99;
        // Fix up the CRC so the kind check is what fires
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[4..]);
        let crc = hasher.finalize();
        bytes[0..4].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(
            WalRecord::decode(&bytes).unwrap_err(),
            WalRecordError::UnknownKind(99)
        );
    }

    proptest! {
        #[test]
        fn roundtrip_arbitrary(
            lsn in any::<u64>(),
            txn_id in any::<u64>(),
            timestamp in any::<i64>(),
            key in proptest::collection::vec(any::<u8>(), 0..256),
            payload in proptest::collection::vec(any::<u8>(), 0..1024),
        ) {
            let record = WalRecord {
                lsn,
                kind: RecordKind::Insert,
                txn_id,
                timestamp_ms: timestamp,
                key,
                payload,
            };
            let bytes = record.encode();
            let (decoded, consumed) = WalRecord::decode(&bytes).unwrap();
            prop_assert_eq!(decoded, record);
            prop_assert_eq!(consumed, bytes.len());
        }

        #[test]
        fn single_bit_flip_fails(
            flip_byte in 0usize..64,
            flip_bit in 0u8..8,
        ) {
            let bytes = sample().encode();
            let idx = flip_byte % bytes.len();
            let mut corrupted = bytes.clone();
            corrupted[idx] ^= 1 << flip_bit;
            prop_assert!(WalRecord::decode(&corrupted).is_err());
        }
    }
}
