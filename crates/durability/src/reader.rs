//! Streaming segment scan.
//!
//! Reads records one at a time with a small per-record allocation, so
//! replaying a huge log never loads a whole segment into memory.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use loam_core::Result;

use crate::record::{WalRecord, WalRecordError, RECORD_HEADER_SIZE};

/// One step of a segment scan.
#[derive(Debug)]
pub enum ScanItem {
    Record(WalRecord),
    /// Clean end of file.
    Eof,
    /// Corrupt or torn tail. `good_len` is the byte offset of the end of
    /// the last record that decoded cleanly.
    Torn { good_len: u64, detail: String },
}

/// Sequential reader over one segment file.
pub struct SegmentReader {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    finished: bool,
}

impl SegmentReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(SegmentReader {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            offset: 0,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the next unread record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next record. After `Eof` or `Torn` every further call
    /// returns `Eof`.
    pub fn next_item(&mut self) -> Result<ScanItem> {
        if self.finished {
            return Ok(ScanItem::Eof);
        }

        let mut header = [0u8; RECORD_HEADER_SIZE];
        match read_exact_or_eof(&mut self.reader, &mut header)? {
            ReadOutcome::Eof => {
                self.finished = true;
                return Ok(ScanItem::Eof);
            }
            ReadOutcome::Partial(n) => {
                self.finished = true;
                return Ok(ScanItem::Torn {
                    good_len: self.offset,
                    detail: format!("torn header: {} of {} bytes", n, RECORD_HEADER_SIZE),
                });
            }
            ReadOutcome::Full => {}
        }

        let key_len = u32::from_le_bytes(header[13..17].try_into().unwrap()) as usize;
        let val_len = u32::from_le_bytes(header[17..21].try_into().unwrap()) as usize;

        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + key_len + val_len);
        buf.extend_from_slice(&header);
        buf.resize(RECORD_HEADER_SIZE + key_len + val_len, 0);
        match read_exact_or_eof(&mut self.reader, &mut buf[RECORD_HEADER_SIZE..])? {
            ReadOutcome::Full => {}
            ReadOutcome::Eof | ReadOutcome::Partial(_) => {
                self.finished = true;
                return Ok(ScanItem::Torn {
                    good_len: self.offset,
                    detail: "torn record body".to_string(),
                });
            }
        }

        match WalRecord::decode(&buf) {
            Ok((record, consumed)) => {
                self.offset += consumed as u64;
                Ok(ScanItem::Record(record))
            }
            Err(e @ WalRecordError::ChecksumMismatch { .. })
            | Err(e @ WalRecordError::UnknownKind(_))
            | Err(e @ WalRecordError::TruncatedEnvelope) => {
                self.finished = true;
                Ok(ScanItem::Torn {
                    good_len: self.offset,
                    detail: e.to_string(),
                })
            }
            Err(WalRecordError::InsufficientData) => {
                self.finished = true;
                Ok(ScanItem::Torn {
                    good_len: self.offset,
                    detail: "record shorter than its declared length".to_string(),
                })
            }
        }
    }
}

enum ReadOutcome {
    Full,
    Partial(usize),
    Eof,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Partial(filled)
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_records(path: &Path, records: &[WalRecord]) {
        let mut file = File::create(path).unwrap();
        for r in records {
            file.write_all(&r.encode()).unwrap();
        }
    }

    fn record(lsn: u64, txn: u64) -> WalRecord {
        let mut r = WalRecord::data(RecordKind::Insert, txn, vec![1, 2], vec![3, 4, 5]);
        r.lsn = lsn;
        r
    }

    #[test]
    fn scans_all_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        write_records(&path, &[record(1, 10), record(2, 10), record(3, 11)]);

        let mut reader = SegmentReader::open(&path).unwrap();
        let mut lsns = Vec::new();
        loop {
            match reader.next_item().unwrap() {
                ScanItem::Record(r) => lsns.push(r.lsn),
                ScanItem::Eof => break,
                ScanItem::Torn { .. } => panic!("unexpected torn tail"),
            }
        }
        assert_eq!(lsns, vec![1, 2, 3]);
    }

    #[test]
    fn torn_tail_reports_good_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        let first = record(1, 10);
        let first_len = first.encode().len() as u64;
        write_records(&path, &[first, record(2, 10)]);

        // Chop the last 3 bytes off the second record
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let mut reader = SegmentReader::open(&path).unwrap();
        assert!(matches!(reader.next_item().unwrap(), ScanItem::Record(_)));
        match reader.next_item().unwrap() {
            ScanItem::Torn { good_len, .. } => assert_eq!(good_len, first_len),
            other => panic!("expected torn tail, got {:?}", other),
        }
        assert!(matches!(reader.next_item().unwrap(), ScanItem::Eof));
    }

    #[test]
    fn corrupt_record_reports_good_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        let first = record(1, 10);
        let first_len = first.encode().len() as u64;
        write_records(&path, &[first, record(2, 10)]);

        let mut bytes = std::fs::read(&path).unwrap();
        let idx = first_len as usize + RECORD_HEADER_SIZE + 1;
        bytes[idx] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = SegmentReader::open(&path).unwrap();
        assert!(matches!(reader.next_item().unwrap(), ScanItem::Record(_)));
        match reader.next_item().unwrap() {
            ScanItem::Torn { good_len, .. } => assert_eq!(good_len, first_len),
            other => panic!("expected torn tail, got {:?}", other),
        }
    }
}
