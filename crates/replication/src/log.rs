//! The replicated log's storage.
//!
//! Entries live in memory backed by an append-only file of CRC-framed
//! bincode records. Conflict truncation rewrites the tail file; it is
//! rare (only on leader changes with divergent followers), so the
//! simple full rewrite wins over tracking per-entry offsets.

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use loam_core::{Error, Result};
use tracing::warn;

use crate::message::LogEntry;

const LOG_FILE: &str = "raft.log";

/// In-memory log with append-only persistence.
pub struct RaftLog {
    entries: Vec<LogEntry>,
    path: PathBuf,
    file: File,
}

impl RaftLog {
    /// Open the log in `dir`, replaying any persisted entries. A torn
    /// tail is truncated, mirroring WAL recovery.
    pub fn open(dir: &Path) -> Result<RaftLog> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);
        let mut entries = Vec::new();

        if path.exists() {
            let bytes = fs::read(&path)?;
            let mut offset = 0usize;
            let mut good_len = 0usize;
            while offset + 8 <= bytes.len() {
                let body_len = LittleEndian::read_u32(&bytes[offset..offset + 4]) as usize;
                let total = 8 + body_len;
                if offset + total > bytes.len() {
                    break;
                }
                let body = &bytes[offset + 4..offset + 4 + body_len];
                let stored = LittleEndian::read_u32(&bytes[offset + 4 + body_len..offset + total]);
                let mut hasher = Hasher::new();
                hasher.update(body);
                if hasher.finalize() != stored {
                    break;
                }
                match bincode::deserialize::<LogEntry>(body) {
                    Ok(entry) => entries.push(entry),
                    Err(_) => break,
                }
                offset += total;
                good_len = offset;
            }
            if good_len < bytes.len() {
                warn!(
                    kept = good_len,
                    total = bytes.len(),
                    "truncating raft log at torn tail"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(good_len as u64)?;
                file.sync_data()?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(RaftLog { entries, path, file })
    }

    pub fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at `index`; `Some(0)` for the index-0
    /// sentinel, `None` past the end.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 || index > self.last_index() {
            return None;
        }
        let entry = &self.entries[(index - 1) as usize];
        debug_assert_eq!(entry.index, index);
        Some(entry)
    }

    /// Entries from `from` (inclusive) to the end.
    pub fn entries_from(&self, from: u64) -> Vec<LogEntry> {
        if from == 0 || from > self.last_index() {
            return Vec::new();
        }
        self.entries[(from - 1) as usize..].to_vec()
    }

    /// Append entries that extend the log contiguously.
    pub fn append(&mut self, new_entries: &[LogEntry]) -> Result<()> {
        for entry in new_entries {
            debug_assert_eq!(entry.index, self.last_index() + 1, "log must stay contiguous");
            self.file.write_all(&encode_frame(entry)?)?;
            self.entries.push(entry.clone());
        }
        self.file.sync_data()?;
        Ok(())
    }

    /// Drop every entry at `from` and beyond, rewriting the file.
    pub fn truncate_from(&mut self, from: u64) -> Result<()> {
        if from > self.last_index() {
            return Ok(());
        }
        self.entries.truncate(from.saturating_sub(1) as usize);

        let tmp = self.path.with_extension("log.tmp");
        {
            let mut file = File::create(&tmp)?;
            for entry in &self.entries {
                file.write_all(&encode_frame(entry)?)?;
            }
            file.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        Ok(())
    }
}

fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
    let body = bincode::serialize(entry).map_err(|e| Error::Serialization(e.to_string()))?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            command: vec![index as u8],
        }
    }

    #[test]
    fn append_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut log = RaftLog::open(dir.path()).unwrap();
            log.append(&[entry(1, 1), entry(1, 2), entry(2, 3)]).unwrap();
            assert_eq!(log.last_index(), 3);
            assert_eq!(log.last_term(), 2);
        }
        let log = RaftLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(log.term_at(3), Some(2));
        assert_eq!(log.term_at(4), None);
        assert_eq!(log.term_at(0), Some(0));
    }

    #[test]
    fn truncate_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut log = RaftLog::open(dir.path()).unwrap();
            log.append(&[entry(1, 1), entry(1, 2), entry(1, 3)]).unwrap();
            log.truncate_from(2).unwrap();
            assert_eq!(log.last_index(), 1);
            log.append(&[entry(2, 2)]).unwrap();
        }
        let log = RaftLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(2), Some(2));
    }

    #[test]
    fn torn_tail_is_cut() {
        let dir = tempdir().unwrap();
        {
            let mut log = RaftLog::open(dir.path()).unwrap();
            log.append(&[entry(1, 1), entry(1, 2)]).unwrap();
        }
        let path = dir.path().join(LOG_FILE);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let log = RaftLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn entries_from_slices_the_tail() {
        let dir = tempdir().unwrap();
        let mut log = RaftLog::open(dir.path()).unwrap();
        log.append(&[entry(1, 1), entry(1, 2), entry(1, 3)]).unwrap();
        let tail = log.entries_from(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].index, 2);
        assert!(log.entries_from(4).is_empty());
    }
}
