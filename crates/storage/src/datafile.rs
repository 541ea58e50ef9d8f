//! Document data file.
//!
//! Append-only file of CRC-trailed payload frames:
//!
//! ```text
//! ┌──────────────────┬─────────┬───────────┐
//! │ payload-len (4 LE)│ payload │ CRC32 (4) │
//! └──────────────────┴─────────┴───────────┘
//! ```
//!
//! The CRC is IEEE-802.3 over the payload bytes. Reads verify it and
//! fail with a corruption error on mismatch; the healing loop re-scans
//! frames in the background with the same check.

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use loam_core::{Error, Result};

/// Frame overhead: leading length + trailing CRC.
pub const FRAME_OVERHEAD: usize = 8;

/// Location of one payload frame inside the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePointer {
    /// Byte offset of the frame start.
    pub offset: u64,
    /// Payload length in bytes (excluding frame overhead).
    pub len: u32,
}

struct DataInner {
    file: File,
    len: u64,
}

/// Append-only document file with per-frame CRC.
pub struct DataFile {
    inner: Mutex<DataInner>,
    path: PathBuf,
}

impl DataFile {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(DataFile {
            inner: Mutex::new(DataInner { file, len }),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one payload frame and return its pointer.
    pub fn append(&self, payload: &[u8]) -> Result<StoragePointer> {
        let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
        let mut len_bytes = [0u8; 4];
        LittleEndian::write_u32(&mut len_bytes, payload.len() as u32);
        frame.extend_from_slice(&len_bytes);
        frame.extend_from_slice(payload);
        let mut hasher = Hasher::new();
        hasher.update(payload);
        let mut crc_bytes = [0u8; 4];
        LittleEndian::write_u32(&mut crc_bytes, hasher.finalize());
        frame.extend_from_slice(&crc_bytes);

        let mut inner = self.inner.lock();
        let offset = inner.len;
        inner.file.seek(SeekFrom::End(0))?;
        inner.file.write_all(&frame)?;
        inner.len += frame.len() as u64;
        Ok(StoragePointer {
            offset,
            len: payload.len() as u32,
        })
    }

    /// Read and CRC-verify the frame at `ptr`.
    pub fn read(&self, ptr: StoragePointer) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        read_frame_at(&mut inner.file, ptr.offset).and_then(|(payload, _)| {
            if payload.len() != ptr.len as usize {
                return Err(Error::Corruption(format!(
                    "frame length {} does not match pointer length {}",
                    payload.len(),
                    ptr.len
                )));
            }
            Ok(payload)
        })
    }

    /// Verify frames starting at `from`, visiting at most `max_frames`.
    /// Returns the offsets of corrupt frames and the offset to resume
    /// from (`None` when the scan reached the end of file).
    ///
    /// Used by the healing loop; a corrupt frame does not stop the scan
    /// because frame lengths are readable independently of payload CRCs.
    pub fn scan_frames(&self, from: u64, max_frames: usize) -> Result<ScanReport> {
        let mut inner = self.inner.lock();
        let end = inner.len;
        let mut offset = from;
        let mut report = ScanReport::default();

        while offset < end && report.verified + report.corrupt.len() < max_frames {
            match read_frame_at(&mut inner.file, offset) {
                Ok((_, frame_len)) => {
                    report.verified += 1;
                    offset += frame_len;
                }
                Err(Error::Corruption(_)) => {
                    // Skip past the frame using its declared length
                    let frame_len = declared_frame_len(&mut inner.file, offset)?;
                    report.corrupt.push(offset);
                    match frame_len {
                        Some(len) => offset += len,
                        None => break,
                    }
                }
                Err(e) => return Err(e),
            }
        }
        report.resume_at = if offset < end { Some(offset) } else { None };
        Ok(report)
    }

    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.sync_data()?;
        Ok(())
    }
}

/// Outcome of one healing scan pass.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub verified: usize,
    pub corrupt: Vec<u64>,
    pub resume_at: Option<u64>,
}

fn read_frame_at(file: &mut File, offset: u64) -> Result<(Vec<u8>, u64)> {
    file.seek(SeekFrom::Start(offset))?;
    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)?;
    let payload_len = LittleEndian::read_u32(&len_bytes) as usize;

    let mut payload = vec![0u8; payload_len];
    file.read_exact(&mut payload)?;
    let mut crc_bytes = [0u8; 4];
    file.read_exact(&mut crc_bytes)?;
    let stored = LittleEndian::read_u32(&crc_bytes);

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let computed = hasher.finalize();
    if computed != stored {
        return Err(Error::Corruption(format!(
            "data frame at offset {}: stored crc {:#010x}, computed {:#010x}",
            offset, stored, computed
        )));
    }
    Ok((payload, (payload_len + FRAME_OVERHEAD) as u64))
}

fn declared_frame_len(file: &mut File, offset: u64) -> Result<Option<u64>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut len_bytes = [0u8; 4];
    match file.read_exact(&mut len_bytes) {
        Ok(()) => Ok(Some(LittleEndian::read_u32(&len_bytes) as u64 + FRAME_OVERHEAD as u64)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_read_roundtrip() {
        let dir = tempdir().unwrap();
        let file = DataFile::open(&dir.path().join("data.db")).unwrap();

        let p1 = file.append(b"hello").unwrap();
        let p2 = file.append(b"world!").unwrap();
        assert_eq!(file.read(p1).unwrap(), b"hello");
        assert_eq!(file.read(p2).unwrap(), b"world!");
        assert_eq!(p2.offset, (5 + FRAME_OVERHEAD) as u64);
    }

    #[test]
    fn corruption_fails_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        let file = DataFile::open(&path).unwrap();
        let ptr = file.append(b"precious bytes").unwrap();
        drop(file);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[6] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let file = DataFile::open(&path).unwrap();
        assert!(matches!(file.read(ptr), Err(Error::Corruption(_))));
    }

    #[test]
    fn scan_reports_corrupt_frames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        let file = DataFile::open(&path).unwrap();
        let p1 = file.append(b"aaaa").unwrap();
        let p2 = file.append(b"bbbb").unwrap();
        let _p3 = file.append(b"cccc").unwrap();
        drop(file);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[p2.offset as usize + 4] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let file = DataFile::open(&path).unwrap();
        let report = file.scan_frames(0, 100).unwrap();
        assert_eq!(report.verified, 2);
        assert_eq!(report.corrupt, vec![p2.offset]);
        assert_eq!(report.resume_at, None);
        // The uncorrupted frames still read fine
        assert_eq!(file.read(p1).unwrap(), b"aaaa");
    }

    #[test]
    fn scan_resumes_in_batches() {
        let dir = tempdir().unwrap();
        let file = DataFile::open(&dir.path().join("data.db")).unwrap();
        for i in 0..10u8 {
            file.append(&[i; 16]).unwrap();
        }
        let report = file.scan_frames(0, 4).unwrap();
        assert_eq!(report.verified, 4);
        let resume = report.resume_at.unwrap();
        let report = file.scan_frames(resume, 100).unwrap();
        assert_eq!(report.verified, 6);
        assert_eq!(report.resume_at, None);
    }
}
