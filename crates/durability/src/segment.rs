//! WAL segment files.
//!
//! The active segment is `<project>.wal`; rotation renames it to
//! `<project>.wal.<n>` with a monotonically increasing suffix and opens
//! a fresh active file. Segments hold records back to back with no
//! header; the record framing is self-delimiting.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use loam_core::{Error, Result};

/// Name of the active segment for a project.
pub fn active_segment_name(project: &str) -> String {
    format!("{}.wal", project)
}

fn rotated_segment_name(project: &str, n: u64) -> String {
    format!("{}.wal.{}", project, n)
}

/// Rotated segments in suffix order, as `(n, path)` pairs.
pub fn list_rotated_segments(dir: &Path, project: &str) -> Result<Vec<(u64, PathBuf)>> {
    let prefix = format!("{}.wal.", project);
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        if let Some(suffix) = name.strip_prefix(&prefix) {
            if let Ok(n) = suffix.parse::<u64>() {
                segments.push((n, entry.path()));
            }
        }
    }
    segments.sort_by_key(|(n, _)| *n);
    Ok(segments)
}

/// All segment paths in replay order: rotated (ascending suffix), then
/// the active segment if it exists.
pub fn segments_in_order(dir: &Path, project: &str) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = list_rotated_segments(dir, project)?
        .into_iter()
        .map(|(_, p)| p)
        .collect();
    let active = dir.join(active_segment_name(project));
    if active.exists() {
        paths.push(active);
    }
    Ok(paths)
}

/// Writable handle on the active segment.
pub struct ActiveSegment {
    writer: BufWriter<File>,
    path: PathBuf,
    len: u64,
}

impl ActiveSegment {
    /// Open the active segment for appending, creating it if needed.
    pub fn open(dir: &Path, project: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(active_segment_name(project));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(ActiveSegment {
            writer: BufWriter::new(file),
            path,
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append encoded record bytes to the tail buffer.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.len += bytes.len() as u64;
        Ok(())
    }

    /// Push buffered bytes to the OS without forcing them to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and fsync. Durability point for everything appended so far.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Rotate: fsync, rename to the next rotated suffix, reopen a fresh
    /// active segment. Returns the rotated path.
    pub fn rotate(&mut self, dir: &Path, project: &str) -> Result<PathBuf> {
        self.sync()?;

        let next = list_rotated_segments(dir, project)?
            .last()
            .map(|(n, _)| n + 1)
            .unwrap_or(1);
        let rotated = dir.join(rotated_segment_name(project, next));
        fs::rename(&self.path, &rotated)?;

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.len = 0;
        Ok(rotated)
    }
}

/// Truncate a segment file to `len` bytes. Used by recovery to cut a
/// torn tail after the last good record.
pub fn truncate_segment(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_data()?;
    Ok(())
}

/// Delete rotated segments wholly below `keep_from`, retaining at least
/// `keep` newest regardless.
pub fn remove_rotated_below(
    dir: &Path,
    project: &str,
    keep_from: u64,
    keep: usize,
) -> Result<usize> {
    let rotated = list_rotated_segments(dir, project)?;
    if rotated.len() <= keep {
        return Ok(0);
    }
    let mut removed = 0;
    let cutoff = rotated.len() - keep;
    for (n, path) in rotated.into_iter().take(cutoff) {
        if n < keep_from {
            fs::remove_file(&path).map_err(Error::from)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_append_and_rotate() {
        let dir = tempdir().unwrap();
        let mut seg = ActiveSegment::open(dir.path(), "p1").unwrap();
        assert!(seg.is_empty());

        seg.write(b"abc").unwrap();
        seg.write(b"defg").unwrap();
        assert_eq!(seg.len(), 7);

        let rotated = seg.rotate(dir.path(), "p1").unwrap();
        assert!(rotated.ends_with("p1.wal.1"));
        assert_eq!(seg.len(), 0);

        seg.write(b"x").unwrap();
        let rotated = seg.rotate(dir.path(), "p1").unwrap();
        assert!(rotated.ends_with("p1.wal.2"));

        let order = segments_in_order(dir.path(), "p1").unwrap();
        assert_eq!(order.len(), 3);
        assert!(order[0].ends_with("p1.wal.1"));
        assert!(order[1].ends_with("p1.wal.2"));
        assert!(order[2].ends_with("p1.wal"));
    }

    #[test]
    fn rotation_suffix_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut seg = ActiveSegment::open(dir.path(), "p1").unwrap();
            seg.write(b"a").unwrap();
            seg.rotate(dir.path(), "p1").unwrap();
        }
        // A fresh handle continues the suffix sequence
        let mut seg = ActiveSegment::open(dir.path(), "p1").unwrap();
        seg.write(b"b").unwrap();
        let rotated = seg.rotate(dir.path(), "p1").unwrap();
        assert!(rotated.ends_with("p1.wal.2"));
    }

    #[test]
    fn truncate_cuts_tail() {
        let dir = tempdir().unwrap();
        let mut seg = ActiveSegment::open(dir.path(), "p1").unwrap();
        seg.write(b"0123456789").unwrap();
        seg.sync().unwrap();
        let path = seg.path().to_path_buf();
        drop(seg);

        truncate_segment(&path, 4).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"0123");
    }
}
