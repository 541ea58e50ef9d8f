//! Copy-on-write B+Tree.
//!
//! One file per index. Mutations rewrite the leaf-to-root path as new
//! frames appended to the file and finish by swapping the root offset,
//! so readers traversing the old root stay consistent without locks.
//! The root offset is volatile state; the catalog persists it through
//! the `on_root_change` callback and `recover` reopens at it.
//!
//! Writers are serialised per tree. Deletes rewrite the path without
//! rebalancing; under-full nodes are tolerated.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use loam_core::{Error, Result};

use super::node::{Comparator, Node, ORDER};
use crate::buffer::BufferPool;

/// Sentinel root for an empty tree. Frame offsets start at 1 because
/// offset 0 is reserved by a one-byte file preamble.
pub const EMPTY_ROOT: u64 = 0;

struct TreeFile {
    file: File,
    len: u64,
}

/// Disk-backed B+Tree with byte keys and a pluggable comparator.
pub struct BTree {
    io: Mutex<TreeFile>,
    write_lock: Mutex<()>,
    path: PathBuf,
    comparator: Comparator,
    root: AtomicU64,
    on_root_change: Mutex<Option<Box<dyn Fn(u64) + Send + Sync>>>,
    cache: Option<(Arc<BufferPool>, u32)>,
}

enum InsertOutcome {
    Updated(u64),
    Split { left: u64, right: u64, separator: Vec<u8> },
}

impl BTree {
    /// Open (or create) a tree file and position it at `root`. Pass
    /// [`EMPTY_ROOT`] for a fresh tree.
    pub fn open(path: &Path, comparator: Comparator, root: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let mut len = file.metadata()?.len();
        if len == 0 {
            // Preamble byte keeps real offsets nonzero
            file.write_all(&[b'L'])?;
            len = 1;
        }

        let tree = BTree {
            io: Mutex::new(TreeFile { file, len }),
            write_lock: Mutex::new(()),
            path: path.to_path_buf(),
            comparator,
            root: AtomicU64::new(root),
            on_root_change: Mutex::new(None),
            cache: None,
        };
        // Validate the persisted root before trusting it
        if root != EMPTY_ROOT {
            tree.read_node(root)?;
        }
        Ok(tree)
    }

    /// Route node reads through a shared buffer pool. `file_id` must be
    /// unique among files sharing the pool.
    pub fn with_cache(mut self, pool: Arc<BufferPool>, file_id: u32) -> Self {
        self.cache = Some((pool, file_id));
        self
    }

    /// Register the root-change callback. The catalog uses this to keep
    /// the persisted root pointer current.
    pub fn set_on_root_change(&self, cb: impl Fn(u64) + Send + Sync + 'static) {
        *self.on_root_change.lock() = Some(Box::new(cb));
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn comparator(&self) -> Comparator {
        self.comparator
    }

    /// Current root offset.
    pub fn root(&self) -> u64 {
        self.root.load(AtomicOrdering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.root() == EMPTY_ROOT
    }

    /// Point lookup.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut offset = self.root();
        if offset == EMPTY_ROOT {
            return Ok(None);
        }
        loop {
            match self.read_node(offset)? {
                Node::Leaf { entries } => {
                    return Ok(entries
                        .iter()
                        .find(|(k, _)| self.comparator.cmp(k, key).is_eq())
                        .map(|(_, v)| v.clone()));
                }
                Node::Internal { separators, children } => {
                    offset = children[self.child_index(&separators, key)];
                }
            }
        }
    }

    /// Insert or replace.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock();
        let root = self.root();
        let new_root = if root == EMPTY_ROOT {
            self.write_node(&Node::Leaf {
                entries: vec![(key.to_vec(), value.to_vec())],
            })?
        } else {
            match self.insert_rec(root, key, value)? {
                InsertOutcome::Updated(offset) => offset,
                InsertOutcome::Split { left, right, separator } => self.write_node(&Node::Internal {
                    separators: vec![separator],
                    children: vec![left, right],
                })?,
            }
        };
        self.swap_root(new_root);
        Ok(())
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let root = self.root();
        if root == EMPTY_ROOT {
            return Ok(false);
        }
        match self.delete_rec(root, key)? {
            None => Ok(false),
            Some(new_root) => {
                self.swap_root(new_root);
                Ok(true)
            }
        }
    }

    /// Ordered scan over `[lo, hi]` bounds. The callback returns `false`
    /// to stop early. Keys arrive in comparator order.
    pub fn range(
        &self,
        lo: Bound<&[u8]>,
        hi: Bound<&[u8]>,
        cb: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        let root = self.root();
        if root == EMPTY_ROOT {
            return Ok(());
        }
        self.range_rec(root, lo, hi, cb)?;
        Ok(())
    }

    /// Visit every entry in order. Convenience wrapper over `range`.
    pub fn scan(&self, cb: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>) -> Result<()> {
        self.range(Bound::Unbounded, Bound::Unbounded, cb)
    }

    /// Number of entries. Walks the tree; intended for stats, not hot
    /// paths.
    pub fn entry_count(&self) -> Result<u64> {
        let mut count = 0u64;
        self.scan(&mut |_, _| {
            count += 1;
            Ok(true)
        })?;
        Ok(count)
    }

    /// fsync the tree file. Called at checkpoints.
    pub fn sync(&self) -> Result<()> {
        let io = self.io.lock();
        io.file.sync_data()?;
        Ok(())
    }

    // --- internals ----------------------------------------------------

    fn swap_root(&self, new_root: u64) {
        let old = self.root.swap(new_root, AtomicOrdering::AcqRel);
        if old != new_root {
            if let Some(cb) = self.on_root_change.lock().as_ref() {
                cb(new_root);
            }
        }
    }

    /// First child whose subtree may contain `key`.
    fn child_index(&self, separators: &[Vec<u8>], key: &[u8]) -> usize {
        separators
            .iter()
            .take_while(|sep| self.comparator.cmp(sep, key).is_le())
            .count()
    }

    fn insert_rec(&self, offset: u64, key: &[u8], value: &[u8]) -> Result<InsertOutcome> {
        match self.read_node(offset)? {
            Node::Leaf { mut entries } => {
                match entries.binary_search_by(|(k, _)| self.comparator.cmp(k, key)) {
                    Ok(idx) => entries[idx].1 = value.to_vec(),
                    Err(idx) => entries.insert(idx, (key.to_vec(), value.to_vec())),
                }
                if entries.len() > ORDER {
                    let right_entries = entries.split_off(entries.len() / 2);
                    let separator = right_entries[0].0.clone();
                    let left = self.write_node(&Node::Leaf { entries })?;
                    let right = self.write_node(&Node::Leaf { entries: right_entries })?;
                    Ok(InsertOutcome::Split { left, right, separator })
                } else {
                    Ok(InsertOutcome::Updated(self.write_node(&Node::Leaf { entries })?))
                }
            }
            Node::Internal { mut separators, mut children } => {
                let idx = self.child_index(&separators, key);
                match self.insert_rec(children[idx], key, value)? {
                    InsertOutcome::Updated(child) => {
                        children[idx] = child;
                    }
                    InsertOutcome::Split { left, right, separator } => {
                        children[idx] = left;
                        separators.insert(idx, separator);
                        children.insert(idx + 1, right);
                    }
                }
                if children.len() > ORDER {
                    let mid = separators.len() / 2;
                    let promoted = separators[mid].clone();
                    let right_seps = separators.split_off(mid + 1);
                    separators.pop(); // the promoted separator moves up
                    let right_children = children.split_off(mid + 1);
                    let left = self.write_node(&Node::Internal { separators, children })?;
                    let right = self.write_node(&Node::Internal {
                        separators: right_seps,
                        children: right_children,
                    })?;
                    Ok(InsertOutcome::Split { left, right, separator: promoted })
                } else {
                    Ok(InsertOutcome::Updated(
                        self.write_node(&Node::Internal { separators, children })?,
                    ))
                }
            }
        }
    }

    /// Returns the rewritten node offset, or `None` when the key was
    /// absent (nothing rewritten).
    fn delete_rec(&self, offset: u64, key: &[u8]) -> Result<Option<u64>> {
        match self.read_node(offset)? {
            Node::Leaf { mut entries } => {
                match entries.binary_search_by(|(k, _)| self.comparator.cmp(k, key)) {
                    Ok(idx) => {
                        entries.remove(idx);
                        Ok(Some(self.write_node(&Node::Leaf { entries })?))
                    }
                    Err(_) => Ok(None),
                }
            }
            Node::Internal { separators, mut children } => {
                let idx = self.child_index(&separators, key);
                match self.delete_rec(children[idx], key)? {
                    None => Ok(None),
                    Some(child) => {
                        children[idx] = child;
                        Ok(Some(self.write_node(&Node::Internal { separators, children })?))
                    }
                }
            }
        }
    }

    fn range_rec(
        &self,
        offset: u64,
        lo: Bound<&[u8]>,
        hi: Bound<&[u8]>,
        cb: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<bool> {
        match self.read_node(offset)? {
            Node::Leaf { entries } => {
                for (k, v) in &entries {
                    if !self.within_lo(k, lo) {
                        continue;
                    }
                    if !self.within_hi(k, hi) {
                        return Ok(false);
                    }
                    if !cb(k, v)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Node::Internal { separators, children } => {
                let start = match lo {
                    Bound::Unbounded => 0,
                    Bound::Included(k) | Bound::Excluded(k) => self.child_index(&separators, k),
                };
                for (i, child) in children.iter().enumerate().skip(start) {
                    // Once the subtree's lower bound passes hi, stop
                    if i > start {
                        let min_key = &separators[i - 1];
                        if !self.within_hi(min_key, hi) {
                            return Ok(false);
                        }
                    }
                    if !self.range_rec(*child, lo, hi, cb)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    fn within_lo(&self, key: &[u8], lo: Bound<&[u8]>) -> bool {
        match lo {
            Bound::Unbounded => true,
            Bound::Included(b) => self.comparator.cmp(key, b).is_ge(),
            Bound::Excluded(b) => self.comparator.cmp(key, b).is_gt(),
        }
    }

    fn within_hi(&self, key: &[u8], hi: Bound<&[u8]>) -> bool {
        match hi {
            Bound::Unbounded => true,
            Bound::Included(b) => self.comparator.cmp(key, b).is_le(),
            Bound::Excluded(b) => self.comparator.cmp(key, b).is_lt(),
        }
    }

    fn write_node(&self, node: &Node) -> Result<u64> {
        let frame = node.encode_frame()?;
        let mut io = self.io.lock();
        let offset = io.len;
        io.file.seek(SeekFrom::End(0))?;
        io.file.write_all(&frame)?;
        io.len += frame.len() as u64;
        Ok(offset)
    }

    fn read_node(&self, offset: u64) -> Result<Node> {
        if let Some((pool, file_id)) = &self.cache {
            let frame = pool.get((*file_id, offset), || self.read_frame_bytes(offset))?;
            return Node::decode_frame(&frame);
        }
        let frame = self.read_frame_bytes(offset)?;
        Node::decode_frame(&frame)
    }

    fn read_frame_bytes(&self, offset: u64) -> Result<Vec<u8>> {
        let mut io = self.io.lock();
        if offset >= io.len {
            return Err(Error::Corruption(format!(
                "tree node offset {} beyond file length {}",
                offset, io.len
            )));
        }
        io.file.seek(SeekFrom::Start(offset))?;
        let mut len_bytes = [0u8; 4];
        io.file.read_exact(&mut len_bytes)?;
        let body_len = LittleEndian::read_u32(&len_bytes) as usize;
        let mut frame = vec![0u8; body_len + 8];
        frame[0..4].copy_from_slice(&len_bytes);
        io.file.read_exact(&mut frame[4..])?;
        Ok(frame)
    }
}
