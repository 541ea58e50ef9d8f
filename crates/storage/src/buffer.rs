//! Buffer pool.
//!
//! A byte-budgeted LRU cache of decoded frames shared by the data file
//! and the B+Tree node reader. Entries are handed out as `Arc`s; an
//! entry still referenced by a reader counts as pinned and is skipped
//! by eviction. All cached frames are clean copies of durable bytes
//! (writes go straight to their files), so eviction never loses data.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use loam_core::Result;

/// Cache key: (file id, byte offset).
pub type FrameId = (u32, u64);

#[derive(Debug, Clone, Copy, Default)]
pub struct BufferPoolStats {
    pub entries: usize,
    pub bytes: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct PoolInner {
    map: FxHashMap<FrameId, Arc<Vec<u8>>>,
    // Lazy LRU: keys are re-pushed on touch, stale entries skipped on evict
    order: VecDeque<FrameId>,
    bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Shared frame cache with a resident byte budget.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
}

impl BufferPool {
    /// `capacity` is the resident budget in bytes.
    pub fn new(capacity: usize) -> Self {
        BufferPool {
            inner: Mutex::new(PoolInner {
                map: FxHashMap::default(),
                order: VecDeque::new(),
                bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            capacity,
        }
    }

    /// Fetch a frame through the cache. `load` runs on miss, outside any
    /// awareness of the pool but under its lock; loaders must not call
    /// back into the pool.
    pub fn get(
        &self,
        id: FrameId,
        load: impl FnOnce() -> Result<Vec<u8>>,
    ) -> Result<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.map.get(&id) {
            let frame = Arc::clone(frame);
            inner.hits += 1;
            inner.order.push_back(id);
            return Ok(frame);
        }

        let bytes = load()?;
        inner.misses += 1;
        let frame = Arc::new(bytes);
        inner.bytes += frame.len();
        inner.map.insert(id, Arc::clone(&frame));
        inner.order.push_back(id);
        self.evict_to_budget(&mut inner);
        Ok(frame)
    }

    /// Drop every cached frame belonging to `file_id`.
    pub fn invalidate_file(&self, file_id: u32) {
        let mut inner = self.inner.lock();
        let removed: Vec<FrameId> = inner
            .map
            .keys()
            .filter(|(f, _)| *f == file_id)
            .copied()
            .collect();
        for id in removed {
            if let Some(frame) = inner.map.remove(&id) {
                inner.bytes -= frame.len();
            }
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        let inner = self.inner.lock();
        BufferPoolStats {
            entries: inner.map.len(),
            bytes: inner.bytes,
            capacity: self.capacity,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }

    fn evict_to_budget(&self, inner: &mut PoolInner) {
        let mut scanned = 0;
        let budget_scan = inner.order.len();
        while inner.bytes > self.capacity && scanned < budget_scan {
            scanned += 1;
            let id = match inner.order.pop_front() {
                Some(id) => id,
                None => break,
            };
            let pinned = match inner.map.get(&id) {
                // Stale order entry (already evicted or re-touched later)
                None => continue,
                Some(frame) => Arc::strong_count(frame) > 1,
            };
            if pinned {
                inner.order.push_back(id);
                continue;
            }
            // Only evict if this is the most recent order entry for the id,
            // otherwise a fresher touch exists further back in the queue
            if inner.order.contains(&id) {
                continue;
            }
            if let Some(frame) = inner.map.remove(&id) {
                inner.bytes -= frame.len();
                inner.evictions += 1;
            }
        }
    }
}
