//! Per-engine connection pool.
//!
//! Handles are exclusive between `acquire` and `release`. A health
//! loop drops handles whose engine reports itself closed and trims
//! idle handles beyond the configured minimum. The pool never exceeds
//! `max_size` handles in existence.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::debug;

use loam_core::config::PoolConfig;
use loam_core::{Error, Result};
use loam_engine::{Engine, Ticker};

/// Pool counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub recycled: u64,
}

struct ConnEntry {
    engine: Arc<Engine>,
    created_at: Instant,
    last_used: Instant,
}

struct PoolInner {
    idle: Vec<ConnEntry>,
    total: usize,
    closed: bool,
}

struct PoolShared {
    engine: Arc<Engine>,
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    created: AtomicU64,
    recycled: AtomicU64,
}

/// Bounded pool of handles on one engine.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    health: Mutex<Option<Ticker>>,
}

/// One checked-out handle. Dropping it returns it to its pool.
pub struct Connection {
    entry: Option<ConnEntry>,
    pool: Weak<PoolShared>,
}

impl Connection {
    pub fn engine(&self) -> &Arc<Engine> {
        &self.entry.as_ref().expect("connection not yet released").engine
    }

    pub fn created_at(&self) -> Instant {
        self.entry.as_ref().expect("connection not yet released").created_at
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.give_back(entry);
            }
        }
    }
}

impl PoolShared {
    fn give_back(&self, mut entry: ConnEntry) {
        let mut inner = self.inner.lock();
        if inner.closed || entry.engine.is_closed() {
            inner.total -= 1;
            return;
        }
        entry.last_used = Instant::now();
        inner.idle.push(entry);
    }
}

impl ConnectionPool {
    /// Build a pool over an opened engine, pre-warming `min_size`
    /// handles and starting the health loop.
    pub fn new(engine: Arc<Engine>, config: PoolConfig) -> Arc<ConnectionPool> {
        let shared = Arc::new(PoolShared {
            engine,
            config: config.clone(),
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                total: 0,
                closed: false,
            }),
            created: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
        });

        {
            let mut inner = shared.inner.lock();
            for _ in 0..config.min_size.min(config.max_size) {
                let entry = new_entry(&shared);
                inner.idle.push(entry);
                inner.total += 1;
            }
        }

        let health_shared = Arc::clone(&shared);
        let health = Ticker::spawn("pool-health", config.health_interval(), move || {
            health_pass(&health_shared);
        });

        Arc::new(ConnectionPool {
            shared,
            health: Mutex::new(Some(health)),
        })
    }

    /// Take an idle healthy handle, or grow, or fail with exhaustion.
    pub fn acquire(&self) -> Result<Connection> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(Error::PoolClosed);
        }

        // Reuse the most recently used healthy handle
        while let Some(entry) = inner.idle.pop() {
            if entry.engine.is_closed() {
                inner.total -= 1;
                continue;
            }
            self.shared.recycled.fetch_add(1, Ordering::Relaxed);
            return Ok(Connection {
                entry: Some(entry),
                pool: Arc::downgrade(&self.shared),
            });
        }

        if inner.total >= self.shared.config.max_size {
            return Err(Error::PoolExhausted);
        }
        let entry = new_entry(&self.shared);
        inner.total += 1;
        Ok(Connection {
            entry: Some(entry),
            pool: Arc::downgrade(&self.shared),
        })
    }

    /// Explicit release. Fails when the handle belongs to another pool;
    /// the handle is still returned to its own pool in that case.
    pub fn release(&self, mut conn: Connection) -> Result<()> {
        let belongs = conn
            .pool
            .upgrade()
            .map(|p| Arc::ptr_eq(&p, &self.shared))
            .unwrap_or(false);
        if !belongs {
            // Dropping `conn` hands it back to its real owner
            return Err(Error::ForeignConnection);
        }
        if let Some(entry) = conn.entry.take() {
            self.shared.give_back(entry);
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.inner.lock();
        PoolStats {
            total: inner.total,
            idle: inner.idle.len(),
            in_use: inner.total - inner.idle.len(),
            created: self.shared.created.load(Ordering::Relaxed),
            recycled: self.shared.recycled.load(Ordering::Relaxed),
        }
    }

    /// Stop the health loop and drop idle handles. In-use handles die
    /// when released.
    pub fn close(&self) {
        if let Some(health) = self.health.lock().take() {
            health.stop();
        }
        let mut inner = self.shared.inner.lock();
        inner.closed = true;
        let dropped = inner.idle.len();
        inner.total -= dropped;
        inner.idle.clear();
        debug!(dropped, "connection pool closed");
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn new_entry(shared: &Arc<PoolShared>) -> ConnEntry {
    shared.created.fetch_add(1, Ordering::Relaxed);
    ConnEntry {
        engine: Arc::clone(&shared.engine),
        created_at: Instant::now(),
        last_used: Instant::now(),
    }
}

fn health_pass(shared: &Arc<PoolShared>) {
    let mut inner = shared.inner.lock();
    if inner.closed {
        return;
    }
    let min_size = shared.config.min_size;
    let idle_timeout = shared.config.idle_timeout();

    // Handles of a closed engine are never handed out again
    let before = inner.idle.len();
    inner.idle.retain(|entry| !entry.engine.is_closed());
    inner.total -= before - inner.idle.len();

    // Trim idle handles beyond min_size
    while inner.total > min_size {
        let oldest = inner
            .idle
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(i, e)| (i, e.last_used));
        match oldest {
            Some((index, last_used)) if last_used.elapsed() > idle_timeout => {
                inner.idle.remove(index);
                inner.total -= 1;
            }
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam_core::config::EngineOptions;
    use std::time::Duration;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> Arc<Engine> {
        Engine::open(&dir.path().join("p"), EngineOptions::default()).unwrap()
    }

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_size: min,
            max_size: max,
            idle_timeout_ms: 50,
            health_interval_ms: 20,
        }
    }

    #[test]
    fn acquire_reuses_released_handles() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::new(engine(&dir), config(0, 4));

        let conn = pool.acquire().unwrap();
        assert_eq!(pool.stats().total, 1);
        pool.release(conn).unwrap();

        let _conn = pool.acquire().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.recycled, 1);
    }

    #[test]
    fn exhaustion_at_max_size() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::new(engine(&dir), config(0, 2));

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(Error::PoolExhausted)));

        drop(a);
        let _c = pool.acquire().unwrap();
        drop(b);
    }

    #[test]
    fn release_to_wrong_pool_is_an_error() {
        let dir1 = TempDir::new().unwrap();
        let dir2 = TempDir::new().unwrap();
        let pool1 = ConnectionPool::new(engine(&dir1), config(0, 2));
        let pool2 = ConnectionPool::new(engine(&dir2), config(0, 2));

        let conn = pool1.acquire().unwrap();
        assert!(matches!(pool2.release(conn), Err(Error::ForeignConnection)));
        // The handle found its way home regardless
        assert_eq!(pool1.stats().idle, 1);
    }

    #[test]
    fn health_loop_trims_idle_beyond_min() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::new(engine(&dir), config(1, 8));

        let conns: Vec<Connection> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        for conn in conns {
            pool.release(conn).unwrap();
        }
        assert_eq!(pool.stats().total, 4);

        // Idle timeout is 50ms, health interval 20ms
        std::thread::sleep(Duration::from_millis(200));
        let stats = pool.stats();
        assert_eq!(stats.total, 1, "stats: {:?}", stats);
    }

    #[test]
    fn closed_engine_handles_are_dropped() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);
        let pool = ConnectionPool::new(Arc::clone(&eng), config(0, 4));
        let conn = pool.acquire().unwrap();
        pool.release(conn).unwrap();

        eng.close().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.stats().total, 0);
        // A fresh acquire creates a handle, but its engine is closed;
        // callers observe that through the engine itself
        let conn = pool.acquire().unwrap();
        assert!(conn.engine().is_closed());
    }

    #[test]
    fn closed_pool_rejects_acquire() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::new(engine(&dir), config(1, 4));
        pool.close();
        assert!(matches!(pool.acquire(), Err(Error::PoolClosed)));
    }
}
