//! The per-project instance manager.
//!
//! Maps project ids to hot engine slots. The hot path (an already
//! initialised slot) touches nothing but a sharded map probe and two
//! atomics, so request dispatch never serialises on a manager-wide
//! mutex. Cold opens race through a compare-and-insert; losers wait on
//! the winner's init latch and observe the same outcome. A background
//! ticker evicts slots that sat at refcount zero past the idle TTL.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use loam_core::config::{EngineOptions, ManagerConfig, PoolConfig};
use loam_core::{Error, ProjectId, Result};
use loam_engine::{Engine, Ticker};

use crate::pool::ConnectionPool;

/// Manager counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerStats {
    /// Currently open engines.
    pub total: usize,
    pub acquires: u64,
    pub cold_opens: u64,
    pub evictions: u64,
}

struct SlotResources {
    engine: Arc<Engine>,
    pool: Arc<ConnectionPool>,
}

struct Slot {
    project: String,
    /// Set exactly once by the opener; losers wait on it. Failures are
    /// stringified so every waiter can observe them.
    init: OnceCell<std::result::Result<SlotResources, String>>,
    refcount: AtomicU64,
    /// Nanoseconds since manager start, stamped on acquire and release.
    last_access_ns: AtomicU64,
    /// Serialises eviction against late acquirers.
    guard: Mutex<()>,
}

impl Slot {
    fn new(project: &str) -> Arc<Slot> {
        Arc::new(Slot {
            project: project.to_string(),
            init: OnceCell::new(),
            refcount: AtomicU64::new(0),
            last_access_ns: AtomicU64::new(0),
            guard: Mutex::new(()),
        })
    }
}

/// A held engine reference. Dropping it releases the slot, decrementing
/// the ref count exactly once.
pub struct EngineLease {
    engine: Arc<Engine>,
    pool: Arc<ConnectionPool>,
    slot: Arc<Slot>,
    epoch: Instant,
}

impl EngineLease {
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The engine's connection pool, for callers that hold handles
    /// across requests.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        self.slot
            .last_access_ns
            .store(self.epoch.elapsed().as_nanos() as u64, Ordering::Release);
        self.slot.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Hot/cold pool of project engines.
pub struct InstanceManager {
    data_root: PathBuf,
    engine_options: EngineOptions,
    pool_config: PoolConfig,
    config: ManagerConfig,
    slots: Arc<DashMap<String, Arc<Slot>>>,
    closed: Arc<AtomicBool>,
    epoch: Instant,
    evictor: Mutex<Option<Ticker>>,
    acquires: AtomicU64,
    cold_opens: AtomicU64,
    evictions: Arc<AtomicU64>,
}

impl InstanceManager {
    pub fn new(
        data_root: PathBuf,
        engine_options: EngineOptions,
        pool_config: PoolConfig,
        config: ManagerConfig,
    ) -> Arc<InstanceManager> {
        let slots: Arc<DashMap<String, Arc<Slot>>> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let evictions = Arc::new(AtomicU64::new(0));
        let epoch = Instant::now();

        let manager = Arc::new(InstanceManager {
            data_root,
            engine_options,
            pool_config,
            config: config.clone(),
            slots: Arc::clone(&slots),
            closed: Arc::clone(&closed),
            epoch,
            evictor: Mutex::new(None),
            acquires: AtomicU64::new(0),
            cold_opens: AtomicU64::new(0),
            evictions: Arc::clone(&evictions),
        });

        let idle_ttl = config.idle_ttl();
        let evictor = {
            let slots = Arc::clone(&slots);
            let closed = Arc::clone(&closed);
            let evictions = Arc::clone(&evictions);
            Ticker::spawn("evict", config.evict_interval(), move || {
                if closed.load(Ordering::Acquire) {
                    return;
                }
                let now_ns = epoch.elapsed().as_nanos() as u64;
                let ttl_ns = idle_ttl.as_nanos() as u64;
                evict_pass(&slots, now_ns, ttl_ns, &evictions);
            })
        };
        *manager.evictor.lock() = Some(evictor);
        manager
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Acquire the engine for a project, opening it on first use.
    pub fn acquire(&self, project: &ProjectId) -> Result<EngineLease> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ManagerClosed);
        }
        self.acquires.fetch_add(1, Ordering::Relaxed);

        loop {
            // Fast path: probe without any manager-wide lock
            if let Some(slot) = self.slots.get(project.as_str()).map(|s| Arc::clone(&s)) {
                let lease = self.wait_for_slot(&slot)?;
                if lease.engine().is_closed() {
                    // Lost a race with eviction; the slot is gone from
                    // the map, so the next round opens fresh
                    drop(lease);
                    continue;
                }
                return Ok(lease);
            }

            // Cold path: compare-and-insert a fresh slot
            let slot = Slot::new(project.as_str());
            let winner = match self.slots.entry(project.as_str().to_string()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(Arc::clone(&slot));
                    true
                }
                Entry::Occupied(_) => false,
            };
            if !winner {
                continue;
            }

            self.cold_opens.fetch_add(1, Ordering::Relaxed);
            let opened = self.open_resources(project);
            match opened {
                Ok(resources) => {
                    let lease = self.lease(&slot, &resources);
                    slot.init
                        .set(Ok(resources))
                        .unwrap_or_else(|_| unreachable!("init latch set twice"));
                    info!(project = %project, "engine opened");
                    return Ok(lease);
                }
                Err(e) => {
                    let message = e.to_string();
                    slot.init
                        .set(Err(message))
                        .unwrap_or_else(|_| unreachable!("init latch set twice"));
                    // Failed engines are never cached; retry is possible
                    self.slots
                        .remove_if(project.as_str(), |_, s| Arc::ptr_eq(s, &slot));
                    return Err(e);
                }
            }
        }
    }

    /// Wait on a slot's init latch: the winner's outcome, success or
    /// failure, is what every waiter observes.
    fn wait_for_slot(&self, slot: &Arc<Slot>) -> Result<EngineLease> {
        match slot.init.wait() {
            Ok(resources) => Ok(self.lease(slot, resources)),
            Err(message) => {
                self.slots
                    .remove_if(slot.project.as_str(), |_, s| Arc::ptr_eq(s, slot));
                Err(Error::Transient(format!(
                    "engine open for project {:?} failed: {}",
                    slot.project, message
                )))
            }
        }
    }

    fn lease(&self, slot: &Arc<Slot>, resources: &SlotResources) -> EngineLease {
        slot.refcount.fetch_add(1, Ordering::AcqRel);
        slot.last_access_ns.store(self.now_ns(), Ordering::Release);
        EngineLease {
            engine: Arc::clone(&resources.engine),
            pool: Arc::clone(&resources.pool),
            slot: Arc::clone(slot),
            epoch: self.epoch,
        }
    }

    fn open_resources(&self, project: &ProjectId) -> Result<SlotResources> {
        if self.slots.len() > self.config.max_hot_engines {
            warn!(
                hot = self.slots.len(),
                cap = self.config.max_hot_engines,
                "hot engine count above configured cap"
            );
        }
        let dir = self.data_root.join(project.as_str());
        let engine = Engine::open(&dir, self.engine_options.clone())?;
        let pool = ConnectionPool::new(Arc::clone(&engine), self.pool_config.clone());
        Ok(SlotResources { engine, pool })
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            total: self.slots.len(),
            acquires: self.acquires.load(Ordering::Relaxed),
            cold_opens: self.cold_opens.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Evict and close every idle slot now, regardless of TTL. Test and
    /// shutdown support.
    pub fn evict_idle_now(&self) {
        evict_pass(&self.slots, u64::MAX, 0, &self.evictions);
    }

    /// Close the manager: refuse new acquires and close every engine.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(evictor) = self.evictor.lock().take() {
            evictor.stop();
        }
        let projects: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for project in projects {
            if let Some((_, slot)) = self.slots.remove(&project) {
                if let Some(Ok(resources)) = slot.init.get() {
                    resources.pool.close();
                    if let Err(e) = resources.engine.close() {
                        warn!(project = %slot.project, error = %e, "engine close failed");
                    }
                }
            }
        }
        info!("instance manager closed");
    }
}

impl Drop for InstanceManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn evict_pass(
    slots: &DashMap<String, Arc<Slot>>,
    now_ns: u64,
    ttl_ns: u64,
    evictions: &AtomicU64,
) {
    let candidates: Vec<Arc<Slot>> = slots
        .iter()
        .filter(|entry| {
            let slot = entry.value();
            slot.refcount.load(Ordering::Acquire) == 0
                && now_ns.saturating_sub(slot.last_access_ns.load(Ordering::Acquire)) > ttl_ns
                && slot.init.get().map(|r| r.is_ok()).unwrap_or(false)
        })
        .map(|entry| Arc::clone(entry.value()))
        .collect();

    for slot in candidates {
        // Take the slot out of the map, then re-check under its guard
        let removed = slots
            .remove_if(slot.project.as_str(), |_, s| Arc::ptr_eq(s, &slot))
            .is_some();
        if !removed {
            continue;
        }
        let _guard = slot.guard.lock();
        if slot.refcount.load(Ordering::Acquire) > 0 {
            // Raced with an acquirer: put the slot back untouched
            slots.insert(slot.project.clone(), Arc::clone(&slot));
            continue;
        }
        if let Some(Ok(resources)) = slot.init.get() {
            debug!(project = %slot.project, "evicting idle engine");
            resources.pool.close();
            if let Err(e) = resources.engine.close() {
                warn!(project = %slot.project, error = %e, "evicted engine close failed");
            }
        }
        evictions.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam_core::config::EngineOptions;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, idle_ttl_ms: u64, evict_interval_ms: u64) -> Arc<InstanceManager> {
        InstanceManager::new(
            dir.path().to_path_buf(),
            EngineOptions::default(),
            PoolConfig::default(),
            ManagerConfig {
                max_hot_engines: 8,
                idle_ttl_ms,
                evict_interval_ms,
            },
        )
    }

    fn project(name: &str) -> ProjectId {
        ProjectId::new(name).unwrap()
    }

    #[test]
    fn hot_path_returns_the_same_engine() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 60_000, 60_000);
        let p = project("p1");

        let a = mgr.acquire(&p).unwrap();
        let b = mgr.acquire(&p).unwrap();
        assert!(Arc::ptr_eq(a.engine(), b.engine()));
        assert_eq!(mgr.stats().total, 1);
        assert_eq!(mgr.stats().cold_opens, 1);
    }

    #[test]
    fn concurrent_acquires_share_one_cold_open() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 60_000, 60_000);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let mgr = Arc::clone(&mgr);
            handles.push(std::thread::spawn(move || {
                let lease = mgr.acquire(&project("shared")).unwrap();
                std::thread::sleep(Duration::from_millis(20));
                Arc::as_ptr(lease.engine()) as usize
            }));
        }
        let pointers: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(pointers.windows(2).all(|w| w[0] == w[1]));

        let stats = mgr.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.cold_opens, 1);
        assert_eq!(stats.acquires, 50);
    }

    #[test]
    fn idle_slots_are_evicted_after_ttl() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 100, 50);
        let p = project("p1");

        drop(mgr.acquire(&p).unwrap());
        assert_eq!(mgr.stats().total, 1);

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(mgr.stats().total, 0, "idle slot survived eviction");

        // Re-acquire opens a fresh engine
        let lease = mgr.acquire(&p).unwrap();
        assert!(!lease.engine().is_closed());
        assert_eq!(mgr.stats().cold_opens, 2);
    }

    #[test]
    fn active_slots_survive_ttl_expiry() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 50, 25);
        let p = project("p1");

        let lease = mgr.acquire(&p).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        // Still held: eviction must not have closed it
        assert_eq!(mgr.stats().total, 1);
        assert!(!lease.engine().is_closed());
        drop(lease);
    }

    #[test]
    fn failed_open_is_not_cached() {
        let dir = TempDir::new().unwrap();
        // A file where the project directory should be makes open fail
        std::fs::write(dir.path().join("bad"), b"not a directory").unwrap();
        let mgr = manager(&dir, 60_000, 60_000);

        assert!(mgr.acquire(&project("bad")).is_err());
        assert_eq!(mgr.stats().total, 0);
        // A second attempt runs a fresh open rather than a cached error
        assert!(mgr.acquire(&project("bad")).is_err());
        assert_eq!(mgr.stats().cold_opens, 2);
    }

    #[test]
    fn closed_manager_refuses_acquire() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 60_000, 60_000);
        let lease = mgr.acquire(&project("p1")).unwrap();
        drop(lease);
        mgr.close();
        assert!(matches!(
            mgr.acquire(&project("p1")),
            Err(Error::ManagerClosed)
        ));
    }

    #[test]
    fn distinct_projects_get_distinct_engines() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 60_000, 60_000);
        let a = mgr.acquire(&project("a")).unwrap();
        let b = mgr.acquire(&project("b")).unwrap();
        assert!(!Arc::ptr_eq(a.engine(), b.engine()));
        assert_eq!(mgr.stats().total, 2);
    }
}
