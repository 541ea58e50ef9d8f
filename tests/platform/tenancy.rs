//! Instance-manager tenancy behaviour: hot-path sharing, idle
//! eviction, no-evict-while-active.

use std::sync::Arc;
use std::time::Duration;

use loamdb::{EngineOptions, InstanceManager, ManagerConfig, PoolConfig, ProjectId};
use tempfile::TempDir;

fn manager(dir: &TempDir, idle_ttl_ms: u64, evict_interval_ms: u64) -> Arc<InstanceManager> {
    InstanceManager::new(
        dir.path().to_path_buf(),
        EngineOptions::default(),
        PoolConfig::default(),
        ManagerConfig {
            max_hot_engines: 16,
            idle_ttl_ms,
            evict_interval_ms,
        },
    )
}

#[test]
fn fifty_workers_share_one_hot_engine() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir, 60_000, 60_000);
    let project = ProjectId::new("p").unwrap();

    let mut handles = Vec::new();
    for _ in 0..50 {
        let mgr = Arc::clone(&mgr);
        let project = project.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..2 {
                let lease = mgr.acquire(&project).unwrap();
                std::thread::sleep(Duration::from_millis(20));
                drop(lease);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = mgr.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.cold_opens, 1);
    assert_eq!(stats.acquires, 100);
    mgr.close();
}

#[test]
fn idle_engine_evicts_after_ttl() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir, 100, 50);
    let project = ProjectId::new("p").unwrap();

    drop(mgr.acquire(&project).unwrap());
    assert_eq!(mgr.stats().total, 1);

    // TTL 100ms, evict interval 50ms: well within half a second
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while mgr.stats().total != 0 {
        assert!(std::time::Instant::now() < deadline, "engine never evicted");
        std::thread::sleep(Duration::from_millis(25));
    }
    mgr.close();
}

#[test]
fn held_lease_blocks_eviction() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir, 100, 50);
    let project = ProjectId::new("p").unwrap();

    let lease = mgr.acquire(&project).unwrap();
    std::thread::sleep(Duration::from_millis(300));

    // Ref count is nonzero the whole time: no amount of TTL expiry
    // closes the engine
    assert_eq!(mgr.stats().total, 1);
    assert!(!lease.engine().is_closed());
    drop(lease);
    mgr.close();
}
