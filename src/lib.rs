//! # LoamDB
//!
//! A multi-tenant document-database platform: one process hosts many
//! independent logical databases ("projects"), each with its own
//! storage engine, MVCC transactions, collections, secondary indexes
//! and change stream, behind a length-prefixed TCP wire protocol and a
//! raft replication layer.
//!
//! # Quick Start
//!
//! ```no_run
//! use loamdb::{Platform, PlatformConfig, Document, IsolationLevel, ProjectId};
//! use serde_json::json;
//!
//! fn main() -> loamdb::Result<()> {
//!     let mut config = PlatformConfig::default();
//!     config.data_root = "./loam-data".into();
//!     let platform = Platform::new(config)?;
//!
//!     // Acquire a project engine (opened lazily, shared, evicted when idle)
//!     let lease = platform.manager().acquire(&ProjectId::new("proj1")?)?;
//!     let engine = lease.engine();
//!
//!     engine.create_collection("users", None)?;
//!     let users = engine.collection("users")?;
//!
//!     let txn = engine.begin(IsolationLevel::ReadCommitted)?;
//!     users.insert(txn, Document::from_value(json!({"_id": "u1", "name": "Alice"}))?)?;
//!     engine.commit(txn)?;
//!
//!     // Serve the framed wire protocol
//!     let addr = platform.serve("127.0.0.1:7440")?;
//!     println!("listening on {}", addr);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! | Layer | Crate | Responsibility |
//! |-------|-------|----------------|
//! | Instance manager | `loam-pool` | project id → engine, hot/cold, ref-counted, idle-evicted |
//! | Connection pool | `loam-pool` | bounded health-checked handles on one engine |
//! | Engine | `loam-engine` | collections, catalog, change bus, KV surface |
//! | Transactions | `loam-concurrency` | MVCC versions, snapshots, isolation levels |
//! | Durability | `loam-durability` | CRC-checked WAL, group commit, recovery |
//! | Storage | `loam-storage` | document file, buffer pool, B+Tree indexes |
//! | Queries | `loam-query` | filter AST, iterator pipeline, index selection |
//! | Replication | `loam-replication` | leader election, log replication, apply |
//! | Wire | `loam-net` | framed transport, op gateway, server, client |
//!
//! The [`Platform`] struct assembles the instance manager, the gateway
//! and the server from one validated [`PlatformConfig`]. Embedders that
//! want no network front end can use the manager directly.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

pub use loam_concurrency::{CommitSink, Snapshot, TransactionManager, WriteOp};
pub use loam_core::config::{
    EngineOptions, FsyncMode, HealingConfig, ManagerConfig, MemoryConfig, PlatformConfig,
    PoolConfig, QueryConfig, ReplicationConfig, SchedulerConfig, WalOptions,
};
pub use loam_core::{
    CommitSeq, Document, Error, IsolationLevel, Key, Lsn, ProjectId, Result, TxnId,
};
pub use loam_durability::{RecordKind, Wal, WalRecord};
pub use loam_engine::{
    ChangeEvent, ChangeKind, Collection, Engine, EngineStats, KvSurface, PatchOp, Schema,
    StreamItem, Subscription,
};
pub use loam_net::{
    Client, ExecuteOp, ExecuteRequest, Gateway, OpCode, QueryBody, Server, ServerConfig, Status,
    TcpRaftTransport,
};
pub use loam_pool::{Connection, ConnectionPool, EngineLease, InstanceManager, ManagerStats};
pub use loam_query::{Filter, QueryOptions};
pub use loam_replication::{
    InMemoryNetwork, NodeId, NodeState, RaftConfig, RaftNode, RaftTransport, StateMachine,
};
pub use loam_storage::btree::Comparator;

/// The assembled platform: instance manager, gateway, and (once
/// [`Platform::serve`] is called) the TCP front end.
pub struct Platform {
    config: PlatformConfig,
    manager: Arc<InstanceManager>,
    gateway: Arc<Gateway>,
    server: Mutex<Option<Server>>,
}

impl Platform {
    /// Validate the configuration and build the manager and gateway.
    /// No engine is opened until its project is first acquired.
    pub fn new(config: PlatformConfig) -> Result<Platform> {
        config.validate()?;
        let manager = InstanceManager::new(
            config.data_root.clone(),
            config.engine.clone(),
            config.pool.clone(),
            config.manager.clone(),
        );
        let gateway = Arc::new(Gateway::new(Arc::clone(&manager)));
        Ok(Platform {
            config,
            manager,
            gateway,
            server: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<InstanceManager> {
        &self.manager
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Start serving the framed protocol. Returns the bound address
    /// (useful with a `:0` port).
    pub fn serve(&self, bind_addr: &str) -> Result<SocketAddr> {
        let server = Server::start(
            ServerConfig {
                bind_addr: bind_addr.to_string(),
                ..ServerConfig::default()
            },
            Arc::clone(&self.gateway),
        )?;
        let addr = server.local_addr();
        *self.server.lock() = Some(server);
        Ok(addr)
    }

    /// Attach a raft node: replication RPC opcodes are answered by it
    /// and document writes go through the replicated log.
    pub fn enable_replication(&self, node: Arc<RaftNode>) {
        self.gateway.set_raft(node);
    }

    /// Stop the server (if any) and close every open engine.
    pub fn shutdown(&self) {
        if let Some(server) = self.server.lock().take() {
            server.shutdown();
        }
        self.manager.close();
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Adapter that lets a raft node drive a project engine: committed
/// commands are WAL-record bytes replayed through the engine's apply
/// path. Holding the lease keeps the engine hot for the node's
/// lifetime.
pub struct EngineStateMachine {
    lease: EngineLease,
}

impl EngineStateMachine {
    pub fn new(lease: EngineLease) -> EngineStateMachine {
        EngineStateMachine { lease }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        self.lease.engine()
    }
}

impl StateMachine for EngineStateMachine {
    fn apply(&self, _index: u64, command: &[u8]) -> Result<()> {
        self.lease.engine().apply_command(command)
    }
}
