//! The engine facade.
//!
//! `Engine::open` assembles the catalog, data file, buffer pool,
//! B+Trees, WAL (with recovery), transaction manager, change bus and
//! background workers for one project directory. Everything the
//! platform exposes to callers goes through here.
//!
//! # On-disk layout
//!
//! ```text
//! <data-root>/<project>/
//!   LOCK                        held exclusively while open
//!   catalog.json                system catalog, atomically rewritten
//!   data.db                     document payload frames
//!   index/<collection>/_id      primary tree (id → pointer)
//!   index/<collection>/<field>  one tree per secondary index
//!   index/_kv/keys              key/value surface tree
//!   wal/<project>.wal[.n]       write-ahead log segments
//! ```

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use loam_concurrency::{CommitSink, TransactionManager, TxnManagerStats, WriteOp};
use loam_core::config::EngineOptions;
use loam_core::{CommitSeq, Document, Error, IsolationLevel, Key, ProjectId, Result, TxnId};
use loam_durability::{recover, RecordKind, Wal, WalRecord, WalStats};
use loam_storage::btree::{BTree, Comparator, EMPTY_ROOT};
use loam_storage::{BufferPool, BufferPoolStats, DataFile, StoragePointer};

use crate::background::{BackgroundScheduler, SchedulerStats, TaskPriority, Ticker};
use crate::catalog::{Catalog, CollectionMeta, IndexMeta};
use crate::changebus::{ChangeBus, ChangeEvent, ChangeKind, Subscription};
use crate::collection::Collection;
use crate::encoding::{decode_posting, encode_index_value, encode_posting};
use crate::healing::HealState;
use crate::kv::KvSurface;
use crate::schema::Schema;

/// Buffer-pool file id of the data file; tree ids are assigned from
/// [`FIRST_TREE_FILE_ID`] upward.
const DATA_FILE_ID: u32 = 0;
const KV_FILE_ID: u32 = 1;
const FIRST_TREE_FILE_ID: u32 = 2;

const GC_PERIOD: Duration = Duration::from_secs(30);
const CHECKPOINT_CHECK_PERIOD: Duration = Duration::from_secs(5);

/// One collection's open trees.
pub(crate) struct CollectionCore {
    pub name: String,
    pub schema: Option<Schema>,
    pub primary: Arc<BTree>,
    pub secondaries: RwLock<FxHashMap<String, Arc<BTree>>>,
}

impl CollectionCore {
    pub fn indexed_fields(&self) -> Vec<String> {
        self.secondaries.read().keys().cloned().collect()
    }

    pub fn secondary(&self, field: &str) -> Option<Arc<BTree>> {
        self.secondaries.read().get(field).cloned()
    }
}

/// State shared between the facade, collection handles and the commit
/// sink. The engine owns exactly one.
pub(crate) struct EngineShared {
    pub project: ProjectId,
    pub dir: PathBuf,
    pub data: Arc<DataFile>,
    pub buffer: Arc<BufferPool>,
    pub catalog: Arc<Catalog>,
    pub collections: RwLock<FxHashMap<String, Arc<CollectionCore>>>,
    pub kv_tree: Arc<BTree>,
    pub bus: ChangeBus,
    pub ddl: Mutex<()>,
    pub docs_examined: AtomicU64,
    pub active_queries: AtomicU64,
    pub corrupt_frames: AtomicU64,
    /// Set by a failed CRC on the read path; the healing ticker picks
    /// it up when `trigger_on_read_corruption` is configured.
    pub read_corruption_seen: AtomicBool,
    pub next_file_id: AtomicU32,
}

impl EngineShared {
    pub fn collection_core(&self, name: &str) -> Result<Arc<CollectionCore>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    /// Read a payload frame through the buffer pool, recording read
    /// corruption for the healing loop.
    pub fn read_payload(&self, ptr: StoragePointer) -> Result<Vec<u8>> {
        let result = self.buffer.get((DATA_FILE_ID, ptr.offset), || self.data.read(ptr));
        match result {
            Ok(frame) => Ok(frame.as_ref().clone()),
            Err(e) => {
                if matches!(e, Error::Corruption(_)) {
                    self.corrupt_frames.fetch_add(1, Ordering::Relaxed);
                    self.read_corruption_seen.store(true, Ordering::Release);
                }
                Err(e)
            }
        }
    }

    /// Committed document bytes via the primary index, or `None`.
    pub fn load_committed(&self, core: &CollectionCore, id: &str) -> Result<Option<Vec<u8>>> {
        let ptr_bytes = match core.primary.get(id.as_bytes())? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let ptr: StoragePointer = bincode::deserialize(&ptr_bytes)
            .map_err(|e| Error::Corruption(format!("primary pointer: {}", e)))?;
        self.read_payload(ptr).map(Some)
    }

    fn index_insert(&self, tree: &BTree, value: &serde_json::Value, id: &str) -> Result<()> {
        let encoded = match encode_index_value(tree.comparator(), value) {
            Some(key) => key,
            None => return Ok(()),
        };
        let mut ids = match tree.get(&encoded)? {
            Some(bytes) => decode_posting(&bytes)?,
            None => Vec::new(),
        };
        if let Err(pos) = ids.binary_search_by(|existing| existing.as_str().cmp(id)) {
            ids.insert(pos, id.to_string());
            tree.put(&encoded, &encode_posting(&ids)?)?;
        }
        Ok(())
    }

    fn index_remove(&self, tree: &BTree, value: &serde_json::Value, id: &str) -> Result<()> {
        let encoded = match encode_index_value(tree.comparator(), value) {
            Some(key) => key,
            None => return Ok(()),
        };
        if let Some(bytes) = tree.get(&encoded)? {
            let mut ids = decode_posting(&bytes)?;
            if let Ok(pos) = ids.binary_search_by(|existing| existing.as_str().cmp(id)) {
                ids.remove(pos);
                if ids.is_empty() {
                    tree.delete(&encoded)?;
                } else {
                    tree.put(&encoded, &encode_posting(&ids)?)?;
                }
            }
        }
        Ok(())
    }

    /// Apply one committed mutation to the data file and indexes. The
    /// WAL record for it is already durable; on replay after a crash
    /// this runs again and converges to the same state.
    pub fn apply_op(&self, key: &Key, op: &WriteOp) -> Result<()> {
        match key {
            Key::Kv { key: kv_key } => match op {
                WriteOp::Put(payload) | WriteOp::Expire(payload) => {
                    self.kv_tree.put(kv_key.as_bytes(), payload)
                }
                WriteOp::Delete => self.kv_tree.delete(kv_key.as_bytes()).map(|_| ()),
            },
            Key::Document { collection, id } => {
                let core = match self.collections.read().get(collection) {
                    Some(core) => Arc::clone(core),
                    None => {
                        // Collection dropped while the write was in flight
                        warn!(collection, "dropping write for missing collection");
                        return Ok(());
                    }
                };
                let old_doc = self
                    .load_committed(&core, id)?
                    .map(|bytes| Document::from_bytes(&bytes))
                    .transpose()?;

                match op {
                    WriteOp::Put(payload) | WriteOp::Expire(payload) => {
                        let new_doc = Document::from_bytes(payload)?;
                        let ptr = self.data.append(payload)?;
                        let ptr_bytes = bincode::serialize(&ptr)
                            .map_err(|e| Error::Serialization(e.to_string()))?;
                        core.primary.put(id.as_bytes(), &ptr_bytes)?;

                        let secondaries = core.secondaries.read();
                        for (field, tree) in secondaries.iter() {
                            let old_value = old_doc.as_ref().and_then(|d| d.field(field));
                            let new_value = new_doc.field(field);
                            if old_value == new_value {
                                continue;
                            }
                            if let Some(value) = old_value {
                                self.index_remove(tree, value, id)?;
                            }
                            if let Some(value) = new_value {
                                self.index_insert(tree, value, id)?;
                            }
                        }
                    }
                    WriteOp::Delete => {
                        core.primary.delete(id.as_bytes())?;
                        if let Some(old) = &old_doc {
                            let secondaries = core.secondaries.read();
                            for (field, tree) in secondaries.iter() {
                                if let Some(value) = old.field(field) {
                                    self.index_remove(tree, value, id)?;
                                }
                            }
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Create a secondary index and backfill it from committed state.
    pub fn create_index(
        self: &Arc<Self>,
        collection: &str,
        field: &str,
        comparator: Comparator,
    ) -> Result<()> {
        let _ddl = self.ddl.lock();
        let core = self.collection_core(collection)?;
        if core.secondaries.read().contains_key(field) {
            return Ok(());
        }
        if field.is_empty() || field.contains('\0') || field.contains('/') {
            return Err(Error::InvalidArgument(format!(
                "invalid index field {:?}",
                field
            )));
        }

        let path = self.dir.join("index").join(collection).join(field);
        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        let tree = Arc::new(
            BTree::open(&path, comparator, EMPTY_ROOT)?
                .with_cache(Arc::clone(&self.buffer), file_id),
        );

        // Backfill from the committed primary tree
        let mut ids = Vec::new();
        core.primary.scan(&mut |id_bytes, _| {
            ids.push(String::from_utf8_lossy(id_bytes).into_owned());
            Ok(true)
        })?;
        for id in &ids {
            if let Some(bytes) = self.load_committed(&core, id)? {
                let doc = Document::from_bytes(&bytes)?;
                if let Some(value) = doc.field(field) {
                    self.index_insert(&tree, value, id)?;
                }
            }
        }

        let root = tree.root();
        wire_index_callback(self, collection, field, &tree);
        core.secondaries
            .write()
            .insert(field.to_string(), Arc::clone(&tree));
        self.catalog.update(|data| {
            if let Some(meta) = data.collections.get_mut(collection) {
                meta.indexes
                    .insert(field.to_string(), IndexMeta { comparator, root });
            }
        })?;
        debug!(collection, field, "secondary index created");
        Ok(())
    }

    pub fn delete_index(&self, collection: &str, field: &str) -> Result<()> {
        let _ddl = self.ddl.lock();
        let core = self.collection_core(collection)?;
        if core.secondaries.write().remove(field).is_none() {
            return Err(Error::IndexNotFound {
                collection: collection.to_string(),
                field: field.to_string(),
            });
        }
        self.catalog.update(|data| {
            if let Some(meta) = data.collections.get_mut(collection) {
                meta.indexes.remove(field);
            }
        })?;
        let path = self.dir.join("index").join(collection).join(field);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

impl CommitSink for EngineShared {
    fn load_baseline(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        match key {
            Key::Document { collection, id } => {
                let core = match self.collections.read().get(collection) {
                    Some(core) => Arc::clone(core),
                    None => return Ok(None),
                };
                self.load_committed(&core, id)
            }
            Key::Kv { key: kv_key } => self.kv_tree.get(kv_key.as_bytes()),
        }
    }

    fn apply(&self, key: &Key, op: &WriteOp, _seq: CommitSeq) -> Result<()> {
        self.apply_op(key, op)
    }

    fn commit_applied(&self, _seq: CommitSeq) -> Result<()> {
        // Index roots moved during apply; persist them once per commit
        self.catalog.save_if_dirty()
    }

    fn publish(&self, key: &Key, op: &WriteOp, seq: CommitSeq) {
        let (kind, payload) = match op {
            WriteOp::Put(bytes) => (ChangeKind::Insert, Some(bytes.clone())),
            WriteOp::Expire(bytes) => (ChangeKind::Expire, Some(bytes.clone())),
            WriteOp::Delete => (ChangeKind::Delete, None),
        };
        self.bus.publish(ChangeEvent {
            seq,
            kind,
            key: key.clone(),
            payload,
        });
    }
}

/// Point-in-time engine counters.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub project: String,
    pub uptime: Duration,
    pub collections: usize,
    pub txns: TxnManagerStats,
    pub wal: WalStats,
    pub buffer: BufferPoolStats,
    pub scheduler: SchedulerStats,
    pub docs_examined: u64,
    pub corrupt_frames: u64,
    pub subscribers: usize,
    pub published_events: u64,
}

/// An opened project engine.
pub struct Engine {
    shared: Arc<EngineShared>,
    txns: Arc<TransactionManager>,
    wal: Arc<Wal>,
    options: EngineOptions,
    scheduler: Arc<BackgroundScheduler>,
    tickers: Mutex<Vec<Ticker>>,
    lock_file: File,
    closed: AtomicBool,
    opened_at: Instant,
    heal: HealState,
    /// WAL bytes at the last checkpoint, for the size-triggered policy.
    checkpoint_mark: AtomicU64,
    /// Replicated transactions buffered until their Commit record.
    repl_pending: Mutex<FxHashMap<TxnId, Vec<(Key, WriteOp)>>>,
}

impl Engine {
    /// Open the engine rooted at `dir` (`<data-root>/<project-id>`).
    /// Runs WAL recovery before accepting work.
    pub fn open(dir: &Path, options: EngineOptions) -> Result<Arc<Engine>> {
        options.validate()?;
        let project_name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidArgument("engine path has no project component".into()))?
            .to_string();
        let project = ProjectId::new(project_name.clone())?;

        fs::create_dir_all(dir)?;
        let lock_file = File::create(dir.join("LOCK"))?;
        lock_file.try_lock_exclusive().map_err(|_| {
            // Transient: the previous holder may be mid-close
            Error::Transient(format!(
                "engine directory for project {:?} is locked",
                project_name
            ))
        })?;

        let engine_uuid = uuid::Uuid::new_v4().to_string();
        let catalog = Arc::new(Catalog::load_or_create(dir, &engine_uuid)?);
        let catalog_data = catalog.snapshot();

        let buffer = Arc::new(BufferPool::new(
            (options.memory.per_engine_mib as usize) * 1024 * 1024,
        ));
        let data = Arc::new(DataFile::open(&dir.join("data.db"))?);

        // Reopen every tree at its persisted root
        let next_file_id = AtomicU32::new(FIRST_TREE_FILE_ID);
        let mut collections = FxHashMap::default();
        for (name, meta) in &catalog_data.collections {
            let core = open_collection_trees(dir, name, meta, &buffer, &next_file_id)?;
            collections.insert(name.clone(), Arc::new(core));
        }
        let kv_tree = Arc::new(
            BTree::open(
                &dir.join("index").join("_kv").join("keys"),
                Comparator::Lexicographic,
                catalog_data.kv_root,
            )?
            .with_cache(Arc::clone(&buffer), KV_FILE_ID),
        );

        let shared = Arc::new(EngineShared {
            project: project.clone(),
            dir: dir.to_path_buf(),
            data,
            buffer,
            catalog: Arc::clone(&catalog),
            collections: RwLock::new(collections),
            kv_tree,
            bus: ChangeBus::new(),
            ddl: Mutex::new(()),
            docs_examined: AtomicU64::new(0),
            active_queries: AtomicU64::new(0),
            corrupt_frames: AtomicU64::new(0),
            read_corruption_seen: AtomicBool::new(false),
            next_file_id,
        });

        // Replay committed WAL records above the checkpoint into storage
        let wal_dir = dir.join("wal");
        let recovery = recover(&wal_dir, &project_name, catalog_data.checkpoint_lsn, |record| {
            let key = Key::decode(&record.key)?;
            let op = match record.kind {
                RecordKind::Insert => WriteOp::Put(record.payload.clone()),
                RecordKind::Expire => WriteOp::Expire(record.payload.clone()),
                RecordKind::Delete => WriteOp::Delete,
                _ => return Ok(()),
            };
            shared.apply_op(&key, &op)
        })?;

        let wal = Arc::new(Wal::open(
            &wal_dir,
            &project_name,
            options.wal.clone(),
            recovery.max_lsn.max(catalog_data.wal_head),
        )?);
        let txns = Arc::new(TransactionManager::new(
            Arc::clone(&wal),
            options.query.timeout(),
            options.query.max_wal_bytes,
        ));

        // Wire the root-change callbacks, then persist the roots the
        // replay may have moved
        register_root_callbacks(&shared);
        persist_current_roots(&shared, wal.last_lsn())?;

        let scheduler = Arc::new(BackgroundScheduler::new(
            options.scheduler.worker_count,
            options.scheduler.queue_depth,
        ));

        let engine = Arc::new(Engine {
            shared,
            txns,
            wal,
            heal: HealState::new(&options.healing),
            options,
            scheduler,
            tickers: Mutex::new(Vec::new()),
            lock_file,
            closed: AtomicBool::new(false),
            opened_at: Instant::now(),
            checkpoint_mark: AtomicU64::new(0),
            repl_pending: Mutex::new(FxHashMap::default()),
        });
        engine.start_background(&engine);

        info!(
            project = %engine.shared.project,
            recovered = recovery.applied,
            truncated = recovery.truncated,
            "engine opened"
        );
        Ok(engine)
    }

    fn start_background(&self, self_arc: &Arc<Engine>) {
        let mut tickers = self.tickers.lock();

        let weak: Weak<Engine> = Arc::downgrade(self_arc);
        tickers.push(Ticker::spawn("gc", GC_PERIOD, move || {
            if let Some(engine) = weak.upgrade() {
                let scheduler = Arc::clone(&engine.scheduler);
                scheduler.submit(TaskPriority::Low, move || {
                    let collected = engine.txns.collect_garbage();
                    if collected > 0 {
                        debug!(collected, "version garbage collected");
                    }
                });
            }
        }));

        if self.options.checkpoint.auto_create {
            let weak: Weak<Engine> = Arc::downgrade(self_arc);
            tickers.push(Ticker::spawn("checkpoint", CHECKPOINT_CHECK_PERIOD, move || {
                if let Some(engine) = weak.upgrade() {
                    let appended = engine.wal.stats().appended_bytes;
                    let mark = engine.checkpoint_mark.load(Ordering::Acquire);
                    let threshold = engine.options.checkpoint.interval_mib * 1024 * 1024;
                    if appended.saturating_sub(mark) >= threshold {
                        let scheduler = Arc::clone(&engine.scheduler);
                        scheduler.submit(TaskPriority::Normal, move || {
                            if let Err(e) = engine.checkpoint() {
                                error!(error = %e, "checkpoint failed");
                            }
                        });
                    }
                }
            }));
        }

        if self.options.healing.enabled {
            let weak: Weak<Engine> = Arc::downgrade(self_arc);
            let period = Duration::from_millis(self.options.healing.scan_interval_ms.max(1));
            tickers.push(Ticker::spawn("healing", period, move || {
                if let Some(engine) = weak.upgrade() {
                    let scheduler = Arc::clone(&engine.scheduler);
                    scheduler.submit(TaskPriority::Low, move || engine.run_healing_scan());
                }
            }));
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::EngineClosed);
        }
        Ok(())
    }

    pub fn project(&self) -> &ProjectId {
        &self.shared.project
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // --- transactions -------------------------------------------------

    pub fn begin(&self, isolation: IsolationLevel) -> Result<TxnId> {
        self.ensure_open()?;
        if self.txns.active_count() >= self.options.scheduler.max_concurrent_ops {
            return Err(Error::Transient(format!(
                "engine at its limit of {} concurrent operations",
                self.options.scheduler.max_concurrent_ops
            )));
        }
        Ok(self.txns.begin(isolation))
    }

    pub fn commit(&self, txn: TxnId) -> Result<CommitSeq> {
        self.ensure_open()?;
        self.txns.commit(txn, self.shared.as_ref())
    }

    pub fn rollback(&self, txn: TxnId) -> Result<()> {
        self.ensure_open()?;
        self.txns.rollback(txn)
    }

    // --- collections --------------------------------------------------

    pub fn create_collection(&self, name: &str, schema: Option<Schema>) -> Result<()> {
        self.ensure_open()?;
        loam_core::types::validate_collection_name(name)?;
        let _ddl = self.shared.ddl.lock();

        if self.shared.collections.read().contains_key(name) {
            return Err(Error::CollectionExists(name.to_string()));
        }

        let meta = CollectionMeta {
            schema: schema.clone(),
            primary_root: EMPTY_ROOT,
            indexes: Default::default(),
        };
        let core = open_collection_trees(
            &self.shared.dir,
            name,
            &meta,
            &self.shared.buffer,
            &self.shared.next_file_id,
        )?;
        register_collection_callbacks(&self.shared, &core);
        self.shared
            .collections
            .write()
            .insert(name.to_string(), Arc::new(core));
        self.shared
            .catalog
            .update(|data| {
                data.collections.insert(name.to_string(), meta);
            })?;
        debug!(project = %self.shared.project, collection = name, "collection created");
        Ok(())
    }

    pub fn delete_collection(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let _ddl = self.shared.ddl.lock();

        let removed = self.shared.collections.write().remove(name);
        if removed.is_none() {
            return Err(Error::CollectionNotFound(name.to_string()));
        }
        self.shared.catalog.update(|data| {
            data.collections.remove(name);
        })?;
        let dir = self.shared.dir.join("index").join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        debug!(project = %self.shared.project, collection = name, "collection deleted");
        Ok(())
    }

    pub fn list_collections(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut names: Vec<String> = self.shared.collections.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Handle for per-collection operations.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        self.ensure_open()?;
        let core = self.shared.collection_core(name)?;
        Ok(Collection::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.txns),
            core,
            self.options.query.clone(),
        ))
    }

    // --- index DDL ----------------------------------------------------

    /// Create a secondary index and backfill it from committed state.
    pub fn create_index(&self, collection: &str, field: &str, comparator: Comparator) -> Result<()> {
        self.ensure_open()?;
        self.shared.create_index(collection, field, comparator)
    }

    pub fn delete_index(&self, collection: &str, field: &str) -> Result<()> {
        self.ensure_open()?;
        self.shared.delete_index(collection, field)
    }

    // --- key/value surface --------------------------------------------

    /// The auxiliary key/value store used by neighbouring services.
    pub fn kv(&self) -> KvSurface<'_> {
        KvSurface::new(self)
    }

    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    pub(crate) fn txn_manager(&self) -> &Arc<TransactionManager> {
        &self.txns
    }

    // --- change stream ------------------------------------------------

    pub fn subscribe(&self, buffer: usize) -> Result<Subscription> {
        self.ensure_open()?;
        Ok(self.shared.bus.subscribe(buffer))
    }

    // --- replication apply --------------------------------------------

    /// Apply one replicated command: an encoded WAL record. Data
    /// records buffer per transaction; the Commit record replays the
    /// buffered writes through a local transaction.
    pub fn apply_command(&self, command: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let (record, _) = WalRecord::decode(command).map_err(Error::from)?;
        match record.kind {
            RecordKind::Insert | RecordKind::Delete | RecordKind::Expire => {
                let key = Key::decode(&record.key)?;
                let op = match record.kind {
                    RecordKind::Insert => WriteOp::Put(record.payload),
                    RecordKind::Expire => WriteOp::Expire(record.payload),
                    _ => WriteOp::Delete,
                };
                self.repl_pending
                    .lock()
                    .entry(record.txn_id)
                    .or_default()
                    .push((key, op));
                Ok(())
            }
            RecordKind::Commit => {
                let writes = self
                    .repl_pending
                    .lock()
                    .remove(&record.txn_id)
                    .unwrap_or_default();
                if writes.is_empty() {
                    return Ok(());
                }
                let txn = self.begin(IsolationLevel::ReadCommitted)?;
                for (key, op) in writes {
                    self.txns.write(txn, key, op, self.shared.as_ref())?;
                }
                self.commit(txn)?;
                Ok(())
            }
            RecordKind::Abort => {
                self.repl_pending.lock().remove(&record.txn_id);
                Ok(())
            }
            RecordKind::Checkpoint => Ok(()),
        }
    }

    // --- maintenance --------------------------------------------------

    /// Flush storage, persist the catalog with the checkpoint LSN, and
    /// trim rotated WAL segments below it.
    pub fn checkpoint(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.data.sync()?;
        self.shared.kv_tree.sync()?;
        for core in self.shared.collections.read().values() {
            core.primary.sync()?;
            for tree in core.secondaries.read().values() {
                tree.sync()?;
            }
        }
        self.wal.sync()?;

        let head = self.wal.last_lsn();
        self.shared.catalog.update(|data| {
            data.wal_head = head;
            data.checkpoint_lsn = head;
        })?;
        self.checkpoint_mark
            .store(self.wal.stats().appended_bytes, Ordering::Release);
        let trimmed = self.wal.trim(head)?;
        debug!(project = %self.shared.project, checkpoint_lsn = head, trimmed, "checkpoint complete");
        Ok(())
    }

    /// One bounded healing pass over the data file.
    pub fn run_healing_scan(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let triggered = self.options.healing.trigger_on_read_corruption
            && self.shared.read_corruption_seen.swap(false, Ordering::AcqRel);
        self.heal.scan(&self.shared, triggered);
    }

    pub fn collect_garbage(&self) -> usize {
        self.txns.collect_garbage()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            project: self.shared.project.to_string(),
            uptime: self.opened_at.elapsed(),
            collections: self.shared.collections.read().len(),
            txns: self.txns.stats(),
            wal: self.wal.stats(),
            buffer: self.shared.buffer.stats(),
            scheduler: self.scheduler.stats(),
            docs_examined: self.shared.docs_examined.load(Ordering::Relaxed),
            corrupt_frames: self.shared.corrupt_frames.load(Ordering::Relaxed),
            subscribers: self.shared.bus.subscriber_count(),
            published_events: self.shared.bus.published_count(),
        }
    }

    /// Tear down as a crash would: the WAL tail is synced but no
    /// checkpoint or catalog rewrite runs, so the next open must
    /// replay. Test support for crash-recovery scenarios.
    pub fn simulate_crash(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for ticker in self.tickers.lock().drain(..) {
            ticker.stop();
        }
        self.scheduler.shutdown();
        let _ = self.wal.close();
        let _ = self.lock_file.unlock();
    }

    /// Stop background work, abort live transactions, checkpoint and
    /// close the WAL. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(project = %self.shared.project, "engine closing");

        for ticker in self.tickers.lock().drain(..) {
            ticker.stop();
        }
        self.scheduler.shutdown();

        // Give in-flight transactions a bounded grace period, then
        // force-abort whatever is left
        let deadline = Instant::now() + Duration::from_secs(1);
        while self.txns.active_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        self.txns.abort_all();

        // Final flush so a clean close needs no replay
        let result: Result<()> = (|| {
            self.shared.data.sync()?;
            self.shared.kv_tree.sync()?;
            for core in self.shared.collections.read().values() {
                core.primary.sync()?;
                for tree in core.secondaries.read().values() {
                    tree.sync()?;
                }
            }
            self.wal.sync()?;
            let head = self.wal.last_lsn();
            self.shared.catalog.update(|data| {
                data.wal_head = head;
                data.checkpoint_lsn = head;
            })?;
            self.wal.close()
        })();
        let _ = self.lock_file.unlock();
        result
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(project = %self.shared.project, error = %e, "engine close failed in drop");
        }
    }
}

fn open_collection_trees(
    dir: &Path,
    name: &str,
    meta: &CollectionMeta,
    buffer: &Arc<BufferPool>,
    next_file_id: &AtomicU32,
) -> Result<CollectionCore> {
    let index_dir = dir.join("index").join(name);
    let primary_id = next_file_id.fetch_add(1, Ordering::Relaxed);
    let primary = Arc::new(
        BTree::open(&index_dir.join("_id"), Comparator::Lexicographic, meta.primary_root)?
            .with_cache(Arc::clone(buffer), primary_id),
    );

    let mut secondaries = FxHashMap::default();
    for (field, index_meta) in &meta.indexes {
        let file_id = next_file_id.fetch_add(1, Ordering::Relaxed);
        let tree = Arc::new(
            BTree::open(&index_dir.join(field), index_meta.comparator, index_meta.root)?
                .with_cache(Arc::clone(buffer), file_id),
        );
        secondaries.insert(field.clone(), tree);
    }

    Ok(CollectionCore {
        name: name.to_string(),
        schema: meta.schema.clone(),
        primary,
        secondaries: RwLock::new(secondaries),
    })
}

/// Register catalog root-change callbacks for every open tree.
fn register_root_callbacks(shared: &Arc<EngineShared>) {
    for core in shared.collections.read().values() {
        register_collection_callbacks(shared, core);
    }
    let catalog = Arc::clone(&shared.catalog);
    shared.kv_tree.set_on_root_change(move |root| {
        catalog.update_deferred(|data| data.kv_root = root);
    });
}

fn register_collection_callbacks(shared: &Arc<EngineShared>, core: &CollectionCore) {
    let catalog = Arc::clone(&shared.catalog);
    let name = core.name.clone();
    core.primary.set_on_root_change(move |root| {
        catalog.update_deferred(|data| {
            if let Some(meta) = data.collections.get_mut(&name) {
                meta.primary_root = root;
            }
        });
    });
    for (field, tree) in core.secondaries.read().iter() {
        wire_index_callback(shared, &core.name, field, tree);
    }
}

fn wire_index_callback(shared: &Arc<EngineShared>, collection: &str, field: &str, tree: &BTree) {
    let catalog = Arc::clone(&shared.catalog);
    let collection = collection.to_string();
    let field = field.to_string();
    tree.set_on_root_change(move |root| {
        catalog.update_deferred(|data| {
            if let Some(meta) = data.collections.get_mut(&collection) {
                if let Some(index) = meta.indexes.get_mut(&field) {
                    index.root = root;
                }
            }
        });
    });
}

/// Persist the roots recovery may have moved, in one rewrite.
fn persist_current_roots(shared: &Arc<EngineShared>, wal_head: loam_core::Lsn) -> Result<()> {
    let collections = shared.collections.read();
    shared.catalog.update(|data| {
        data.wal_head = wal_head;
        for (name, core) in collections.iter() {
            if let Some(meta) = data.collections.get_mut(name) {
                meta.primary_root = core.primary.root();
                for (field, tree) in core.secondaries.read().iter() {
                    if let Some(index) = meta.indexes.get_mut(field) {
                        index.root = tree.root();
                    }
                }
            }
        }
        data.kv_root = shared.kv_tree.root();
    })
}
