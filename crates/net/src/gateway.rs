//! The external-operation gateway.
//!
//! Normalises decoded frames into engine calls: resolve the project,
//! acquire its engine from the instance manager, run the operation in a
//! transaction at the requested isolation, encode the reply, release
//! the lease. Replication RPC opcodes route to the local raft node;
//! with replication enabled, document writes go through the replicated
//! log instead of committing locally.

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loam_core::{Document, Error, IsolationLevel, Key, ProjectId, Result, TxnId};
use loam_durability::{RecordKind, WalRecord};
use loam_engine::Engine;
use loam_pool::InstanceManager;
use loam_query::QueryOptions;
use loam_replication::{AppendEntries, RaftNode, RequestVote};

use crate::frame::Frame;
use crate::ops::{
    CollectionBody, ExecuteOp, ExecuteRequest, OpCode, ProjectBody, QueryBody, Status,
    SubscribeBody, WireError,
};

#[derive(Debug, Deserialize)]
struct StatsBody {
    #[serde(default)]
    project: Option<String>,
}

/// What the server should do with a handled frame.
pub enum GatewayOutcome {
    Reply(Frame),
    /// Switch the connection into change-stream mode.
    Subscribe { project: ProjectId, buffer: usize },
}

/// Stateless request dispatcher over the instance manager.
pub struct Gateway {
    manager: Arc<InstanceManager>,
    raft: Mutex<Option<Arc<RaftNode>>>,
    repl_txn: AtomicU64,
    apply_timeout: Duration,
}

impl Gateway {
    pub fn new(manager: Arc<InstanceManager>) -> Gateway {
        Gateway {
            manager,
            raft: Mutex::new(None),
            repl_txn: AtomicU64::new(1),
            apply_timeout: Duration::from_secs(5),
        }
    }

    /// Enable replication: writes propose to this node's log, and the
    /// replication opcodes are answered locally.
    pub fn set_raft(&self, node: Arc<RaftNode>) {
        *self.raft.lock() = Some(node);
    }

    pub fn manager(&self) -> &Arc<InstanceManager> {
        &self.manager
    }

    /// Handle one frame. Never panics on malformed input; malformed
    /// requests become error replies with a stable code.
    pub fn handle(&self, frame: &Frame) -> GatewayOutcome {
        let opcode = match OpCode::from_u16(frame.opcode) {
            Some(opcode) => opcode,
            None => {
                return GatewayOutcome::Reply(error_reply(
                    frame.request_id,
                    &Error::UnknownOpcode(frame.opcode),
                ))
            }
        };

        if opcode == OpCode::Subscribe {
            return match self.parse_subscribe(frame) {
                Ok(outcome) => outcome,
                Err(e) => GatewayOutcome::Reply(error_reply(frame.request_id, &e)),
            };
        }

        let result = self.dispatch(opcode, frame);
        GatewayOutcome::Reply(match result {
            Ok(body) => ok_reply(frame.request_id, body),
            Err(e) => error_reply(frame.request_id, &e),
        })
    }

    fn parse_subscribe(&self, frame: &Frame) -> Result<GatewayOutcome> {
        let body: SubscribeBody = decode_body(&frame.payload)?;
        let project = ProjectId::new(body.project)?;
        Ok(GatewayOutcome::Subscribe {
            project,
            buffer: body.buffer.unwrap_or(1024),
        })
    }

    fn dispatch(&self, opcode: OpCode, frame: &Frame) -> Result<Value> {
        match opcode {
            OpCode::OpenDb => {
                let body: ProjectBody = decode_body(&frame.payload)?;
                let project = ProjectId::new(body.project)?;
                let lease = self.manager.acquire(&project)?;
                let collections = lease.engine().list_collections()?;
                Ok(json!({ "project": project.as_str(), "collections": collections }))
            }
            OpCode::CloseDb => {
                let body: ProjectBody = decode_body(&frame.payload)?;
                let project = ProjectId::new(body.project)?;
                // Engines are refcounted and TTL-evicted; an explicit
                // close is an acknowledgement, not a teardown
                Ok(json!({ "project": project.as_str(), "closed": true }))
            }
            OpCode::Stats => {
                let body: StatsBody = decode_body(&frame.payload)?;
                match body.project {
                    Some(name) => {
                        let project = ProjectId::new(name)?;
                        let lease = self.manager.acquire(&project)?;
                        let stats = lease.engine().stats();
                        Ok(json!({
                            "project": stats.project,
                            "uptime_ms": stats.uptime.as_millis() as u64,
                            "collections": stats.collections,
                            "active_txns": stats.txns.active,
                            "commits": stats.txns.commits,
                            "conflicts": stats.txns.conflicts,
                            "published_seq": stats.txns.published_seq,
                            "wal_last_lsn": stats.wal.last_lsn,
                            "wal_synced_lsn": stats.wal.synced_lsn,
                            "docs_examined": stats.docs_examined,
                            "corrupt_frames": stats.corrupt_frames,
                            "subscribers": stats.subscribers,
                        }))
                    }
                    None => {
                        let stats = self.manager.stats();
                        Ok(json!({
                            "hot_engines": stats.total,
                            "acquires": stats.acquires,
                            "cold_opens": stats.cold_opens,
                            "evictions": stats.evictions,
                        }))
                    }
                }
            }
            OpCode::Execute => {
                let request: ExecuteRequest = decode_body(&frame.payload)?;
                self.execute_one(&request)
            }
            OpCode::Batch => {
                let requests: Vec<ExecuteRequest> = decode_body(&frame.payload)?;
                let results: Vec<Value> = requests
                    .iter()
                    .map(|request| match self.execute_one(request) {
                        Ok(body) => json!({ "status": "ok", "body": body }),
                        Err(e) => json!({
                            "status": "error",
                            "error": WireError::from_error(&e),
                        }),
                    })
                    .collect();
                Ok(Value::Array(results))
            }
            OpCode::CreateCollection => {
                let body: CollectionBody = decode_body(&frame.payload)?;
                let project = ProjectId::new(body.project)?;
                let lease = self.manager.acquire(&project)?;
                lease.engine().create_collection(&body.name, body.schema)?;
                Ok(json!({ "created": body.name }))
            }
            OpCode::DeleteCollection => {
                let body: CollectionBody = decode_body(&frame.payload)?;
                let project = ProjectId::new(body.project)?;
                let lease = self.manager.acquire(&project)?;
                lease.engine().delete_collection(&body.name)?;
                Ok(json!({ "deleted": body.name }))
            }
            OpCode::ListCollections => {
                let body: ProjectBody = decode_body(&frame.payload)?;
                let project = ProjectId::new(body.project)?;
                let lease = self.manager.acquire(&project)?;
                Ok(json!({ "collections": lease.engine().list_collections()? }))
            }
            OpCode::RequestVote => {
                let request: RequestVote = decode_body(&frame.payload)?;
                let node = self.raft_node()?;
                let reply = node.handle_request_vote(&request);
                Ok(serde_json::to_value(reply)?)
            }
            OpCode::AppendEntries => {
                let request: AppendEntries = decode_body(&frame.payload)?;
                let node = self.raft_node()?;
                let reply = node.handle_append_entries(&request);
                Ok(serde_json::to_value(reply)?)
            }
            OpCode::Subscribe | OpCode::Reply | OpCode::Error => {
                Err(Error::Protocol(format!("{:?} is not a request opcode", opcode)))
            }
        }
    }

    fn raft_node(&self) -> Result<Arc<RaftNode>> {
        self.raft
            .lock()
            .clone()
            .ok_or_else(|| Error::Protocol("replication is not enabled on this node".into()))
    }

    /// One document operation, transactional.
    fn execute_one(&self, request: &ExecuteRequest) -> Result<Value> {
        let project = ProjectId::new(request.project.clone())?;
        let lease = self.manager.acquire(&project)?;
        let engine = lease.engine();
        let isolation = request.isolation.unwrap_or_default();

        match request.op {
            ExecuteOp::Read => self.in_txn(engine, isolation, |txn| {
                let id = required_id(request)?;
                let collection = engine.collection(&request.collection)?;
                match collection.find_by_id(txn, id)? {
                    Some(doc) => Ok(doc.into_value()),
                    None => Err(Error::DocumentNotFound {
                        key: Key::document(&request.collection, id),
                    }),
                }
            }),
            ExecuteOp::List => self.in_txn(engine, isolation, |txn| {
                let collection = engine.collection(&request.collection)?;
                let (filter, options) = query_parts(request);
                let docs = collection.find_query(txn, &filter, &options)?;
                let values: Vec<Value> = docs.into_iter().map(Document::into_value).collect();
                Ok(json!({ "documents": values, "count": values.len() }))
            }),
            ExecuteOp::Create | ExecuteOp::Update | ExecuteOp::Delete | ExecuteOp::Patch => {
                let replicated = self.raft.lock().clone();
                match replicated {
                    Some(node) => self.execute_replicated(&node, engine, request, isolation),
                    None => self.execute_local_write(engine, request, isolation),
                }
            }
        }
    }

    fn execute_local_write(
        &self,
        engine: &Arc<Engine>,
        request: &ExecuteRequest,
        isolation: IsolationLevel,
    ) -> Result<Value> {
        self.in_txn(engine, isolation, |txn| {
            let collection = engine.collection(&request.collection)?;
            match request.op {
                ExecuteOp::Create => {
                    let doc = required_payload(request)?;
                    let id = collection.insert(txn, doc)?;
                    Ok(json!({ "_id": id }))
                }
                ExecuteOp::Update => {
                    let id = required_id(request)?;
                    let doc = required_payload(request)?;
                    collection.update(txn, id, doc)?;
                    Ok(json!({ "updated": id }))
                }
                ExecuteOp::Delete => {
                    let id = required_id(request)?;
                    collection.delete(txn, id)?;
                    Ok(json!({ "deleted": id }))
                }
                ExecuteOp::Patch => {
                    let id = required_id(request)?;
                    let ops = request.patch.as_deref().ok_or_else(|| {
                        Error::InvalidArgument("patch operation requires patch ops".into())
                    })?;
                    let doc = collection.patch(txn, id, ops)?;
                    Ok(doc.into_value())
                }
                _ => unreachable!("write ops only"),
            }
        })
    }

    /// Leader-side write through the replicated log: the final mutation
    /// is encoded as WAL records, proposed, and acknowledged once the
    /// local state machine has applied it. Followers answer NotLeader
    /// and the client redirects.
    fn execute_replicated(
        &self,
        node: &Arc<RaftNode>,
        engine: &Arc<Engine>,
        request: &ExecuteRequest,
        isolation: IsolationLevel,
    ) -> Result<Value> {
        if !node.is_leader() {
            return Err(Error::NotLeader);
        }

        // Resolve the final document state locally, without committing
        let (key, record_kind, payload, result) = self.in_txn(engine, isolation, |txn| {
            let collection = engine.collection(&request.collection)?;
            match request.op {
                ExecuteOp::Create => {
                    let mut doc = required_payload(request)?;
                    doc.validate()?;
                    let id = match doc.id() {
                        Some(id) => id.to_string(),
                        None => {
                            let minted = minted_id();
                            doc.set_id(minted.clone());
                            minted
                        }
                    };
                    if collection.find_by_id(txn, &id)?.is_some() {
                        return Err(Error::DuplicateKey {
                            key: Key::document(&request.collection, &id),
                        });
                    }
                    Ok((
                        Key::document(&request.collection, &id),
                        RecordKind::Insert,
                        doc.to_bytes(),
                        json!({ "_id": id }),
                    ))
                }
                ExecuteOp::Update => {
                    let id = required_id(request)?;
                    let mut doc = required_payload(request)?;
                    doc.set_id(id);
                    doc.validate()?;
                    if collection.find_by_id(txn, id)?.is_none() {
                        return Err(Error::DocumentNotFound {
                            key: Key::document(&request.collection, id),
                        });
                    }
                    Ok((
                        Key::document(&request.collection, id),
                        RecordKind::Insert,
                        doc.to_bytes(),
                        json!({ "updated": id }),
                    ))
                }
                ExecuteOp::Delete => {
                    let id = required_id(request)?;
                    if collection.find_by_id(txn, id)?.is_none() {
                        return Err(Error::DocumentNotFound {
                            key: Key::document(&request.collection, id),
                        });
                    }
                    Ok((
                        Key::document(&request.collection, id),
                        RecordKind::Delete,
                        Vec::new(),
                        json!({ "deleted": id }),
                    ))
                }
                ExecuteOp::Patch => {
                    let id = required_id(request)?;
                    let ops = request.patch.as_deref().ok_or_else(|| {
                        Error::InvalidArgument("patch operation requires patch ops".into())
                    })?;
                    // Compute the patched document without staging it
                    let current = collection.find_by_id(txn, id)?.ok_or_else(|| {
                        Error::DocumentNotFound {
                            key: Key::document(&request.collection, id),
                        }
                    })?;
                    let mut work = current;
                    for op in ops {
                        op.apply(&mut work)?;
                    }
                    work.set_id(id);
                    work.validate()?;
                    let value = work.clone().into_value();
                    Ok((
                        Key::document(&request.collection, id),
                        RecordKind::Insert,
                        work.to_bytes(),
                        value,
                    ))
                }
                _ => unreachable!("write ops only"),
            }
        })?;

        let txn_id: TxnId = self.repl_txn.fetch_add(1, Ordering::Relaxed) | (node.id() << 48);
        let data = WalRecord::data(record_kind, txn_id, key.encode(), payload).encode();
        let commit = WalRecord::control(RecordKind::Commit, txn_id).encode();

        node.propose(data)?;
        let commit_index = node.propose(commit)?;
        if !node.wait_applied(commit_index, self.apply_timeout) {
            return Err(Error::Transient("replicated write not applied in time".into()));
        }
        Ok(result)
    }

    /// Run `f` in a transaction, committing on success and rolling back
    /// on error.
    fn in_txn<T>(
        &self,
        engine: &Arc<Engine>,
        isolation: IsolationLevel,
        f: impl FnOnce(TxnId) -> Result<T>,
    ) -> Result<T> {
        let txn = engine.begin(isolation)?;
        match f(txn) {
            Ok(value) => {
                engine.commit(txn)?;
                Ok(value)
            }
            Err(e) => {
                let _ = engine.rollback(txn);
                Err(e)
            }
        }
    }
}

fn decode_body<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| Error::InvalidArgument(format!("malformed request body: {}", e)))
}

fn required_id(request: &ExecuteRequest) -> Result<&str> {
    request
        .doc_id
        .as_deref()
        .ok_or_else(|| Error::InvalidArgument("operation requires doc_id".into()))
}

fn required_payload(request: &ExecuteRequest) -> Result<Document> {
    let value = request
        .payload
        .clone()
        .ok_or_else(|| Error::InvalidArgument("operation requires a payload".into()))?;
    Document::from_value(value)
}

fn query_parts(request: &ExecuteRequest) -> (Value, QueryOptions) {
    match &request.options {
        Some(body) => {
            let filter = if body.query.is_null() {
                json!({})
            } else {
                body.query.clone()
            };
            (
                filter,
                QueryOptions {
                    sort_field: body.sort_field.clone(),
                    sort_desc: body.sort_desc,
                    limit: body.limit,
                    skip: body.skip,
                },
            )
        }
        None => (json!({}), QueryOptions::default()),
    }
}

/// Freshly minted document id for replicated creates.
fn minted_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn ok_reply(request_id: u64, body: Value) -> Frame {
    Frame::new(OpCode::Reply as u16, request_id, body.to_string().into_bytes())
        .with_flags(Status::Ok as u16)
}

pub(crate) fn error_reply(request_id: u64, error: &Error) -> Frame {
    let status = Status::for_error(error);
    let body = serde_json::to_vec(&WireError::from_error(error)).unwrap_or_default();
    Frame::new(OpCode::Error as u16, request_id, body).with_flags(status as u16)
}
