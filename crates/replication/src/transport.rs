//! Transport abstraction.
//!
//! Nodes never talk to sockets directly; they go through this trait.
//! Tests use the in-memory network (with partitioning); production
//! wires the framed TCP client from the network crate in.

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

use loam_core::{Error, Result};

use crate::message::{AppendEntries, AppendReply, NodeId, RequestVote, VoteReply};
use crate::node::RaftNode;

/// Synchronous RPC fan-out to one peer.
pub trait RaftTransport: Send + Sync {
    fn request_vote(&self, peer: NodeId, req: &RequestVote) -> Result<VoteReply>;
    fn append_entries(&self, peer: NodeId, req: &AppendEntries) -> Result<AppendReply>;
}

/// In-process network of nodes, with partitioning for tests.
#[derive(Default)]
pub struct InMemoryNetwork {
    nodes: RwLock<FxHashMap<NodeId, Arc<RaftNode>>>,
    partitioned: RwLock<FxHashSet<NodeId>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<InMemoryNetwork> {
        Arc::new(InMemoryNetwork::default())
    }

    pub fn register(&self, node: Arc<RaftNode>) {
        self.nodes.write().insert(node.id(), node);
    }

    /// Cut a node off from everyone (both directions).
    pub fn partition(&self, id: NodeId) {
        self.partitioned.write().insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        self.partitioned.write().remove(&id);
    }

    fn deliver<T>(
        &self,
        from: NodeId,
        to: NodeId,
        call: impl FnOnce(&RaftNode) -> T,
    ) -> Result<T> {
        {
            let partitioned = self.partitioned.read();
            if partitioned.contains(&from) || partitioned.contains(&to) {
                return Err(Error::Transient(format!("node {} unreachable", to)));
            }
        }
        let node = self
            .nodes
            .read()
            .get(&to)
            .cloned()
            .ok_or_else(|| Error::Transient(format!("node {} not registered", to)))?;
        Ok(call(&node))
    }
}

impl RaftTransport for InMemoryNetwork {
    fn request_vote(&self, peer: NodeId, req: &RequestVote) -> Result<VoteReply> {
        self.deliver(req.candidate_id, peer, |node| node.handle_request_vote(req))
    }

    fn append_entries(&self, peer: NodeId, req: &AppendEntries) -> Result<AppendReply> {
        self.deliver(req.leader_id, peer, |node| node.handle_append_entries(req))
    }
}
