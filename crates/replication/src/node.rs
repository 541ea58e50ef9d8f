//! The raft node.
//!
//! One driver thread runs timers (election timeout, heartbeat) and
//! fans RPCs out to peers on detached sender threads; one apply thread
//! hands committed commands to the state machine in index order.
//! Handlers are synchronous and are invoked by whatever transport
//! carries the RPCs (in-memory for tests, framed TCP in production).
//!
//! Safety hinges on three rules, all enforced here: votes only go to
//! candidates with an up-to-date log, followers truncate on log
//! mismatch, and leaders only advance the commit index over entries
//! from their own term.

use parking_lot::{Condvar, Mutex};
use once_cell::sync::OnceCell;
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use loam_core::{Error, Result};

use crate::log::RaftLog;
use crate::message::{AppendEntries, AppendReply, LogEntry, NodeId, RequestVote, VoteReply};
use crate::state::{HardState, NodeState};
use crate::transport::RaftTransport;

/// Committed commands land here, on every node, in index order.
pub trait StateMachine: Send + Sync {
    fn apply(&self, index: u64, command: &[u8]) -> Result<()>;
}

/// Per-node configuration.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub id: NodeId,
    /// The other members; the cluster size is `peers.len() + 1`.
    pub peers: Vec<NodeId>,
    pub election_min: Duration,
    pub election_max: Duration,
    pub heartbeat: Duration,
    pub storage_dir: PathBuf,
}

impl RaftConfig {
    pub fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }
}

struct NodeInner {
    role: NodeState,
    term: u64,
    voted_for: Option<NodeId>,
    log: RaftLog,
    commit_index: u64,
    last_applied: u64,
    leader_id: Option<NodeId>,
    election_deadline: Instant,
    heartbeat_due: Instant,
    next_index: FxHashMap<NodeId, u64>,
    match_index: FxHashMap<NodeId, u64>,
    votes: FxHashSet<NodeId>,
}

enum DriverAction {
    Idle,
    Election { request: RequestVote },
    Replicate { batches: Vec<(NodeId, AppendEntries)> },
}

/// One member of a replication group.
pub struct RaftNode {
    config: RaftConfig,
    inner: Mutex<NodeInner>,
    apply_ready: Condvar,
    transport: OnceCell<Arc<dyn RaftTransport>>,
    sm: Arc<dyn StateMachine>,
    shutdown: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl RaftNode {
    pub fn new(config: RaftConfig, sm: Arc<dyn StateMachine>) -> Result<Arc<RaftNode>> {
        let hard = HardState::load(&config.storage_dir)?;
        let log = RaftLog::open(&config.storage_dir)?;
        let now = Instant::now();

        let node = Arc::new(RaftNode {
            inner: Mutex::new(NodeInner {
                role: NodeState::Follower,
                term: hard.term,
                voted_for: hard.voted_for,
                log,
                commit_index: 0,
                last_applied: 0,
                leader_id: None,
                election_deadline: now + rand_between(config.election_min, config.election_max),
                heartbeat_due: now,
                next_index: FxHashMap::default(),
                match_index: FxHashMap::default(),
                votes: FxHashSet::default(),
            }),
            apply_ready: Condvar::new(),
            transport: OnceCell::new(),
            sm,
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            config,
        });
        Ok(node)
    }

    /// Attach the transport and start the driver and apply threads.
    pub fn start(self: &Arc<Self>, transport: Arc<dyn RaftTransport>) {
        self.transport
            .set(transport)
            .unwrap_or_else(|_| panic!("raft node started twice"));

        let mut threads = self.threads.lock();
        let driver = Arc::clone(self);
        threads.push(
            std::thread::Builder::new()
                .name(format!("loam-raft-{}", self.config.id))
                .spawn(move || driver.driver_loop())
                .expect("failed to spawn raft driver"),
        );
        let applier = Arc::clone(self);
        threads.push(
            std::thread::Builder::new()
                .name(format!("loam-raft-apply-{}", self.config.id))
                .spawn(move || applier.apply_loop())
                .expect("failed to spawn raft applier"),
        );
    }

    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _inner = self.inner.lock();
            self.apply_ready.notify_all();
        }
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }

    // --- observers ----------------------------------------------------

    pub fn id(&self) -> NodeId {
        self.config.id
    }

    pub fn role(&self) -> NodeState {
        self.inner.lock().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == NodeState::Leader
    }

    pub fn term(&self) -> u64 {
        self.inner.lock().term
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.inner.lock().leader_id
    }

    pub fn commit_index(&self) -> u64 {
        self.inner.lock().commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.inner.lock().last_applied
    }

    pub fn last_log_index(&self) -> u64 {
        self.inner.lock().log.last_index()
    }

    /// Term of the log entry at `index`, if present. Test support for
    /// cross-node log comparison.
    pub fn log_term_at(&self, index: u64) -> Option<u64> {
        self.inner.lock().log.term_at(index)
    }

    /// Block until `index` is applied locally, up to `timeout`.
    pub fn wait_applied(&self, index: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.last_applied() >= index {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    // --- client surface -----------------------------------------------

    /// Append a command to the replicated log. Only the leader accepts;
    /// followers answer `NotLeader` and the caller redirects.
    pub fn propose(&self, command: Vec<u8>) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.role != NodeState::Leader {
            return Err(Error::NotLeader);
        }
        let index = inner.log.last_index() + 1;
        let term = inner.term;
        inner.log.append(&[LogEntry { term, index, command }])?;
        // A single-node cluster commits on append
        self.advance_commit(&mut inner);
        // Replicate without waiting for the next heartbeat
        inner.heartbeat_due = Instant::now();
        Ok(index)
    }

    // --- RPC handlers -------------------------------------------------

    pub fn handle_request_vote(&self, req: &RequestVote) -> VoteReply {
        let mut inner = self.inner.lock();
        if req.term > inner.term {
            self.become_follower(&mut inner, req.term, None);
        }

        let log_ok = req.last_log_term > inner.log.last_term()
            || (req.last_log_term == inner.log.last_term()
                && req.last_log_index >= inner.log.last_index());
        let granted = req.term == inner.term
            && inner
                .voted_for
                .map(|v| v == req.candidate_id)
                .unwrap_or(true)
            && log_ok;

        if granted {
            inner.voted_for = Some(req.candidate_id);
            self.persist(&inner);
            inner.election_deadline = Instant::now() + self.rand_election();
            debug!(node = self.config.id, term = inner.term, candidate = req.candidate_id, "vote granted");
        }
        VoteReply {
            term: inner.term,
            granted,
        }
    }

    pub fn handle_append_entries(&self, req: &AppendEntries) -> AppendReply {
        let mut inner = self.inner.lock();
        if req.term < inner.term {
            return AppendReply {
                term: inner.term,
                success: false,
                match_index: 0,
            };
        }
        if req.term > inner.term || inner.role != NodeState::Follower {
            self.become_follower(&mut inner, req.term, Some(req.leader_id));
        }
        inner.leader_id = Some(req.leader_id);
        inner.election_deadline = Instant::now() + self.rand_election();

        // Log-matching check on the entry before the new ones
        match inner.log.term_at(req.prev_log_index) {
            Some(term) if term == req.prev_log_term => {}
            _ => {
                return AppendReply {
                    term: inner.term,
                    success: false,
                    match_index: 0,
                }
            }
        }

        // Conflict truncation, then append the remainder
        for (i, entry) in req.entries.iter().enumerate() {
            match inner.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if let Err(e) = inner
                        .log
                        .truncate_from(entry.index)
                        .and_then(|_| inner.log.append(&req.entries[i..]))
                    {
                        error!(error = %e, "raft log write failed");
                        return AppendReply { term: inner.term, success: false, match_index: 0 };
                    }
                    break;
                }
                None => {
                    if let Err(e) = inner.log.append(&req.entries[i..]) {
                        error!(error = %e, "raft log write failed");
                        return AppendReply { term: inner.term, success: false, match_index: 0 };
                    }
                    break;
                }
            }
        }

        let last_new = req.prev_log_index + req.entries.len() as u64;
        if req.leader_commit > inner.commit_index {
            inner.commit_index = req.leader_commit.min(last_new);
            self.apply_ready.notify_all();
        }
        AppendReply {
            term: inner.term,
            success: true,
            match_index: last_new,
        }
    }

    // --- reply handling -----------------------------------------------

    fn on_vote_reply(&self, peer: NodeId, sent_term: u64, reply: VoteReply) {
        let mut inner = self.inner.lock();
        if reply.term > inner.term {
            self.become_follower(&mut inner, reply.term, None);
            return;
        }
        if inner.role != NodeState::Candidate || inner.term != sent_term || !reply.granted {
            return;
        }
        inner.votes.insert(peer);
        if inner.votes.len() >= self.config.quorum() {
            self.become_leader(&mut inner);
        }
    }

    fn on_append_reply(&self, peer: NodeId, sent_term: u64, reply: AppendReply) {
        let mut inner = self.inner.lock();
        if reply.term > inner.term {
            self.become_follower(&mut inner, reply.term, None);
            return;
        }
        if inner.role != NodeState::Leader || inner.term != sent_term {
            return;
        }
        if reply.success {
            let matched = inner.match_index.entry(peer).or_insert(0);
            *matched = (*matched).max(reply.match_index);
            let matched = *matched;
            inner.next_index.insert(peer, matched + 1);
            self.advance_commit(&mut inner);
        } else {
            // Walk back and retry on the next heartbeat
            let next = inner.next_index.entry(peer).or_insert(1);
            *next = next.saturating_sub(1).max(1);
        }
    }

    // --- role transitions ---------------------------------------------

    fn become_follower(&self, inner: &mut NodeInner, term: u64, leader: Option<NodeId>) {
        if term > inner.term {
            inner.term = term;
            inner.voted_for = None;
            self.persist(inner);
        }
        if inner.role != NodeState::Follower {
            debug!(node = self.config.id, term = inner.term, "stepping down to follower");
        }
        inner.role = NodeState::Follower;
        inner.leader_id = leader;
        inner.votes.clear();
        inner.election_deadline = Instant::now() + self.rand_election();
    }

    fn become_leader(&self, inner: &mut NodeInner) {
        info!(node = self.config.id, term = inner.term, "elected leader");
        inner.role = NodeState::Leader;
        inner.leader_id = Some(self.config.id);
        let next = inner.log.last_index() + 1;
        for peer in &self.config.peers {
            inner.next_index.insert(*peer, next);
            inner.match_index.insert(*peer, 0);
        }
        // Immediate empty AppendEntries asserts leadership
        inner.heartbeat_due = Instant::now();
    }

    fn start_election(&self, inner: &mut NodeInner) -> RequestVote {
        inner.term += 1;
        inner.role = NodeState::Candidate;
        inner.voted_for = Some(self.config.id);
        inner.leader_id = None;
        inner.votes.clear();
        inner.votes.insert(self.config.id);
        self.persist(inner);
        inner.election_deadline = Instant::now() + self.rand_election();
        debug!(node = self.config.id, term = inner.term, "starting election");

        RequestVote {
            term: inner.term,
            candidate_id: self.config.id,
            last_log_index: inner.log.last_index(),
            last_log_term: inner.log.last_term(),
        }
    }

    fn advance_commit(&self, inner: &mut NodeInner) {
        let last = inner.log.last_index();
        let mut n = last;
        while n > inner.commit_index {
            // Only entries from the current term commit by counting
            if inner.log.term_at(n) == Some(inner.term) {
                let replicated = 1 + self
                    .config
                    .peers
                    .iter()
                    .filter(|peer| inner.match_index.get(peer).copied().unwrap_or(0) >= n)
                    .count();
                if replicated >= self.config.quorum() {
                    inner.commit_index = n;
                    self.apply_ready.notify_all();
                    break;
                }
            }
            n -= 1;
        }
    }

    // --- background threads -------------------------------------------

    fn driver_loop(self: Arc<Self>) {
        let tick = self.config.heartbeat.min(Duration::from_millis(10)) / 2;
        while !self.shutdown.load(Ordering::Acquire) {
            std::thread::sleep(tick.max(Duration::from_millis(1)));

            let action = {
                let mut inner = self.inner.lock();
                let now = Instant::now();
                match inner.role {
                    NodeState::Leader => {
                        if now >= inner.heartbeat_due {
                            inner.heartbeat_due = now + self.config.heartbeat;
                            DriverAction::Replicate {
                                batches: self.build_batches(&inner),
                            }
                        } else {
                            DriverAction::Idle
                        }
                    }
                    NodeState::Follower | NodeState::Candidate => {
                        if now >= inner.election_deadline {
                            let request = self.start_election(&mut inner);
                            // A lone node wins instantly
                            if inner.votes.len() >= self.config.quorum() {
                                self.become_leader(&mut inner);
                                DriverAction::Idle
                            } else {
                                DriverAction::Election { request }
                            }
                        } else {
                            DriverAction::Idle
                        }
                    }
                }
            };

            match action {
                DriverAction::Idle => {}
                DriverAction::Election { request } => self.broadcast_votes(request),
                DriverAction::Replicate { batches } => self.broadcast_appends(batches),
            }
        }
    }

    fn build_batches(&self, inner: &NodeInner) -> Vec<(NodeId, AppendEntries)> {
        self.config
            .peers
            .iter()
            .map(|peer| {
                let next = inner.next_index.get(peer).copied().unwrap_or(1);
                let prev_log_index = next - 1;
                let prev_log_term = inner.log.term_at(prev_log_index).unwrap_or(0);
                (
                    *peer,
                    AppendEntries {
                        term: inner.term,
                        leader_id: self.config.id,
                        prev_log_index,
                        prev_log_term,
                        entries: inner.log.entries_from(next),
                        leader_commit: inner.commit_index,
                    },
                )
            })
            .collect()
    }

    fn broadcast_votes(self: &Arc<Self>, request: RequestVote) {
        let transport = match self.transport.get() {
            Some(t) => Arc::clone(t),
            None => return,
        };
        for peer in self.config.peers.clone() {
            let node = Arc::clone(self);
            let transport = Arc::clone(&transport);
            let request = request.clone();
            std::thread::spawn(move || match transport.request_vote(peer, &request) {
                Ok(reply) => node.on_vote_reply(peer, request.term, reply),
                Err(e) => debug!(peer, error = %e, "vote request failed"),
            });
        }
    }

    fn broadcast_appends(self: &Arc<Self>, batches: Vec<(NodeId, AppendEntries)>) {
        let transport = match self.transport.get() {
            Some(t) => Arc::clone(t),
            None => return,
        };
        for (peer, request) in batches {
            let node = Arc::clone(self);
            let transport = Arc::clone(&transport);
            std::thread::spawn(move || match transport.append_entries(peer, &request) {
                Ok(reply) => node.on_append_reply(peer, request.term, reply),
                Err(e) => debug!(peer, error = %e, "append failed"),
            });
        }
    }

    fn apply_loop(self: Arc<Self>) {
        loop {
            let mut inner = self.inner.lock();
            while inner.last_applied >= inner.commit_index {
                if self.shutdown.load(Ordering::Acquire) {
                    return;
                }
                self.apply_ready
                    .wait_for(&mut inner, Duration::from_millis(50));
            }
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }

            while inner.last_applied < inner.commit_index {
                let index = inner.last_applied + 1;
                let entry = inner.log.entry(index).cloned();
                drop(inner);

                if let Some(entry) = entry {
                    if let Err(e) = self.sm.apply(entry.index, &entry.command) {
                        // The entry stays committed; retrying is the
                        // state machine's concern, ordering is ours
                        warn!(index, error = %e, "state machine apply failed");
                    }
                }
                inner = self.inner.lock();
                inner.last_applied = index;
            }
            drop(inner);
        }
    }

    // --- misc ---------------------------------------------------------

    fn rand_election(&self) -> Duration {
        rand_between(self.config.election_min, self.config.election_max)
    }

    fn persist(&self, inner: &NodeInner) {
        let state = HardState {
            term: inner.term,
            voted_for: inner.voted_for,
        };
        if let Err(e) = state.save(&self.config.storage_dir) {
            error!(error = %e, "failed to persist raft hard state");
        }
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn rand_between(min: Duration, max: Duration) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms.max(min_ms)))
}
