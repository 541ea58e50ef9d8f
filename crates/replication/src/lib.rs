//! Log replication.
//!
//! A leader-elected replicated log whose committed entries feed the
//! engine state machine. The log is physically separate from the
//! engine WAL: this crate owns its own storage directory, and the
//! engine applies committed commands by decoding them as WAL records.

pub mod log;
pub mod message;
pub mod node;
pub mod state;
pub mod transport;

pub use log::RaftLog;
pub use message::{AppendEntries, AppendReply, LogEntry, NodeId, RequestVote, VoteReply};
pub use node::{RaftConfig, RaftNode, StateMachine};
pub use state::{HardState, NodeState};
pub use transport::{InMemoryNetwork, RaftTransport};
