//! The cluster wire protocol.
//!
//! Length-prefixed binary frames carry both client operations and
//! replication RPCs. The gateway normalises decoded operations into
//! engine calls through the instance manager; the server is a plain
//! thread-per-connection TCP front end, matching the platform's
//! OS-thread scheduling model.

pub mod client;
pub mod frame;
pub mod gateway;
pub mod ops;
pub mod server;

pub use client::{Client, TcpRaftTransport};
pub use frame::{Frame, FrameRead, MAX_FRAME_SIZE_DEFAULT};
pub use gateway::Gateway;
pub use ops::{ExecuteOp, ExecuteRequest, OpCode, QueryBody, Status, WireError};
pub use server::{Server, ServerConfig};
