//! Blocking client over the framed protocol.
//!
//! Used by embedders, by tests, and (through [`TcpRaftTransport`])
//! by replication peers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::TcpStream;
use std::time::Duration;

use loam_core::{Error, Result};
use loam_replication::{
    AppendEntries, AppendReply, NodeId, RaftTransport, RequestVote, VoteReply,
};

use crate::frame::{read_frame, write_frame, Frame, FrameRead, MAX_FRAME_SIZE_DEFAULT};
use crate::ops::{ExecuteRequest, OpCode, Status, WireError};

/// One connection to a server.
pub struct Client {
    stream: TcpStream,
    next_request_id: u64,
    max_frame: usize,
}

impl Client {
    pub fn connect(addr: &str) -> Result<Client> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Client {
            stream,
            next_request_id: 1,
            max_frame: MAX_FRAME_SIZE_DEFAULT,
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.stream.set_read_timeout(Some(timeout))?;
        Ok(())
    }

    /// Send a request and wait for its reply. Returns the raw status
    /// plus the decoded JSON body.
    pub fn call(&mut self, opcode: OpCode, body: &impl Serialize) -> Result<(Status, Value)> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let payload = serde_json::to_vec(body)?;
        write_frame(
            &mut self.stream,
            &Frame::new(opcode as u16, request_id, payload),
        )?;
        self.read_reply(request_id)
    }

    fn read_reply(&mut self, request_id: u64) -> Result<(Status, Value)> {
        loop {
            match read_frame(&mut self.stream, self.max_frame)? {
                FrameRead::Eof => {
                    return Err(Error::Protocol("server closed the connection".into()))
                }
                FrameRead::TooLarge { .. } => {
                    return Err(Error::Protocol("oversized reply frame".into()))
                }
                FrameRead::Frame(frame) => {
                    if frame.request_id != request_id {
                        // Stale frame from an earlier stream; skip it
                        continue;
                    }
                    let status = Status::from_u16(frame.flags)
                        .ok_or_else(|| Error::Protocol("unknown reply status".into()))?;
                    let body = if frame.payload.is_empty() {
                        Value::Null
                    } else {
                        serde_json::from_slice(&frame.payload)?
                    };
                    return Ok((status, body));
                }
            }
        }
    }

    /// Run a document operation, converting error replies into errors.
    pub fn execute(&mut self, request: &ExecuteRequest) -> Result<Value> {
        let (status, body) = self.call(OpCode::Execute, request)?;
        into_result(status, body)
    }

    /// Subscribe to a project's change stream. The returned handle
    /// reads event frames off this connection; the client is consumed
    /// because the connection switches modes permanently.
    pub fn subscribe(mut self, project: &str, buffer: usize) -> Result<EventStream> {
        let (status, body) = self.call(
            OpCode::Subscribe,
            &serde_json::json!({ "project": project, "buffer": buffer }),
        )?;
        into_result(status, body)?;
        Ok(EventStream { client: self })
    }
}

/// Convert a reply into a result, surfacing the server's stable error
/// code in the message.
pub fn into_result(status: Status, body: Value) -> Result<Value> {
    if status == Status::Ok {
        return Ok(body);
    }
    let wire: WireError = serde_json::from_value(body)
        .unwrap_or_else(|_| WireError {
            code: "unknown".to_string(),
            message: "malformed error body".to_string(),
        });
    Err(Error::Protocol(format!("{}: {}", wire.code, wire.message)))
}

/// A connection switched into change-stream mode.
pub struct EventStream {
    client: Client,
}

impl EventStream {
    /// Next event, gap marker included, or `None` on timeout.
    pub fn next_event(&mut self, timeout: Duration) -> Result<Option<Value>> {
        self.client.stream.set_read_timeout(Some(timeout))?;
        match read_frame(&mut self.client.stream, self.client.max_frame) {
            Ok(FrameRead::Frame(frame)) => Ok(Some(serde_json::from_slice(&frame.payload)?)),
            Ok(FrameRead::Eof) => Err(Error::Protocol("stream closed".into())),
            Ok(FrameRead::TooLarge { .. }) => Err(Error::Protocol("oversized event frame".into())),
            Err(Error::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Raft transport over the framed protocol: one short-lived connection
/// per RPC, which keeps failure handling trivial (raft retries on its
/// own cadence anyway).
pub struct TcpRaftTransport {
    addrs: HashMap<NodeId, String>,
    timeout: Duration,
}

impl TcpRaftTransport {
    pub fn new(addrs: HashMap<NodeId, String>) -> TcpRaftTransport {
        TcpRaftTransport {
            addrs,
            timeout: Duration::from_millis(500),
        }
    }

    fn rpc<T: DeserializeOwned>(
        &self,
        peer: NodeId,
        opcode: OpCode,
        body: &impl Serialize,
    ) -> Result<T> {
        let addr = self
            .addrs
            .get(&peer)
            .ok_or_else(|| Error::Transient(format!("no address for peer {}", peer)))?;
        let mut client = Client::connect(addr)?;
        client.set_timeout(self.timeout)?;
        let (status, value) = client.call(opcode, body)?;
        let value = into_result(status, value)?;
        serde_json::from_value(value).map_err(Error::from)
    }
}

impl RaftTransport for TcpRaftTransport {
    fn request_vote(&self, peer: NodeId, req: &RequestVote) -> Result<VoteReply> {
        self.rpc(peer, OpCode::RequestVote, req)
    }

    fn append_entries(&self, peer: NodeId, req: &AppendEntries) -> Result<AppendReply> {
        self.rpc(peer, OpCode::AppendEntries, req)
    }
}
