//! Threaded TCP front end.
//!
//! One OS thread per connection, matching the platform's scheduling
//! model. Each connection reads frames under a read deadline; a
//! deadline hit closes the connection and answers no further frames on
//! it. Subscribe switches a connection into change-stream mode until
//! the client goes away.

use parking_lot::Mutex;
use serde_json::json;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use loam_core::{Error, Result};
use loam_engine::{ChangeKind, StreamItem};

use crate::frame::{read_frame, write_frame, Frame, FrameRead, MAX_FRAME_SIZE_DEFAULT};
use crate::gateway::{error_reply, ok_reply, Gateway, GatewayOutcome};
use crate::ops::{OpCode, Status};

/// Server knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_frame: usize,
    pub read_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            max_frame: MAX_FRAME_SIZE_DEFAULT,
            read_timeout: Duration::from_secs(60),
        }
    }
}

/// A running listener.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Bind and start accepting. Returns once the listener is live.
    pub fn start(config: ServerConfig, gateway: Arc<Gateway>) -> Result<Server> {
        let listener = TcpListener::bind(&config.bind_addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_shutdown = Arc::clone(&shutdown);
        let accept_thread = std::thread::Builder::new()
            .name("loam-accept".to_string())
            .spawn(move || accept_loop(listener, config, gateway, accept_shutdown))
            .expect("failed to spawn accept thread");

        info!(addr = %local_addr, "server listening");
        Ok(Server {
            local_addr,
            shutdown,
            accept_thread: Mutex::new(Some(accept_thread)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Existing connections finish on their own read
    /// deadlines.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    config: ServerConfig,
    gateway: Arc<Gateway>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "connection accepted");
                let gateway = Arc::clone(&gateway);
                let config = config.clone();
                let shutdown = Arc::clone(&shutdown);
                let _ = std::thread::Builder::new()
                    .name("loam-conn".to_string())
                    .spawn(move || {
                        if let Err(e) = serve_connection(stream, &config, &gateway, &shutdown) {
                            debug!(error = %e, "connection ended");
                        }
                    });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn serve_connection(
    mut stream: TcpStream,
    config: &ServerConfig,
    gateway: &Arc<Gateway>,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(config.read_timeout))?;

    loop {
        if shutdown.load(Ordering::Acquire) {
            return Ok(());
        }
        match read_frame(&mut stream, config.max_frame) {
            Ok(FrameRead::Eof) => return Ok(()),
            Ok(FrameRead::TooLarge { request_id, size }) => {
                let reply = error_reply(
                    request_id,
                    &Error::FrameTooLarge {
                        size,
                        max: config.max_frame,
                    },
                );
                write_frame(&mut stream, &reply)?;
            }
            Ok(FrameRead::Frame(frame)) => match gateway.handle(&frame) {
                GatewayOutcome::Reply(reply) => write_frame(&mut stream, &reply)?,
                GatewayOutcome::Subscribe { project, buffer } => {
                    return stream_changes(stream, frame.request_id, gateway, project, buffer, shutdown);
                }
            },
            // A read deadline closes the connection; no further frames
            // are answered on it
            Err(Error::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                debug!("read deadline reached, closing connection");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

/// Change-stream mode: forward events as reply frames until the peer
/// disconnects or the server shuts down.
fn stream_changes(
    mut stream: TcpStream,
    request_id: u64,
    gateway: &Arc<Gateway>,
    project: loam_core::ProjectId,
    buffer: usize,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    let lease = match gateway.manager().acquire(&project) {
        Ok(lease) => lease,
        Err(e) => {
            write_frame(&mut stream, &error_reply(request_id, &e))?;
            return Ok(());
        }
    };
    let subscription = match lease.engine().subscribe(buffer) {
        Ok(sub) => sub,
        Err(e) => {
            write_frame(&mut stream, &error_reply(request_id, &e))?;
            return Ok(());
        }
    };
    write_frame(&mut stream, &ok_reply(request_id, json!({ "subscribed": true })))?;

    loop {
        if shutdown.load(Ordering::Acquire) {
            return Ok(());
        }
        match subscription.recv_timeout(Duration::from_millis(250)) {
            Some(StreamItem::Event(event)) => {
                let payload = event
                    .payload
                    .as_deref()
                    .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(bytes).ok());
                let body = json!({
                    "seq": event.seq,
                    "kind": match event.kind {
                        ChangeKind::Insert => "insert",
                        ChangeKind::Delete => "delete",
                        ChangeKind::Expire => "expire",
                    },
                    "key": event.key.to_string(),
                    "payload": payload,
                });
                let frame = Frame::new(OpCode::Reply as u16, request_id, body.to_string().into_bytes())
                    .with_flags(Status::Ok as u16);
                if write_frame(&mut stream, &frame).is_err() {
                    // Peer went away; the subscription drops with us
                    return Ok(());
                }
            }
            Some(StreamItem::Gap) => {
                let frame = Frame::new(
                    OpCode::Reply as u16,
                    request_id,
                    json!({ "gap": true }).to_string().into_bytes(),
                )
                .with_flags(Status::Ok as u16);
                if write_frame(&mut stream, &frame).is_err() {
                    return Ok(());
                }
            }
            None => continue,
        }
    }
}
