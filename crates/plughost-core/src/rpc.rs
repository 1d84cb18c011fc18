//! Duplex JSON-lines RPC session.
//!
//! Either side can call the other over the same connection. A reader thread
//! routes replies to the caller waiting on them and hands inbound calls to a
//! single serve thread, so a handler can itself call the peer while the
//! peer's own call is still pending.

use crate::protocol::Frame;
use crate::transport::Connection;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RpcError {
    /// The session is gone: the peer crashed, closed the stream or was killed.
    #[error("transport error: {0}")]
    Transport(String),
    /// The peer handled the call and reported a failure.
    #[error("{0}")]
    Application(String),
    /// The caller stopped waiting. The session itself is still usable.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

impl RpcError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Serves calls the peer makes on a session.
pub trait InboundHandler: Send + Sync + 'static {
    fn handle(&self, peer: &RpcClient, method: &str, args: Vec<Value>) -> Result<Value, String>;
}

impl<F> InboundHandler for F
where
    F: Fn(&RpcClient, &str, Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
{
    fn handle(&self, peer: &RpcClient, method: &str, args: Vec<Value>) -> Result<Value, String> {
        self(peer, method, args)
    }
}

type ReplySender = Sender<Result<Value, RpcError>>;

#[derive(Default)]
struct SessionState {
    pending: HashMap<u64, ReplySender>,
    closed: Option<String>,
}

struct SessionShared {
    name: String,
    state: Mutex<SessionState>,
    outbound: Mutex<Option<Sender<Frame>>>,
    next_id: AtomicU64,
    closer: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl SessionShared {
    fn send_frame(&self, frame: Frame) -> Result<(), RpcError> {
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match outbound.as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| RpcError::Transport("session writer stopped".to_string())),
            None => Err(RpcError::Transport(self.close_reason())),
        }
    }

    fn close_reason(&self) -> String {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .closed
            .clone()
            .unwrap_or_else(|| "session closed".to_string())
    }

    /// Marks the session dead and fails every pending call. Idempotent.
    fn fail(&self, reason: &str) {
        let drained = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(reason.to_string());
            state.pending.drain().collect::<Vec<_>>()
        };

        tracing::debug!(session = %self.name, pending = drained.len(), reason, "rpc session closed");
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcError::Transport(reason.to_string())));
        }

        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(closer) = &self.closer {
            closer();
        }
    }

    fn complete(&self, id: u64, result: Result<Value, RpcError>) {
        let tx = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pending.remove(&id)
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => tracing::debug!(session = %self.name, id, "reply for unknown call dropped"),
        }
    }

    fn forget(&self, id: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.remove(&id);
    }
}

/// Cheap handle for calling the peer. Clones share the session.
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<SessionShared>,
}

impl RpcClient {
    /// Sends a call and returns immediately; the reply is collected from the
    /// returned handle. Several calls may be in flight at once.
    pub fn start_call(&self, method: &str, args: Vec<Value>) -> PendingCall {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel();

        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(reason) = &state.closed {
                let _ = tx.send(Err(RpcError::Transport(reason.clone())));
                return PendingCall {
                    id,
                    rx,
                    shared: Arc::clone(&self.shared),
                };
            }
            state.pending.insert(id, tx.clone());
        }

        let frame = Frame::Call {
            id,
            method: method.to_string(),
            args,
        };
        if let Err(err) = self.shared.send_frame(frame) {
            self.shared.forget(id);
            let _ = tx.send(Err(err));
        }

        PendingCall {
            id,
            rx,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Blocks until the peer answers or the session dies. No timeout.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.start_call(method, args).wait()
    }

    pub fn call_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.start_call(method, args).wait_timeout(timeout)
    }

    /// Fire-and-forget. Only fails when the session is already closed.
    pub fn notify(&self, method: &str, args: Vec<Value>) -> Result<(), RpcError> {
        self.shared.send_frame(Frame::Notify {
            method: method.to_string(),
            args,
        })
    }

    pub fn is_closed(&self) -> bool {
        let state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed.is_some()
    }

    pub fn close_reason(&self) -> Option<String> {
        let state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed.clone()
    }

    pub fn pending_calls(&self) -> usize {
        let state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.len()
    }

    pub fn close(&self, reason: &str) {
        self.shared.fail(reason);
    }
}

/// A call that has been sent and not yet answered.
pub struct PendingCall {
    id: u64,
    rx: Receiver<Result<Value, RpcError>>,
    shared: Arc<SessionShared>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn wait(self) -> Result<Value, RpcError> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(RpcError::Transport(self.shared.close_reason())),
        }
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<Value, RpcError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.shared.forget(self.id);
                Err(RpcError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(RpcError::Transport(self.shared.close_reason()))
            }
        }
    }
}

pub struct RpcSession {
    client: RpcClient,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    server: Option<JoinHandle<()>>,
}

impl RpcSession {
    pub fn start(name: &str, connection: Connection, handler: Arc<dyn InboundHandler>) -> Self {
        let closer = connection.closer();
        let (reader, writer) = connection.into_parts();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>();
        let (inbound_tx, inbound_rx) = mpsc::channel::<Frame>();

        let shared = Arc::new(SessionShared {
            name: name.to_string(),
            state: Mutex::new(SessionState::default()),
            outbound: Mutex::new(Some(outbound_tx)),
            next_id: AtomicU64::new(0),
            closer,
        });
        let client = RpcClient { shared };

        let writer = {
            let shared = Arc::clone(&client.shared);
            thread::Builder::new()
                .name(format!("rpc-writer-{name}"))
                .spawn(move || writer_loop(writer, outbound_rx, shared))
                .ok()
        };
        let reader = {
            let shared = Arc::clone(&client.shared);
            thread::Builder::new()
                .name(format!("rpc-reader-{name}"))
                .spawn(move || reader_loop(reader, inbound_tx, shared))
                .ok()
        };
        let server = {
            let client = client.clone();
            thread::Builder::new()
                .name(format!("rpc-serve-{name}"))
                .spawn(move || serve_loop(inbound_rx, client, handler))
                .ok()
        };

        if reader.is_none() || writer.is_none() || server.is_none() {
            client.close("failed to start session threads");
        }

        Self {
            client,
            reader,
            writer,
            server,
        }
    }

    pub fn client(&self) -> RpcClient {
        self.client.clone()
    }

    pub fn close(&self, reason: &str) {
        self.client.close(reason);
    }

    /// Blocks until the peer goes away and every inbound call has been served.
    pub fn join(mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(server) = self.server.take() {
            let _ = server.join();
        }
        self.client.close("session finished");
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.client.close("session dropped");
    }
}

fn writer_loop(
    mut writer: Box<dyn Write + Send>,
    outbound: Receiver<Frame>,
    shared: Arc<SessionShared>,
) {
    for frame in outbound {
        let line = match frame.encode() {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(session = %shared.name, error = %err, "dropping unencodable frame");
                continue;
            }
        };
        let written = writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());
        if let Err(err) = written {
            shared.fail(&format!("write failed: {err}"));
            return;
        }
    }
}

fn reader_loop(
    mut reader: Box<dyn BufRead + Send>,
    inbound: Sender<Frame>,
    shared: Arc<SessionShared>,
) {
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => {
                shared.fail("connection closed by peer");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                shared.fail(&format!("read failed: {err}"));
                return;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match Frame::decode(trimmed) {
            Ok(Frame::Reply { id, value, error }) => {
                let result = match error {
                    Some(message) => Err(RpcError::Application(message)),
                    None => Ok(value),
                };
                shared.complete(id, result);
            }
            Ok(frame) => {
                if inbound.send(frame).is_err() {
                    shared.fail("inbound handler stopped");
                    return;
                }
            }
            Err(err) => {
                tracing::warn!(session = %shared.name, error = %err, "ignoring malformed frame");
            }
        }
    }
}

fn serve_loop(inbound: Receiver<Frame>, client: RpcClient, handler: Arc<dyn InboundHandler>) {
    for frame in inbound {
        match frame {
            Frame::Call { id, method, args } => {
                let reply = match handler.handle(&client, &method, args) {
                    Ok(value) => Frame::Reply {
                        id,
                        value,
                        error: None,
                    },
                    Err(message) => Frame::Reply {
                        id,
                        value: Value::Null,
                        error: Some(message),
                    },
                };
                if client.shared.send_frame(reply).is_err() {
                    return;
                }
            }
            Frame::Notify { method, args } => {
                if let Err(err) = handler.handle(&client, &method, args) {
                    tracing::debug!(session = %client.shared.name, method, error = %err, "notification handler failed");
                }
            }
            Frame::Reply { .. } => {}
        }
    }
}
