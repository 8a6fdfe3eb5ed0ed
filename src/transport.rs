//! DAP transport client (component C).
//!
//! Owns sequence-number allocation, the pending-request table, the
//! bounded event queue with its `initialized` latch, and reverse-request
//! dispatch (`runInTerminal`). A single reader task owns the inbound
//! stream; multiple callers may hold cloned handles to `DapTransport`
//! and call `request` concurrently.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{self, CodecError};
use crate::dap_types::{DapMessage, Request, RunInTerminalRequestArguments, RunInTerminalResponseBody};
use crate::supervisor::StderrRing;

#[derive(Debug, Clone)]
pub enum TerminalError {
    /// The reader observed a framing/IO/JSON error.
    Reader(String),
    /// The reader observed a clean EOF (adapter closed the connection).
    Eof,
    /// `close()` was called explicitly.
    ClosedByCaller,
}

impl std::fmt::Display for TerminalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reader(msg) => write!(f, "transport reader failed: {msg}"),
            Self::Eof => write!(f, "adapter closed the connection"),
            Self::ClosedByCaller => write!(f, "transport was closed"),
        }
    }
}

impl std::error::Error for TerminalError {}

#[derive(Debug)]
pub enum RequestError {
    /// The transport had already terminated before this call.
    Terminal(TerminalError),
    /// The adapter replied with `success: false`.
    AdapterFailure { message: Option<String>, body: Value },
    /// The write side failed.
    WriteFailed(String),
    /// No response arrived within the configured request timeout.
    Timeout,
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminal(e) => write!(f, "{e}"),
            Self::AdapterFailure { message, .. } => write!(
                f,
                "adapter rejected request: {}",
                message.as_deref().unwrap_or("(no message)")
            ),
            Self::WriteFailed(msg) => write!(f, "failed to write request: {msg}"),
            Self::Timeout => write!(f, "timed out waiting for the adapter's response"),
        }
    }
}

impl std::error::Error for RequestError {}

struct PendingTable {
    slots: HashMap<i64, oneshot::Sender<Value>>,
}

/// A completed request/response pair awaited by [`DapTransport::request`].
pub struct DapResponse {
    pub success: bool,
    pub message: Option<String>,
    pub body: Value,
}

/// Bounded event backlog implementing drop-oldest-with-warning: once
/// `capacity` is reached, the oldest buffered event is discarded to make
/// room for the new one, rather than rejecting the new arrival. A plain
/// `mpsc` channel cannot provide this (it can only refuse the newest
/// item once full), hence the hand-rolled deque plus `Notify`.
struct EventQueue {
    capacity: usize,
    buffer: Mutex<VecDeque<Value>>,
    notify: Notify,
}

impl EventQueue {
    fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), buffer: Mutex::new(VecDeque::new()), notify: Notify::new() }
    }

    async fn push(&self, value: Value, event_name: &str) {
        let mut buffer = self.buffer.lock().await;
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            log::warn!(
                "DAP event queue full (capacity {}), dropping oldest buffered event to admit '{event_name}'",
                self.capacity
            );
        }
        buffer.push_back(value);
        drop(buffer);
        self.notify.notify_waiters();
    }

    async fn recv(&self, timeout: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            {
                let mut buffer = self.buffer.lock().await;
                if let Some(value) = buffer.pop_front() {
                    return Some(value);
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }
}

/// Handle returned alongside [`DapTransport`] for draining its bounded
/// event queue. Each call to [`EventReceiver::recv`] pops at most one
/// event, waiting up to `timeout` for one to arrive.
pub struct EventReceiver {
    queue: Arc<EventQueue>,
}

impl EventReceiver {
    pub async fn recv(&self, timeout: Duration) -> Option<Value> {
        self.queue.recv(timeout).await
    }
}

struct Inner {
    next_seq: AtomicI64,
    pending: Mutex<PendingTable>,
    writer: Mutex<OwnedWriteHalf>,
    events: Arc<EventQueue>,
    initialized_tx: Mutex<Option<Vec<oneshot::Sender<()>>>>,
    initialized: std::sync::atomic::AtomicBool,
    terminal_error: Mutex<Option<TerminalError>>,
    request_timeout: Duration,
}

/// Shared handle to a running DAP transport. Cloning shares the same
/// underlying connection and pending table.
#[derive(Clone)]
pub struct DapTransport {
    inner: Arc<Inner>,
}

impl DapTransport {
    /// Splits `stream` into its read/write halves and spawns the reader
    /// task. `stderr_ring` is consulted when synthesizing the terminal
    /// error message surfaced to callers after the transport closes.
    /// `event_queue_capacity` bounds the backlog drained via the
    /// returned [`EventReceiver`]; `request_timeout` bounds every call
    /// to [`DapTransport::request`].
    pub fn spawn(
        read_half: OwnedReadHalf,
        write_half: OwnedWriteHalf,
        stderr_ring: Arc<Mutex<StderrRing>>,
        event_queue_capacity: usize,
        request_timeout: Duration,
    ) -> (Self, EventReceiver, JoinHandle<()>) {
        let events = Arc::new(EventQueue::new(event_queue_capacity));

        let inner = Arc::new(Inner {
            next_seq: AtomicI64::new(1),
            pending: Mutex::new(PendingTable { slots: HashMap::new() }),
            writer: Mutex::new(write_half),
            events: Arc::clone(&events),
            initialized_tx: Mutex::new(Some(Vec::new())),
            initialized: std::sync::atomic::AtomicBool::new(false),
            terminal_error: Mutex::new(None),
            request_timeout,
        });

        let transport = Self { inner: Arc::clone(&inner) };
        let reader_inner = Arc::clone(&inner);
        let reader_task = tokio::spawn(async move {
            reader_loop(read_half, reader_inner, stderr_ring).await;
        });

        (transport, EventReceiver { queue: events }, reader_task)
    }

    pub fn next_seq(&self) -> i64 {
        self.inner.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Sends `command` with `arguments`, awaiting the matching response
    /// within the transport's configured request timeout.
    pub async fn request(&self, command: &str, arguments: Value) -> Result<DapResponse, RequestError> {
        if let Some(err) = self.inner.terminal_error.lock().await.clone() {
            return Err(RequestError::Terminal(err));
        }

        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.slots.insert(seq, tx);

        let frame = Request { seq, type_: "request".to_string(), command: command.to_string(), arguments };
        let frame = serde_json::to_value(&frame).expect("a Request always serializes to JSON");

        {
            let mut writer = self.inner.writer.lock().await;
            if let Err(e) = codec::write_message(&mut *writer, &frame).await {
                self.inner.pending.lock().await.slots.remove(&seq);
                return Err(RequestError::WriteFailed(e.to_string()));
            }
        }

        let response = match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(RequestError::Terminal(
                    self.inner
                        .terminal_error
                        .try_lock()
                        .ok()
                        .and_then(|g| g.clone())
                        .unwrap_or(TerminalError::ClosedByCaller),
                ));
            }
            Err(_) => {
                self.inner.pending.lock().await.slots.remove(&seq);
                return Err(RequestError::Timeout);
            }
        };

        let (success, message, body) = match serde_json::from_value::<crate::dap_types::Response>(response.clone()) {
            Ok(resp) => (resp.success, resp.message, resp.body),
            Err(e) => {
                log::warn!("DAP response for '{command}' did not match the expected envelope shape: {e}");
                (
                    response.get("success").and_then(Value::as_bool).unwrap_or(false),
                    response.get("message").and_then(Value::as_str).map(String::from),
                    response.get("body").cloned().unwrap_or(Value::Null),
                )
            }
        };

        if !success {
            return Err(RequestError::AdapterFailure { message, body });
        }
        Ok(DapResponse { success, message, body })
    }

    /// Awaits the `initialized` latch. Idempotent: returns immediately if
    /// already set. Returns `false` on timeout without being an error —
    /// callers treat this as a best-effort wait per the startup sequence.
    pub async fn wait_for_initialized(&self, timeout: Duration) -> bool {
        if self.inner.initialized.load(Ordering::SeqCst) {
            return true;
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.inner.initialized_tx.lock().await;
            match guard.as_mut() {
                Some(waiters) => waiters.push(tx),
                None => return self.inner.initialized.load(Ordering::SeqCst),
            }
        }
        tokio::time::timeout(timeout, rx).await.is_ok()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Closes the writer half. The reader task observes the peer close
    /// (or is aborted by the caller separately) and fails pending slots.
    pub async fn close(&self) {
        let mut terminal = self.inner.terminal_error.lock().await;
        if terminal.is_none() {
            *terminal = Some(TerminalError::ClosedByCaller);
        }
        drop(terminal);
        let _ = self.inner.writer.lock().await.shutdown().await;
        fail_all_pending(&self.inner).await;
    }
}

async fn fail_all_pending(inner: &Inner) {
    let mut pending = inner.pending.lock().await;
    for (_, tx) in pending.slots.drain() {
        let _ = tx.send(json!({"success": false, "message": "transport closed"}));
    }
}

async fn reader_loop(
    read_half: OwnedReadHalf,
    inner: Arc<Inner>,
    stderr_ring: Arc<Mutex<StderrRing>>,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        match codec::read_message(&mut reader).await {
            Ok(msg) => dispatch(&inner, msg).await,
            Err(CodecError::Eof) => {
                record_terminal_error(&inner, TerminalError::Eof, &stderr_ring).await;
                break;
            }
            Err(e) => {
                record_terminal_error(&inner, TerminalError::Reader(e.to_string()), &stderr_ring)
                    .await;
                break;
            }
        }
    }
}

async fn record_terminal_error(inner: &Inner, err: TerminalError, _stderr_ring: &Arc<Mutex<StderrRing>>) {
    let mut terminal = inner.terminal_error.lock().await;
    if terminal.is_none() {
        *terminal = Some(err);
    }
    drop(terminal);
    fail_all_pending(inner).await;
}

async fn dispatch(inner: &Inner, msg: Value) {
    match serde_json::from_value::<DapMessage>(msg.clone()) {
        Ok(DapMessage::Response(resp)) => {
            let mut pending = inner.pending.lock().await;
            if let Some(tx) = pending.slots.remove(&resp.request_seq) {
                let _ = tx.send(msg);
            } else {
                log::warn!("DAP response with unknown request_seq {}, discarding", resp.request_seq);
            }
        }
        Ok(DapMessage::Event(event)) => {
            if event.event == "initialized" {
                inner.initialized.store(true, Ordering::SeqCst);
                if let Some(waiters) = inner.initialized_tx.lock().await.take() {
                    for tx in waiters {
                        let _ = tx.send(());
                    }
                }
            }
            inner.events.push(msg, &event.event).await;
        }
        Ok(DapMessage::Request(req)) => {
            handle_reverse_request(inner, req).await;
        }
        Err(e) => {
            log::warn!("unrecognized DAP message, discarding: {e}");
        }
    }
}

/// The only reverse request this client implements: `runInTerminal`,
/// which spawns a detached subprocess and replies with its PID. All
/// other reverse commands are refused so the adapter never hangs.
async fn handle_reverse_request(inner: &Inner, req: Request) {
    let response = if req.command == "runInTerminal" {
        run_in_terminal(req.arguments.clone()).await
    } else {
        json!({
            "type": "response",
            "request_seq": req.seq,
            "success": false,
            "command": req.command,
            "message": format!("reverse request '{}' is not supported", req.command),
        })
    };

    let response = merge_seq_and_command(response, req.seq, &req.command);
    let mut writer = inner.writer.lock().await;
    let _ = codec::write_message(&mut *writer, &response).await;
}

fn merge_seq_and_command(mut response: Value, seq: i64, command: &str) -> Value {
    if let Some(obj) = response.as_object_mut() {
        obj.entry("request_seq").or_insert(json!(seq));
        obj.entry("command").or_insert(json!(command));
        obj.entry("type").or_insert(json!("response"));
    }
    response
}

async fn run_in_terminal(arguments: Value) -> Value {
    let args: RunInTerminalRequestArguments = match serde_json::from_value(arguments) {
        Ok(args) => args,
        Err(e) => return json!({"success": false, "message": format!("runInTerminal: malformed arguments: {e}")}),
    };

    if args.args.is_empty() {
        return json!({"success": false, "message": "runInTerminal: empty args"});
    }

    let mut cmd = tokio::process::Command::new(&args.args[0]);
    cmd.args(&args.args[1..])
        .current_dir(&args.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    if let Some(env_overrides) = &args.env {
        for (key, value) in env_overrides {
            match value {
                None => {
                    cmd.env_remove(key);
                }
                Some(v) => {
                    cmd.env(key, v);
                }
            }
        }
    }

    match cmd.spawn() {
        Ok(child) => {
            let pid = child.id().unwrap_or(0);
            std::mem::forget(child); // detached: the spawned process outlives this await
            let body = RunInTerminalResponseBody { process_id: Some(pid as i64), shell_process_id: Some(0) };
            json!({"success": true, "body": serde_json::to_value(&body).unwrap_or(Value::Null)})
        }
        Err(e) => json!({"success": false, "message": format!("failed to spawn terminal process: {e}")}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_in_terminal_rejects_empty_args() {
        let response = run_in_terminal(json!({"args": [], "cwd": "."})).await;
        assert_eq!(response.get("success").and_then(Value::as_bool), Some(false));
    }

    #[tokio::test]
    async fn run_in_terminal_removes_env_vars_set_to_null() {
        let mut cmd = tokio::process::Command::new("true");
        cmd.env("KEPT", "1");
        let arguments = json!({
            "args": ["true"],
            "cwd": ".",
            "env": {"DAP_BROKER_TEST_VAR": null},
        });
        std::env::set_var("DAP_BROKER_TEST_VAR", "should-be-removed");
        let response = run_in_terminal(arguments).await;
        std::env::remove_var("DAP_BROKER_TEST_VAR");
        assert_eq!(response.get("success").and_then(Value::as_bool), Some(true));
    }

    #[test]
    fn merge_seq_and_command_fills_in_missing_fields() {
        let response = json!({"success": false, "message": "nope"});
        let merged = merge_seq_and_command(response, 7, "runInTerminal");
        assert_eq!(merged.get("request_seq").and_then(Value::as_i64), Some(7));
        assert_eq!(merged.get("command").and_then(Value::as_str), Some("runInTerminal"));
        assert_eq!(merged.get("type").and_then(Value::as_str), Some("response"));
    }

    #[test]
    fn merge_seq_and_command_does_not_overwrite_existing_fields() {
        let response = json!({"success": true, "request_seq": 99, "command": "already-set"});
        let merged = merge_seq_and_command(response, 7, "runInTerminal");
        assert_eq!(merged.get("request_seq").and_then(Value::as_i64), Some(99));
        assert_eq!(merged.get("command").and_then(Value::as_str), Some("already-set"));
    }
}
