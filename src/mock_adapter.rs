//! Fake DAP adapter used by the `mock-adapter` CLI subcommand and by the
//! integration tests. Binds a TCP listener, publishes the port through
//! the rendezvous-file convention the supervisor polls for, and drives a
//! small scripted session covering the seed-suite scenarios: a late
//! `initialized` event, a breakpoint that only verifies once its module
//! is "loaded" (simulated at `configurationDone`), two threads, and a
//! locals scope.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;
use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::codec;
use crate::supervisor::ENDPOINT_ENV_VAR;

/// Runs a single scripted session: accepts one connection, publishes the
/// rendezvous file read from `ENDPOINT_ENV_VAR`, then serves requests
/// until the peer disconnects. When `reject_breakpoints_until_initialized`
/// is set, `setBreakpoints` returns the protocol-level `success: false`
/// ("Server is not available") rejection until `initialized` has actually
/// been sent, exercising the same path a real adapter takes when asked
/// to configure breakpoints before it is ready.
pub async fn run(initialized_delay_ms: u64, reject_breakpoints_until_initialized: bool) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();

    if let Ok(rendezvous_path) = std::env::var(ENDPOINT_ENV_VAR) {
        publish_endpoint(Path::new(&rendezvous_path), port).await?;
    }

    let (stream, _) = listener.accept().await?;
    serve(stream, initialized_delay_ms, reject_breakpoints_until_initialized).await
}

async fn publish_endpoint(path: &Path, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let body = json!({"client": {"host": "127.0.0.1", "port": port}});
    tokio::fs::write(path, serde_json::to_vec(&body)?).await?;
    Ok(())
}

async fn serve(
    stream: TcpStream,
    initialized_delay_ms: u64,
    reject_breakpoints_until_initialized: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let writer = Arc::new(Mutex::new(write_half));

    // Mock session state: two threads, one breakpoint source that only
    // verifies after "configurationDone" simulates the module loading.
    let mut module_loaded = false;
    let mut sent_stopped = false;
    let initialized_sent = Arc::new(AtomicBool::new(false));

    loop {
        let msg = match codec::read_message(&mut reader).await {
            Ok(msg) => msg,
            Err(_) => break,
        };

        let msg_type = msg.get("type").and_then(Value::as_str).unwrap_or("");
        if msg_type != "request" {
            continue;
        }
        let command = msg.get("command").and_then(Value::as_str).unwrap_or("");
        let seq = msg.get("seq").and_then(Value::as_i64).unwrap_or(0);

        match command {
            "initialize" => {
                respond(&writer, seq, "initialize", true, json!({"supportsConfigurationDoneRequest": true})).await?;
                let delay = initialized_delay_ms;
                // Emit `initialized` on a background task so it can arrive
                // late relative to the `initialize` response, exercising
                // the orchestrator's best-effort wait and post-init retry.
                let late_writer = Arc::clone(&writer);
                let initialized_sent = Arc::clone(&initialized_sent);
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    let event = json!({"seq": 0, "type": "event", "event": "initialized"});
                    let _ = codec::write_message(&mut *late_writer.lock().await, &event).await;
                    initialized_sent.store(true, Ordering::SeqCst);
                });
            }
            "setBreakpoints" => {
                if reject_breakpoints_until_initialized && !initialized_sent.load(Ordering::SeqCst) {
                    let response = json!({
                        "seq": 0,
                        "type": "response",
                        "request_seq": seq,
                        "command": "setBreakpoints",
                        "success": false,
                        "message": "Server is not available",
                    });
                    codec::write_message(&mut *writer.lock().await, &response).await?;
                    continue;
                }
                let lines: Vec<i64> = msg
                    .get("arguments")
                    .and_then(|a| a.get("lines"))
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_i64).collect())
                    .unwrap_or_default();
                let verified = module_loaded;
                let breakpoints: Vec<Value> = lines
                    .iter()
                    .map(|line| json!({"verified": verified, "line": line}))
                    .collect();
                respond(&writer, seq, "setBreakpoints", true, json!({"breakpoints": breakpoints})).await?;
            }
            "setExceptionBreakpoints" => {
                respond(&writer, seq, "setExceptionBreakpoints", true, json!({})).await?;
            }
            "launch" => {
                respond(&writer, seq, "launch", true, json!({})).await?;
            }
            "configurationDone" => {
                module_loaded = true;
                respond(&writer, seq, "configurationDone", true, json!({})).await?;

                if !sent_stopped {
                    let stopped = json!({
                        "seq": 0,
                        "type": "event",
                        "event": "stopped",
                        "body": {"reason": "breakpoint", "threadId": 1},
                    });
                    codec::write_message(&mut *writer.lock().await, &stopped).await?;
                    sent_stopped = true;
                }
            }
            "threads" => {
                let threads = json!([
                    {"id": 1, "name": "main"},
                    {"id": 2, "name": "worker"},
                ]);
                respond(&writer, seq, "threads", true, json!({"threads": threads})).await?;
            }
            "stackTrace" => {
                let frames = json!([
                    {"id": 100, "name": "top_frame", "line": 42, "column": 1},
                ]);
                respond(&writer, seq, "stackTrace", true, json!({"stackFrames": frames, "totalFrames": 1})).await?;
            }
            "scopes" => {
                let scopes = json!([
                    {"name": "Locals", "variablesReference": 1000, "expensive": false},
                ]);
                respond(&writer, seq, "scopes", true, json!({"scopes": scopes})).await?;
            }
            "variables" => {
                let variables = json!([
                    {"name": "x", "value": "3", "variablesReference": 0},
                    {"name": "y", "value": "4", "variablesReference": 0},
                ]);
                respond(&writer, seq, "variables", true, json!({"variables": variables})).await?;
            }
            "next" | "stepIn" | "stepOut" | "continue" => {
                respond(&writer, seq, command, true, json!({})).await?;
                let stopped = json!({
                    "seq": 0,
                    "type": "event",
                    "event": "stopped",
                    "body": {"reason": "step", "threadId": 1},
                });
                codec::write_message(&mut *writer.lock().await, &stopped).await?;
            }
            other => {
                warn!("mock-adapter: unhandled command '{other}'");
                respond(&writer, seq, other, false, json!(null)).await?;
            }
        }
    }

    Ok(())
}

async fn respond(
    writer: &Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>,
    request_seq: i64,
    command: &str,
    success: bool,
    body: Value,
) -> Result<(), codec::CodecError> {
    let response = json!({
        "seq": 0,
        "type": "response",
        "request_seq": request_seq,
        "command": command,
        "success": success,
        "body": body,
    });
    codec::write_message(&mut *writer.lock().await, &response).await
}
