//! Adapter process supervisor (component B).
//!
//! Spawns the debug adapter subprocess, rendezvous with its published
//! TCP endpoint via an environment-variable-named file, drains its
//! stderr into a bounded ring buffer, and tears it down on shutdown.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::errors::describe_exit_code;

/// Environment variable the adapter consults to publish its TCP endpoint.
pub const ENDPOINT_ENV_VAR: &str = "DEBUGPY_ADAPTER_ENDPOINTS";

const STDERR_RING_CAP: usize = 20;

/// Fatal substrings searched for (case-insensitively) in adapter stderr.
const FATAL_PATTERNS: &[&str] = &["permissionerror", "operation not permitted"];

#[derive(Debug)]
pub enum SupervisorError {
    Spawn(std::io::Error),
    /// The adapter exited before writing its endpoint file.
    ExitedBeforeReady {
        exit_code: Option<i32>,
        stderr_tail: Vec<String>,
    },
    /// The rendezvous file never became non-empty within the timeout.
    EndpointTimeout,
    /// The rendezvous file's contents were not `{"client": {"host", "port"}}`.
    MalformedEndpoint(String),
    Io(std::io::Error),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "failed to spawn adapter: {e}"),
            Self::ExitedBeforeReady { exit_code, stderr_tail } => write!(
                f,
                "adapter exited before it was ready ({}); stderr tail: {}",
                describe_exit_code(*exit_code),
                stderr_tail.join(" | ")
            ),
            Self::EndpointTimeout => write!(f, "timed out waiting for the adapter's endpoint file"),
            Self::MalformedEndpoint(raw) => write!(f, "adapter endpoint malformed: {raw}"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for SupervisorError {}

/// A bounded ring of the adapter's most recent stderr lines, plus the
/// first line (if any) matching a known fatal pattern.
#[derive(Debug, Default)]
pub struct StderrRing {
    lines: VecDeque<String>,
    summary: Option<String>,
}

impl StderrRing {
    fn push(&mut self, line: String) {
        let lowered = line.to_ascii_lowercase();
        if self.summary.is_none() && FATAL_PATTERNS.iter().any(|p| lowered.contains(p)) {
            self.summary = Some(line.clone());
        }
        if self.lines.len() == STDERR_RING_CAP {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn tail(&self, n: usize) -> Vec<String> {
        self.lines.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }
}

/// Handle to a spawned adapter process: the child, its stderr-drain task,
/// and the shared ring buffer the drain task writes into.
pub struct AdapterProcess {
    child: Child,
    stderr_task: Option<JoinHandle<()>>,
    stderr_ring: Arc<Mutex<StderrRing>>,
    rendezvous_path: PathBuf,
    terminate_grace: Duration,
}

impl AdapterProcess {
    /// Spawns `command` with `args`, exporting `ENDPOINT_ENV_VAR` pointing
    /// at a freshly allocated, initially-absent rendezvous file, then
    /// polls that file until the adapter publishes its endpoint and
    /// returns a connected TCP stream. `poll_interval`/`poll_timeout`
    /// govern the rendezvous poll; `terminate_grace` is remembered for
    /// the later graceful-then-forceful [`AdapterProcess::shutdown`].
    pub async fn spawn(
        command: &str,
        args: &[String],
        cwd: Option<&std::path::Path>,
        poll_interval: Duration,
        poll_timeout: Duration,
        terminate_grace: Duration,
    ) -> Result<(Self, TcpStream), SupervisorError> {
        let rendezvous_path = allocate_rendezvous_path();

        let mut cmd = Command::new(command);
        cmd.args(args)
            .env(ENDPOINT_ENV_VAR, &rendezvous_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;

        let stderr_ring = Arc::new(Mutex::new(StderrRing::default()));
        let stderr_task = child.stderr.take().map(|stderr| {
            let ring = Arc::clone(&stderr_ring);
            tokio::spawn(drain_stderr(stderr, ring))
        });

        let stream = match poll_for_endpoint(&mut child, &rendezvous_path, &stderr_ring, poll_interval, poll_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Some(task) = stderr_task {
                    task.abort();
                }
                let _ = child.start_kill();
                return Err(e);
            }
        };

        let _ = tokio::fs::remove_file(&rendezvous_path).await;

        Ok((
            Self {
                child,
                stderr_task,
                stderr_ring,
                rendezvous_path,
                terminate_grace,
            },
            stream,
        ))
    }

    pub fn stderr_ring(&self) -> Arc<Mutex<StderrRing>> {
        Arc::clone(&self.stderr_ring)
    }

    /// Returns the adapter's exit code if it has already exited.
    pub fn exit_code(&mut self) -> Option<i32> {
        self.child.try_wait().ok().flatten().and_then(|s| s.code())
    }

    /// Sends a graceful terminate, waits up to the configured
    /// `terminate_grace`, then kills if still running. Cancels the
    /// stderr-drain task and removes the rendezvous file if it still
    /// exists.
    pub async fn shutdown(mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }

        let _ = tokio::time::timeout(self.terminate_grace, self.child.wait()).await;
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        let _ = tokio::fs::remove_file(&self.rendezvous_path).await;
    }
}

fn allocate_rendezvous_path() -> PathBuf {
    let pid = std::process::id();
    let nonce = Instant::now().elapsed().as_nanos();
    std::env::temp_dir().join(format!("dap-broker-endpoint-{pid}-{nonce}.json"))
}

async fn poll_for_endpoint(
    child: &mut Child,
    rendezvous_path: &PathBuf,
    stderr_ring: &Arc<Mutex<StderrRing>>,
    poll_interval: Duration,
    poll_timeout: Duration,
) -> Result<TcpStream, SupervisorError> {
    let deadline = Instant::now() + poll_timeout;

    loop {
        if let Ok(Some(status)) = child.try_wait() {
            let stderr_tail = stderr_ring.lock().await.tail(5);
            return Err(SupervisorError::ExitedBeforeReady {
                exit_code: status.code(),
                stderr_tail,
            });
        }

        if let Ok(metadata) = tokio::fs::metadata(rendezvous_path).await
            && metadata.len() > 0
        {
            let raw = tokio::fs::read_to_string(rendezvous_path)
                .await
                .map_err(SupervisorError::Io)?;
            let value: Value = serde_json::from_str(&raw)
                .map_err(|e| SupervisorError::MalformedEndpoint(format!("{raw}: {e}")))?;
            let host = value
                .get("client")
                .and_then(|c| c.get("host"))
                .and_then(Value::as_str)
                .ok_or_else(|| SupervisorError::MalformedEndpoint(raw.clone()))?;
            let port = value
                .get("client")
                .and_then(|c| c.get("port"))
                .and_then(Value::as_u64)
                .ok_or_else(|| SupervisorError::MalformedEndpoint(raw.clone()))?;

            let stream = TcpStream::connect((host, port as u16))
                .await
                .map_err(SupervisorError::Io)?;
            return Ok(stream);
        }

        if Instant::now() >= deadline {
            return Err(SupervisorError::EndpointTimeout);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

async fn drain_stderr(mut stderr: tokio::process::ChildStderr, ring: Arc<Mutex<StderrRing>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(&buf[..pos]).trim_end_matches('\r').to_string();
            buf.drain(..=pos);
            ring.lock().await.push(line);
        }
    }
    if !buf.is_empty() {
        let line = String::from_utf8_lossy(&buf).to_string();
        ring.lock().await.push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_caps_at_twenty_lines() {
        let mut ring = StderrRing::default();
        for i in 0..30 {
            ring.push(format!("line {i}"));
        }
        assert_eq!(ring.tail(30).len(), STDERR_RING_CAP);
        assert_eq!(ring.tail(1), vec!["line 29".to_string()]);
    }

    #[test]
    fn fatal_pattern_is_matched_case_insensitively() {
        let mut ring = StderrRing::default();
        ring.push("starting up".to_string());
        ring.push("PermissionError: [Errno 13] denied".to_string());
        assert_eq!(
            ring.summary(),
            Some("PermissionError: [Errno 13] denied")
        );
    }

    #[test]
    fn only_the_first_fatal_line_becomes_the_summary() {
        let mut ring = StderrRing::default();
        ring.push("Operation not permitted".to_string());
        ring.push("permissionerror again".to_string());
        assert_eq!(ring.summary(), Some("Operation not permitted"));
    }
}
