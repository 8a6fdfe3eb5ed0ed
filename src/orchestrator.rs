//! Session orchestrator (component D).
//!
//! Drives a single debug session end to end: the startup handshake
//! (`initialize` -> `initialized` -> breakpoints -> `launch` ->
//! `configurationDone` -> first stop), the resilient breakpoint
//! registration protocol that survives adapters that are not ready
//! yet or whose source modules are not loaded yet, thread/frame
//! selection for stepping and locals, and idempotent shutdown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::cache::SessionCache;
use crate::config::BrokerConfig;
use crate::dap_types::{
    InitializeRequestArguments, ScopesArguments, ScopesResponseBody, SetBreakpointsArguments,
    SetBreakpointsResponseBody, SetExceptionBreakpointsArguments, Source, SourceBreakpoint,
    StackTraceArguments, StackTraceResponseBody, ThreadsResponseBody, VariablesArguments, VariablesResponseBody,
};
use crate::resolver;
use crate::supervisor::{AdapterProcess, SupervisorError};
use crate::transport::{DapTransport, EventReceiver, RequestError};

const AWAITING_INITIALIZED_QUICK_WAIT: Duration = Duration::from_secs(1);
const AWAITING_INITIALIZED_RETRY_WAIT: Duration = Duration::from_secs(5);

/// Mirrors the spec's startup state machine. `new` is represented by the
/// absence of a `Session`, so it is not a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    AwaitingInitialized,
    Configuring,
    Launching,
    Running,
    Stopped,
    Terminated,
    Closed,
}

#[derive(Debug)]
pub enum OrchestratorError {
    AlreadyRunning,
    NoSession,
    Spawn(SupervisorError),
    Request { step: &'static str, source: RequestError },
    NoThreads,
    SelectedThreadNotPresent(i64),
    Timeout { step: &'static str },
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "a session is already running"),
            Self::NoSession => write!(f, "no active session"),
            Self::Spawn(e) => write!(f, "failed to start the adapter: {e}"),
            Self::Request { step, source } => write!(f, "{step} failed: {source}"),
            Self::NoThreads => write!(f, "adapter reported no threads"),
            Self::SelectedThreadNotPresent(id) => write!(f, "selected thread not present: {id}"),
            Self::Timeout { step } => write!(f, "timed out waiting for {step}"),
        }
    }
}

impl std::error::Error for OrchestratorError {}

/// A single `(source_path, lines)` breakpoint request as supplied by a
/// caller, keyed by the path exactly as given (pre-resolution).
#[derive(Debug, Clone)]
pub struct BreakpointSpec {
    pub source_path: String,
    pub lines: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub program: String,
    pub cwd: Option<PathBuf>,
    pub breakpoints: Vec<BreakpointSpec>,
    pub stop_on_entry: bool,
    pub wait_for_breakpoint: bool,
    pub breakpoint_timeout: Duration,
}

/// Per-source record of what each registration phase reported, kept so
/// callers can audit why a breakpoint did or did not verify.
#[derive(Debug, Clone, Default)]
pub struct BreakpointAudit {
    pub initial: Option<Value>,
    pub post_init_retry: Option<Value>,
    pub post_stop_retry: Option<Value>,
}

pub struct LaunchOutcome {
    pub capabilities: Value,
    pub stopped_event: Option<Value>,
    pub breakpoint_audit: HashMap<String, BreakpointAudit>,
}

struct Session {
    adapter: AdapterProcess,
    transport: DapTransport,
    events_rx: EventReceiver,
    reader_task: tokio::task::JoinHandle<()>,
    state: Mutex<SessionState>,
    repo_root: PathBuf,
    pending_sources: Mutex<HashMap<String, Vec<i64>>>,
    audit: Mutex<HashMap<String, BreakpointAudit>>,
    cache: Mutex<SessionCache>,
}

/// Owns at most one active session. Not `Clone`: callers share one
/// orchestrator behind whatever locking their CLI layer chooses.
pub struct Orchestrator {
    session: Mutex<Option<Arc<Session>>>,
    adapter_command: String,
    adapter_args: Vec<String>,
    config: BrokerConfig,
}

impl Orchestrator {
    pub fn new(adapter_command: String, adapter_args: Vec<String>, config: BrokerConfig) -> Self {
        Self { session: Mutex::new(None), adapter_command, adapter_args, config }
    }

    /// The default `waitForEvent` timeout (5.2) when a caller does not
    /// supply its own.
    pub fn default_event_timeout(&self) -> Duration {
        self.config.event_timeout
    }

    pub async fn state(&self) -> Option<SessionState> {
        let guard = self.session.lock().await;
        match guard.as_ref() {
            Some(session) => Some(*session.state.lock().await),
            None => None,
        }
    }

    /// Runs the full startup handshake (4.D.1) against a freshly spawned
    /// adapter and returns once the first stop (or a timeout) resolves.
    pub async fn launch(&self, request: LaunchRequest, repo_root: PathBuf) -> Result<LaunchOutcome, OrchestratorError> {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            return Err(OrchestratorError::AlreadyRunning);
        }

        let (adapter, stream) = AdapterProcess::spawn(
            &self.adapter_command,
            &self.adapter_args,
            request.cwd.as_deref(),
            self.config.endpoint_poll_interval,
            self.config.endpoint_timeout,
            self.config.shutdown_grace,
        )
        .await
        .map_err(OrchestratorError::Spawn)?;

        let stderr_ring = adapter.stderr_ring();
        let (read_half, write_half) = stream.into_split();
        let (transport, events_rx, reader_task) = DapTransport::spawn(
            read_half,
            write_half,
            stderr_ring,
            self.config.event_queue_capacity,
            self.config.request_timeout,
        );

        let session = Arc::new(Session {
            adapter,
            transport,
            events_rx,
            reader_task,
            state: Mutex::new(SessionState::Initializing),
            repo_root,
            pending_sources: Mutex::new(HashMap::new()),
            audit: Mutex::new(HashMap::new()),
            cache: Mutex::new(SessionCache::new()),
        });

        let outcome = run_startup_sequence(&session, &request).await;

        match outcome {
            Ok(outcome) => {
                *guard = Some(session);
                Ok(outcome)
            }
            Err(e) => {
                session.reader_task.abort();
                session.transport.close().await;
                Err(e)
            }
        }
    }

    pub async fn set_breakpoints(&self, source_path: &str, lines: Vec<i64>) -> Result<Vec<Value>, OrchestratorError> {
        let session = self.current_session().await?;
        let cwd = std::env::current_dir().unwrap_or_else(|_| session.repo_root.clone());
        let resolved = resolver::resolve_source_path(source_path, &session.repo_root, &cwd);
        let reply = send_set_breakpoints(&session.transport, &resolved.path, &lines).await;
        match reply {
            Ok(breakpoints) => {
                session.audit.lock().await.entry(source_path.to_string()).or_default().initial = Some(json!(breakpoints));
                session.cache.lock().await.record_breakpoints(resolved.path, lines);
                Ok(breakpoints)
            }
            Err(e) => Err(OrchestratorError::Request { step: "setBreakpoints", source: e }),
        }
    }

    pub async fn list_breakpoints(&self) -> Result<HashMap<String, BreakpointAudit>, OrchestratorError> {
        let session = self.current_session().await?;
        Ok(session.audit.lock().await.clone())
    }

    /// Thread selection per 4.D.3. `caller_explicit` is a thread id the
    /// caller asked for directly (e.g. `continue(threadId)`); if given
    /// and absent from the adapter's thread list, this is an error
    /// rather than a silent fallback. `last_stopped` is the thread id
    /// recorded by the cache and only consulted as a soft preference.
    async fn select_thread(
        &self,
        session: &Session,
        caller_explicit: Option<i64>,
        last_stopped: Option<i64>,
    ) -> Result<i64, OrchestratorError> {
        let reply = session
            .transport
            .request("threads", json!({}))
            .await
            .map_err(|e| OrchestratorError::Request { step: "threads", source: e })?;
        let threads: Vec<i64> = serde_json::from_value::<ThreadsResponseBody>(reply.body)
            .map(|body| body.threads.into_iter().map(|t| t.id).collect())
            .unwrap_or_default();

        if threads.is_empty() {
            return Err(OrchestratorError::NoThreads);
        }
        if let Some(id) = caller_explicit {
            return if threads.contains(&id) {
                Ok(id)
            } else {
                Err(OrchestratorError::SelectedThreadNotPresent(id))
            };
        }
        if let Some(id) = last_stopped
            && threads.contains(&id)
        {
            return Ok(id);
        }
        Ok(threads[0])
    }

    async fn step(&self, command: &str, thread_id: Option<i64>) -> Result<(), OrchestratorError> {
        let session = self.current_session().await?;
        let last_stopped = session.cache.lock().await.last_stopped_thread_id();
        let thread_id = self.select_thread(&session, thread_id, last_stopped).await?;
        session
            .transport
            .request(command, json!({"threadId": thread_id}))
            .await
            .map_err(|e| OrchestratorError::Request { step: command, source: e })?;
        Ok(())
    }

    pub async fn step_over(&self) -> Result<(), OrchestratorError> {
        self.step("next", None).await
    }

    pub async fn step_in(&self) -> Result<(), OrchestratorError> {
        self.step("stepIn", None).await
    }

    pub async fn step_out(&self) -> Result<(), OrchestratorError> {
        self.step("stepOut", None).await
    }

    pub async fn continue_(&self, thread_id: Option<i64>) -> Result<(), OrchestratorError> {
        self.step("continue", thread_id).await
    }

    /// Thread/frame selection and locals extraction per 4.D.3.
    pub async fn locals(&self) -> Result<Value, OrchestratorError> {
        let session = self.current_session().await?;
        let last_stopped = session.cache.lock().await.last_stopped().cloned();
        let explicit_thread = last_stopped
            .as_ref()
            .and_then(|ev: &Value| ev.get("body"))
            .and_then(|b| b.get("threadId"))
            .and_then(Value::as_i64);
        let thread_id = self.select_thread(&session, None, explicit_thread).await?;

        let stack_args = StackTraceArguments { thread_id, start_frame: None, levels: None };
        let stack_reply = session
            .transport
            .request("stackTrace", serde_json::to_value(&stack_args).expect("infallible"))
            .await
            .map_err(|e| OrchestratorError::Request { step: "stackTrace", source: e })?;
        let frames = serde_json::from_value::<StackTraceResponseBody>(stack_reply.body)
            .map(|body| body.stack_frames)
            .unwrap_or_default();
        if frames.is_empty() {
            return Ok(json!({"selectedThreadId": thread_id, "selectedFrameId": null, "variables": []}));
        }

        let preferred_frame_id = last_stopped
            .as_ref()
            .and_then(|ev: &Value| ev.get("body"))
            .and_then(|b| b.get("frameId"))
            .and_then(Value::as_i64);
        let frame = preferred_frame_id
            .and_then(|id| frames.iter().find(|f| f.id == id))
            .unwrap_or(&frames[0]);
        let frame_id = frame.id;

        let scopes_args = ScopesArguments { frame_id };
        let scopes_reply = session
            .transport
            .request("scopes", serde_json::to_value(&scopes_args).expect("infallible"))
            .await
            .map_err(|e| OrchestratorError::Request { step: "scopes", source: e })?;
        let scopes = serde_json::from_value::<ScopesResponseBody>(scopes_reply.body)
            .map(|body| body.scopes)
            .unwrap_or_default();
        let locals_scope = scopes.iter().find(|s| s.name.to_ascii_lowercase().starts_with("locals"));

        let Some(locals_scope) = locals_scope else {
            return Ok(json!({"selectedThreadId": thread_id, "selectedFrameId": frame_id, "variables": []}));
        };
        let variables_args = VariablesArguments { variables_reference: locals_scope.variables_reference };

        let vars_reply = session
            .transport
            .request("variables", serde_json::to_value(&variables_args).expect("infallible"))
            .await
            .map_err(|e| OrchestratorError::Request { step: "variables", source: e })?;
        let variables = serde_json::from_value::<VariablesResponseBody>(vars_reply.body)
            .map(|body| serde_json::to_value(&body.variables).unwrap_or(json!([])))
            .unwrap_or(json!([]));

        Ok(json!({
            "selectedThreadId": thread_id,
            "selectedFrameId": frame_id,
            "variables": variables,
        }))
    }

    pub async fn last_stopped_event(&self) -> Result<Option<Value>, OrchestratorError> {
        let session = self.current_session().await?;
        Ok(session.cache.lock().await.last_stopped().cloned())
    }

    pub async fn wait_for_event(&self, name: &str, timeout: Duration) -> Result<Option<Value>, OrchestratorError> {
        let session = self.current_session().await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match session.events_rx.recv(remaining).await {
                Some(event) => {
                    if event.get("event").and_then(Value::as_str) == Some(name) {
                        if name == "stopped" {
                            *session.state.lock().await = SessionState::Stopped;
                            session.cache.lock().await.record_stopped(event.clone());
                        }
                        return Ok(Some(event));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    /// Idempotent per 4.D.5: returns `Ok(false)` if there was nothing to do.
    pub async fn shutdown(&self) -> Result<bool, OrchestratorError> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.take() else {
            return Ok(false);
        };
        *session.state.lock().await = SessionState::Closed;
        session.reader_task.abort();
        session.transport.close().await;
        if let Ok(session) = Arc::try_unwrap(session) {
            session.adapter.shutdown().await;
        }
        Ok(true)
    }

    async fn current_session(&self) -> Result<Arc<Session>, OrchestratorError> {
        self.session.lock().await.clone().ok_or(OrchestratorError::NoSession)
    }
}

async fn run_startup_sequence(session: &Arc<Session>, request: &LaunchRequest) -> Result<LaunchOutcome, OrchestratorError> {
    // 1. new -> initializing
    let init_args = InitializeRequestArguments {
        client_id: Some("dap-broker".to_string()),
        client_name: None,
        adapter_id: "dap-broker".to_string(),
        lines_start_at1: Some(true),
        columns_start_at1: Some(true),
        path_format: Some("path".to_string()),
        supports_run_in_terminal_request: Some(true),
    };
    let init_reply = session
        .transport
        .request("initialize", serde_json::to_value(&init_args).expect("infallible"))
        .await
        .map_err(|e| OrchestratorError::Request { step: "initialize", source: e })?;
    let capabilities = init_reply.body;

    // 2. initializing -> awaiting-initialized (best effort, never blocks startup)
    *session.state.lock().await = SessionState::AwaitingInitialized;
    session.transport.wait_for_initialized(AWAITING_INITIALIZED_QUICK_WAIT).await;

    // 3. awaiting-initialized -> configuring: initial breakpoint attempt +
    // empty exception-breakpoint configuration.
    *session.state.lock().await = SessionState::Configuring;
    let mut audit = register_breakpoints_initial(session, request).await;
    let exception_args = SetExceptionBreakpointsArguments { filters: Vec::new() };
    let _ = session
        .transport
        .request("setExceptionBreakpoints", serde_json::to_value(&exception_args).expect("infallible"))
        .await;

    // 4. configuring -> launching: dispatch launch without awaiting it yet,
    // then send configurationDone while it is in flight.
    *session.state.lock().await = SessionState::Launching;
    let transport = session.transport.clone();
    let mut launch_args = json!({"program": request.program, "stopOnEntry": request.stop_on_entry});
    if let Some(cwd) = &request.cwd {
        launch_args["cwd"] = json!(cwd.display().to_string());
    }
    let launch_handle = tokio::spawn(async move { transport.request("launch", launch_args).await });

    let _ = session
        .transport
        .request("configurationDone", json!({}))
        .await
        .map_err(|e| OrchestratorError::Request { step: "configurationDone", source: e })?;

    // 5. re-check the initialized latch; if it only just arrived, retry
    // breakpoint registration once more before the stop.
    if !session.transport.is_initialized() {
        session.transport.wait_for_initialized(AWAITING_INITIALIZED_RETRY_WAIT).await;
    }
    if session.transport.is_initialized() {
        register_breakpoints_post_init(session, &mut audit).await;
    }

    // 6. await the launch response.
    launch_handle
        .await
        .map_err(|_| OrchestratorError::Request {
            step: "launch",
            source: RequestError::Terminal(crate::transport::TerminalError::ClosedByCaller),
        })?
        .map_err(|e| OrchestratorError::Request { step: "launch", source: e })?;

    // 7. launching -> running.
    *session.state.lock().await = SessionState::Running;

    let breakpoints_registered = !session.pending_sources.lock().await.is_empty() || !request.breakpoints.is_empty();
    let stopped_event = if request.wait_for_breakpoint && breakpoints_registered {
        let deadline = tokio::time::Instant::now() + request.breakpoint_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break None;
            }
            match session.events_rx.recv(remaining).await {
                Some(event) if event.get("event").and_then(Value::as_str) == Some("stopped") => break Some(event),
                Some(_) => continue,
                None => break None,
            }
        }
    } else {
        None
    };

    // 8. on first stop: running -> stopped, post-stop retry phase.
    if let Some(event) = &stopped_event {
        *session.state.lock().await = SessionState::Stopped;
        session.cache.lock().await.record_stopped(event.clone());
        register_breakpoints_post_stop(session, &mut audit, event).await;
    }

    *session.audit.lock().await = audit.clone();
    Ok(LaunchOutcome { capabilities, stopped_event, breakpoint_audit: audit })
}

async fn register_breakpoints_initial(session: &Arc<Session>, request: &LaunchRequest) -> HashMap<String, BreakpointAudit> {
    let mut audit = HashMap::new();
    let mut pending = session.pending_sources.lock().await;

    for spec in &request.breakpoints {
        pending.insert(spec.source_path.clone(), spec.lines.clone());
    }
    if request.stop_on_entry {
        let program_key = request.program.clone();
        pending.entry(program_key).or_insert_with(|| vec![1]);
    }

    for (source_path, lines) in pending.iter() {
        let cwd = request.cwd.clone().unwrap_or_else(|| session.repo_root.clone());
        let resolved = resolver::resolve_source_path(source_path, &session.repo_root, &cwd);
        let reply = send_set_breakpoints(&session.transport, &resolved.path, lines).await;
        let entry = audit.entry(source_path.clone()).or_insert_with(BreakpointAudit::default);
        match reply {
            Ok(breakpoints) => {
                entry.initial = Some(json!(breakpoints));
            }
            Err(e) => {
                entry.initial = Some(json!({"error": e.to_string()}));
            }
        }
    }
    audit
}

async fn register_breakpoints_post_init(session: &Arc<Session>, audit: &mut HashMap<String, BreakpointAudit>) {
    retry_unverified(session, audit, |entry| &mut entry.post_init_retry).await;
}

async fn register_breakpoints_post_stop(session: &Arc<Session>, audit: &mut HashMap<String, BreakpointAudit>, _stopped_event: &Value) {
    retry_unverified(session, audit, |entry| &mut entry.post_stop_retry).await;
}

/// Re-sends `setBreakpoints` for every source whose most recent attempt
/// did not come back `success:true`, writing the new result into the
/// phase-specific audit slot selected by `phase`.
async fn retry_unverified(
    session: &Arc<Session>,
    audit: &mut HashMap<String, BreakpointAudit>,
    phase: impl Fn(&mut BreakpointAudit) -> &mut Option<Value>,
) {
    let pending = session.pending_sources.lock().await.clone();
    let cwd = std::env::current_dir().unwrap_or_else(|_| session.repo_root.clone());

    for (source_path, lines) in pending.iter() {
        let already_ok = audit
            .get(source_path)
            .map(|entry| response_succeeded(&entry.initial))
            .unwrap_or(false);
        if already_ok {
            continue;
        }

        let resolved = resolver::resolve_source_path(source_path, &session.repo_root, &cwd);
        let reply = send_set_breakpoints(&session.transport, &resolved.path, lines).await;
        let entry = audit.entry(source_path.clone()).or_insert_with(BreakpointAudit::default);
        match reply {
            Ok(breakpoints) => *phase(entry) = Some(json!(breakpoints)),
            Err(e) => *phase(entry) = Some(json!({"error": e.to_string()})),
        }
    }
}

fn response_succeeded(recorded: &Option<Value>) -> bool {
    match recorded {
        Some(Value::Object(obj)) if obj.contains_key("error") => false,
        Some(Value::Array(breakpoints)) => !breakpoints.is_empty()
            && breakpoints
                .iter()
                .all(|bp| bp.get("verified").and_then(Value::as_bool).unwrap_or(false)),
        _ => false,
    }
}

async fn send_set_breakpoints(transport: &DapTransport, path: &Path, lines: &[i64]) -> Result<Vec<Value>, RequestError> {
    let source_breakpoints: Vec<SourceBreakpoint> =
        lines.iter().map(|line| SourceBreakpoint { line: *line, ..Default::default() }).collect();
    let args = SetBreakpointsArguments {
        source: Source {
            name: path.file_name().and_then(|n| n.to_str()).map(String::from),
            path: Some(path.display().to_string()),
            source_reference: None,
        },
        breakpoints: Some(source_breakpoints),
        lines: Some(lines.to_vec()),
    };
    let reply = transport.request("setBreakpoints", serde_json::to_value(&args).expect("infallible")).await?;
    let breakpoints = serde_json::from_value::<SetBreakpointsResponseBody>(reply.body)
        .map(|body| body.breakpoints.into_iter().map(|bp| serde_json::to_value(&bp).unwrap_or(Value::Null)).collect())
        .unwrap_or_default();
    Ok(breakpoints)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_succeeded_requires_every_breakpoint_verified() {
        let all_verified = json!([{"verified": true}, {"verified": true}]);
        assert!(response_succeeded(&Some(all_verified)));

        let one_unverified = json!([{"verified": true}, {"verified": false}]);
        assert!(!response_succeeded(&Some(one_unverified)));

        let empty = json!([]);
        assert!(!response_succeeded(&Some(empty)));
    }

    #[test]
    fn response_succeeded_is_false_for_recorded_errors() {
        let recorded = json!({"error": "Server is not available"});
        assert!(!response_succeeded(&Some(recorded)));
    }

    #[test]
    fn response_succeeded_is_false_when_nothing_recorded_yet() {
        assert!(!response_succeeded(&None));
    }
}
