//! End-to-end tests driving the orchestrator against the scripted mock
//! adapter. Each test spawns the compiled `dap-broker` binary in
//! `mock-adapter` mode as the adapter subprocess, so these exercise the
//! real rendezvous/TCP/framing path, not just in-memory logic.

use std::path::PathBuf;
use std::time::Duration;

use dap_broker::config::BrokerConfig;
use dap_broker::orchestrator::{BreakpointSpec, LaunchRequest, Orchestrator};

/// Locates the sibling `dap-broker` binary built alongside this test binary.
fn binary_path() -> String {
    let mut path = std::env::current_exe().expect("cannot determine test binary path");
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("dap-broker");
    path.display().to_string()
}

fn mock_orchestrator(initialized_delay_ms: u64) -> Orchestrator {
    Orchestrator::new(
        binary_path(),
        vec!["mock-adapter".to_string(), "--initialized-delay-ms".to_string(), initialized_delay_ms.to_string()],
        BrokerConfig::default(),
    )
}

fn default_request(breakpoints: Vec<BreakpointSpec>, stop_on_entry: bool) -> LaunchRequest {
    LaunchRequest {
        program: "main.py".to_string(),
        cwd: None,
        breakpoints,
        stop_on_entry,
        wait_for_breakpoint: true,
        breakpoint_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn breakpoints_rejected_before_initialized_are_recorded_as_failed_and_then_retried() {
    let orchestrator = Orchestrator::new(
        binary_path(),
        vec![
            "mock-adapter".to_string(),
            "--initialized-delay-ms".to_string(),
            "1500".to_string(),
            "--reject-breakpoints-until-initialized".to_string(),
        ],
        BrokerConfig::default(),
    );
    let request = default_request(
        vec![BreakpointSpec { source_path: "main.py".to_string(), lines: vec![5] }],
        false,
    );

    let outcome = orchestrator.launch(request, PathBuf::from(".")).await.expect("launch");

    let audit = outcome.breakpoint_audit.get("main.py").expect("audit entry for main.py");
    let initial = audit.initial.as_ref().expect("initial attempt should have been recorded");
    assert_eq!(initial.get("error").and_then(|e| e.as_str()), Some("adapter rejected request: Server is not available"));
    assert!(audit.post_init_retry.is_some() || audit.post_stop_retry.is_some(), "a retry should have verified the breakpoint");

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn late_initialized_still_verifies_breakpoints_on_retry() {
    let orchestrator = mock_orchestrator(300);
    let request = default_request(
        vec![BreakpointSpec { source_path: "main.py".to_string(), lines: vec![5] }],
        false,
    );

    let outcome = orchestrator.launch(request, PathBuf::from(".")).await.expect("launch");

    let audit = outcome.breakpoint_audit.get("main.py").expect("audit entry for main.py");
    assert!(audit.initial.is_some(), "initial attempt should have been recorded");
    assert!(audit.post_init_retry.is_some() || audit.post_stop_retry.is_some(), "a retry should have verified the breakpoint");

    let stopped = outcome.stopped_event.expect("should have stopped");
    assert_eq!(stopped.get("body").and_then(|b| b.get("reason")).and_then(|r| r.as_str()), Some("breakpoint"));

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn module_not_loaded_until_stop_registers_breakpoints_on_post_stop_retry() {
    let orchestrator = mock_orchestrator(0);
    let request = default_request(
        vec![
            BreakpointSpec { source_path: "main.py".to_string(), lines: vec![5] },
            BreakpointSpec { source_path: "helpers.py".to_string(), lines: vec![10, 5] },
        ],
        true,
    );

    let outcome = orchestrator.launch(request, PathBuf::from(".")).await.expect("launch");

    let helpers_audit = outcome.breakpoint_audit.get("helpers.py").expect("audit entry for helpers.py");
    assert!(helpers_audit.post_stop_retry.is_some(), "helpers.py should only verify after the first stop");

    let breakpoints = orchestrator.list_breakpoints().await.expect("list breakpoints");
    assert!(breakpoints.contains_key("helpers.py"));
    assert!(breakpoints.contains_key("main.py"));

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn thread_selection_prefers_explicit_then_last_stopped_and_rejects_unknown() {
    let orchestrator = mock_orchestrator(0);
    let request = default_request(vec![], false);
    orchestrator.launch(request, PathBuf::from(".")).await.expect("launch");

    orchestrator.step_over().await.expect("step over with no explicit thread should select a default");

    let err = orchestrator.continue_(Some(99)).await.expect_err("thread 99 is not in the mock's thread list");
    assert!(err.to_string().contains("selected thread not present"));

    orchestrator.continue_(Some(1)).await.expect("thread 1 is in the mock's thread list");

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn locals_reports_variables_for_the_selected_thread() {
    let orchestrator = mock_orchestrator(0);
    let request = default_request(
        vec![BreakpointSpec { source_path: "main.py".to_string(), lines: vec![5] }],
        true,
    );
    orchestrator.launch(request, PathBuf::from(".")).await.expect("launch");

    let locals = orchestrator.locals().await.expect("locals");
    let variables = locals.get("variables").and_then(|v| v.as_array()).expect("variables array");
    let names: Vec<&str> = variables.iter().filter_map(|v| v.get("name").and_then(|n| n.as_str())).collect();
    assert!(names.contains(&"x"));
    assert!(names.contains(&"y"));

    let last_stopped = orchestrator.last_stopped_event().await.expect("last stopped");
    let last_stopped_thread = last_stopped.and_then(|e| e.get("body").and_then(|b| b.get("threadId").and_then(|t| t.as_i64())));
    assert_eq!(locals.get("selectedThreadId").and_then(|t| t.as_i64()), last_stopped_thread);

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let orchestrator = mock_orchestrator(0);
    let request = default_request(vec![], false);
    orchestrator.launch(request, PathBuf::from(".")).await.expect("launch");

    let first = orchestrator.shutdown().await.expect("first shutdown");
    assert!(first, "first shutdown should have torn down a live session");

    let second = orchestrator.shutdown().await.expect("second shutdown");
    assert!(!second, "second shutdown should be a no-op");
}
