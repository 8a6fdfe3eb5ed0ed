//! CLI front-end for the DAP broker.
//!
//! A single-process, single-session command surface: `launch` starts
//! an adapter and runs the startup handshake; every other subcommand
//! operates on the same in-process orchestrator, so `launch` and its
//! follow-on commands are meant to be driven together by the embedding
//! caller (a test harness, a script, or the library directly) rather
//! than across separate invocations of this binary — this crate does
//! not persist a session across process exits.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::info;

use dap_broker::config::BrokerConfig;
use dap_broker::orchestrator::{BreakpointSpec, LaunchRequest, Orchestrator};
use dap_broker::resolver;

#[derive(Parser)]
#[command(name = "dap-broker", about = "A programmatic debugging broker over the Debug Adapter Protocol")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn the adapter and run the full startup handshake.
    Launch {
        program: String,
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// `path:line` pairs, may be repeated.
        #[arg(long = "breakpoint")]
        breakpoints: Vec<String>,
        #[arg(long)]
        stop_on_entry: bool,
        #[arg(long, default_value_t = 30)]
        wait_timeout: u64,
    },
    /// Register breakpoints on an existing session.
    SetBreakpoints {
        source: String,
        lines: Vec<i64>,
    },
    /// Print the current breakpoint registry.
    ListBreakpoints,
    /// Step operations sharing one thread-selection policy.
    Step {
        #[command(subcommand)]
        kind: StepKind,
    },
    /// Resume execution.
    Continue {
        #[arg(long)]
        thread: Option<i64>,
    },
    /// Print locals for the preferred frame of the selected thread.
    Locals,
    /// Block until a named event arrives or the timeout elapses. Defaults
    /// to the configured `event_timeout` when `--timeout` is omitted.
    WaitForEvent {
        name: String,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Print the cached last `stopped` event, if any.
    LastStopped,
    /// Tear down the session. Idempotent.
    Shutdown,
    /// Advisory check of whether a line is a sound place for a breakpoint.
    ValidateBreakpointLine {
        source: PathBuf,
        line: usize,
    },
    /// Run a scripted fake DAP adapter for testing and manual exploration.
    #[command(hide = true)]
    MockAdapter {
        #[arg(long, default_value_t = 0)]
        initialized_delay_ms: u64,
        #[arg(long)]
        reject_breakpoints_until_initialized: bool,
    },
}

#[derive(Subcommand)]
enum StepKind {
    Over,
    In,
    Out,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = BrokerConfig::load();
    init_logging(&config);

    if let Commands::MockAdapter { initialized_delay_ms, reject_breakpoints_until_initialized } = &cli.command {
        return dap_broker::mock_adapter::run(*initialized_delay_ms, *reject_breakpoints_until_initialized).await;
    }

    // An explicit `adapter_command` override is taken verbatim (the caller
    // owns the full invocation); otherwise resolve a Python runtime and
    // launch `debugpy.adapter` the way the original implementation does.
    let (adapter_command, adapter_args) = match &config.adapter_command {
        Some(command) => (command.clone(), Vec::new()),
        None => {
            let runtime = dap_broker::config::resolve_runtime(&config);
            (
                runtime.display().to_string(),
                vec!["-m".to_string(), "debugpy.adapter".to_string(), "--host".to_string(), "127.0.0.1".to_string(), "--port".to_string(), "0".to_string()],
            )
        }
    };
    let orchestrator = Orchestrator::new(adapter_command, adapter_args, config.clone());

    match cli.command {
        Commands::Launch { program, cwd, breakpoints, stop_on_entry, wait_timeout } => {
            let parsed_breakpoints = parse_breakpoint_specs(&breakpoints);
            let request = LaunchRequest {
                program,
                cwd,
                breakpoints: parsed_breakpoints,
                stop_on_entry,
                wait_for_breakpoint: true,
                breakpoint_timeout: Duration::from_secs(wait_timeout),
            };
            let outcome = orchestrator.launch(request, config.repo_root.clone()).await?;
            println!("{}", serde_json::json!({
                "capabilities": outcome.capabilities,
                "stoppedEvent": outcome.stopped_event,
                "breakpointAudit": outcome.breakpoint_audit.iter().map(|(k, v)| (k.clone(), serde_json::json!({
                    "initial": v.initial,
                    "postInitRetry": v.post_init_retry,
                    "postStopRetry": v.post_stop_retry,
                }))).collect::<std::collections::HashMap<_, _>>(),
            }));
        }
        Commands::SetBreakpoints { source, lines } => {
            let breakpoints = orchestrator.set_breakpoints(&source, lines).await?;
            println!("{}", serde_json::json!({"breakpoints": breakpoints}));
        }
        Commands::ListBreakpoints => {
            let audit = orchestrator.list_breakpoints().await?;
            println!("{}", serde_json::to_string(&audit.keys().collect::<Vec<_>>())?);
        }
        Commands::Step { kind } => {
            match kind {
                StepKind::Over => orchestrator.step_over().await?,
                StepKind::In => orchestrator.step_in().await?,
                StepKind::Out => orchestrator.step_out().await?,
            }
            println!("ok");
        }
        Commands::Continue { thread } => {
            orchestrator.continue_(thread).await?;
            println!("ok");
        }
        Commands::Locals => {
            let locals = orchestrator.locals().await?;
            println!("{locals}");
        }
        Commands::WaitForEvent { name, timeout } => {
            let timeout = timeout.map(Duration::from_secs).unwrap_or_else(|| orchestrator.default_event_timeout());
            let event = orchestrator.wait_for_event(&name, timeout).await?;
            println!("{}", serde_json::json!({"event": event}));
        }
        Commands::LastStopped => {
            let event = orchestrator.last_stopped_event().await?;
            println!("{}", serde_json::json!({"event": event}));
        }
        Commands::Shutdown => {
            let did_something = orchestrator.shutdown().await?;
            println!("{}", if did_something { "shut down" } else { "no-session" });
        }
        Commands::ValidateBreakpointLine { source, line } => {
            let result = resolver::validate_breakpoint_line(&source, line)?;
            println!("{}", serde_json::json!({
                "line": result.line,
                "content": result.content,
                "isValid": result.is_valid,
                "warnings": result.warnings,
                "suggestions": result.suggestions,
            }));
        }
        Commands::MockAdapter { .. } => unreachable!("handled above"),
    }

    info!("command completed");
    Ok(())
}

fn parse_breakpoint_specs(specs: &[String]) -> Vec<BreakpointSpec> {
    let mut by_source: std::collections::HashMap<String, Vec<i64>> = std::collections::HashMap::new();
    for spec in specs {
        if let Some((path, line)) = spec.rsplit_once(':')
            && let Ok(line) = line.parse::<i64>()
        {
            by_source.entry(path.to_string()).or_default().push(line);
        }
    }
    by_source
        .into_iter()
        .map(|(source_path, lines)| BreakpointSpec { source_path, lines })
        .collect()
}

/// Configures logging per 6.4: `DAP_BROKER_LOG=0` disables logging
/// entirely; otherwise it names an append-only log file, defaulting to
/// one under the repo root.
fn init_logging(config: &BrokerConfig) {
    if std::env::var("DAP_BROKER_LOG").as_deref() == Ok("0") {
        return;
    }

    let log_path = std::env::var("DAP_BROKER_LOG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| config.repo_root.join(".dap-broker").join("broker.log"));

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let dir = log_path.parent().unwrap_or_else(|| std::path::Path::new(".")).to_path_buf();
    let basename = log_path
        .file_stem()
        .unwrap_or_else(|| std::ffi::OsStr::new("broker"))
        .to_string_lossy()
        .to_string();

    match flexi_logger::Logger::try_with_str("info") {
        Ok(logger) => match logger
            .log_to_file(flexi_logger::FileSpec::default().directory(dir).basename(basename))
            .start()
        {
            Ok(handle) => {
                // The broker runs for the process lifetime, so the handle
                // is leaked intentionally rather than threaded through main.
                std::mem::forget(handle);
                return;
            }
            Err(e) => eprintln!("Warning: could not start file logging: {e}"),
        },
        Err(e) => eprintln!("Warning: could not configure logger: {e}"),
    }

    flexi_logger::init();
}
