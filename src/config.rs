//! Broker configuration.
//!
//! Configuration values are resolved in order of decreasing priority:
//!
//! 1. **Environment variables** — `DAP_BROKER_REQUEST_TIMEOUT`,
//!    `DAP_BROKER_EVENT_TIMEOUT`, `DAP_BROKER_ENDPOINT_POLL_INTERVAL`,
//!    `DAP_BROKER_ENDPOINT_TIMEOUT`, `DAP_BROKER_SHUTDOWN_GRACE`,
//!    `DAP_BROKER_REPO_ROOT`, `DAP_BROKER_ADAPTER_COMMAND`,
//!    `DAP_BROKER_RUNTIME`, `DAP_BROKER_EVENT_QUEUE_CAPACITY`,
//!    `DAP_BROKER_CONFIG`.
//! 2. **Config file** — a simple `KEY = VALUE` file (one per line, `#`
//!    comments). The default location is `~/.dap-broker/broker.conf`,
//!    overridable via `DAP_BROKER_CONFIG`.
//! 3. **Built-in defaults**.
//!
//! The config file format is intentionally kept simple so that we do
//! not need a YAML or TOML parsing dependency.
//!
//! Example config file:
//! ```text
//! # Seconds to wait for an adapter response before giving up.
//! request_timeout = 10
//!
//! # Maximum events buffered before the oldest is dropped.
//! event_queue_capacity = 1024
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Environment variable names
// ---------------------------------------------------------------------------

const ENV_REQUEST_TIMEOUT: &str = "DAP_BROKER_REQUEST_TIMEOUT";
const ENV_EVENT_TIMEOUT: &str = "DAP_BROKER_EVENT_TIMEOUT";
const ENV_ENDPOINT_POLL_INTERVAL: &str = "DAP_BROKER_ENDPOINT_POLL_INTERVAL";
const ENV_ENDPOINT_TIMEOUT: &str = "DAP_BROKER_ENDPOINT_TIMEOUT";
const ENV_SHUTDOWN_GRACE: &str = "DAP_BROKER_SHUTDOWN_GRACE";
const ENV_REPO_ROOT: &str = "DAP_BROKER_REPO_ROOT";
const ENV_ADAPTER_COMMAND: &str = "DAP_BROKER_ADAPTER_COMMAND";
const ENV_RUNTIME: &str = "DAP_BROKER_RUNTIME";
const ENV_EVENT_QUEUE_CAPACITY: &str = "DAP_BROKER_EVENT_QUEUE_CAPACITY";
const ENV_CONFIG: &str = "DAP_BROKER_CONFIG";

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_EVENT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_ENDPOINT_POLL_INTERVAL_MS: u64 = 50;
const DEFAULT_ENDPOINT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 2;
const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// BrokerConfig
// ---------------------------------------------------------------------------

/// Runtime configuration for the broker. Constructed once via
/// [`BrokerConfig::load`] and then threaded through the orchestrator,
/// supervisor, and CLI front-end.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long a single DAP request may take before it is considered failed.
    pub request_timeout: Duration,
    /// Default timeout for `waitForEvent` when the caller does not override it.
    pub event_timeout: Duration,
    /// How often the supervisor polls the rendezvous file for an endpoint.
    pub endpoint_poll_interval: Duration,
    /// How long to wait for the adapter to publish its endpoint before giving up.
    pub endpoint_timeout: Duration,
    /// Grace period between a graceful terminate and a forceful kill.
    pub shutdown_grace: Duration,
    /// Repository root used to resolve repo-relative breakpoint source paths.
    /// Defaults to the current working directory at load time.
    pub repo_root: PathBuf,
    /// Override for the adapter launch command. When `None`, the caller
    /// resolves the runtime executable per 4.B's ordered-candidate rule.
    pub adapter_command: Option<String>,
    /// Override for the language runtime used to spawn the adapter.
    pub runtime: Option<PathBuf>,
    /// Capacity of the transport's bounded event queue.
    pub event_queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            event_timeout: Duration::from_secs(DEFAULT_EVENT_TIMEOUT_SECS),
            endpoint_poll_interval: Duration::from_millis(DEFAULT_ENDPOINT_POLL_INTERVAL_MS),
            endpoint_timeout: Duration::from_secs(DEFAULT_ENDPOINT_TIMEOUT_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            repo_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            adapter_command: None,
            runtime: None,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
        }
    }
}

impl BrokerConfig {
    /// Loads configuration by merging (in priority order) environment
    /// variables, the config file, and built-in defaults.
    ///
    /// Errors are logged but never fatal — a bad value in the config
    /// file simply causes the corresponding field to fall back to its
    /// default.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        let config_path = std::env::var(ENV_CONFIG)
            .map(PathBuf::from)
            .ok()
            .or_else(default_config_path);

        if let Some(path) = config_path
            && path.exists()
        {
            match std::fs::read_to_string(&path) {
                Ok(contents) => {
                    let kv = parse_config_file(&contents);
                    apply_config_map(&mut cfg, &kv);
                }
                Err(e) => {
                    log::warn!("Cannot read config file {}: {e}", path.display());
                }
            }
        }

        apply_env_overrides(&mut cfg);
        cfg
    }
}

fn apply_env_overrides(cfg: &mut BrokerConfig) {
    if let Ok(val) = std::env::var(ENV_REQUEST_TIMEOUT) {
        match val.parse::<u64>() {
            Ok(secs) => cfg.request_timeout = Duration::from_secs(secs),
            Err(e) => log::warn!("{ENV_REQUEST_TIMEOUT} has invalid value '{val}': {e}"),
        }
    }

    if let Ok(val) = std::env::var(ENV_EVENT_TIMEOUT) {
        match val.parse::<u64>() {
            Ok(secs) => cfg.event_timeout = Duration::from_secs(secs),
            Err(e) => log::warn!("{ENV_EVENT_TIMEOUT} has invalid value '{val}': {e}"),
        }
    }

    if let Ok(val) = std::env::var(ENV_ENDPOINT_POLL_INTERVAL) {
        match val.parse::<u64>() {
            Ok(ms) => cfg.endpoint_poll_interval = Duration::from_millis(ms),
            Err(e) => log::warn!("{ENV_ENDPOINT_POLL_INTERVAL} has invalid value '{val}': {e}"),
        }
    }

    if let Ok(val) = std::env::var(ENV_ENDPOINT_TIMEOUT) {
        match val.parse::<u64>() {
            Ok(secs) => cfg.endpoint_timeout = Duration::from_secs(secs),
            Err(e) => log::warn!("{ENV_ENDPOINT_TIMEOUT} has invalid value '{val}': {e}"),
        }
    }

    if let Ok(val) = std::env::var(ENV_SHUTDOWN_GRACE) {
        match val.parse::<u64>() {
            Ok(secs) => cfg.shutdown_grace = Duration::from_secs(secs),
            Err(e) => log::warn!("{ENV_SHUTDOWN_GRACE} has invalid value '{val}': {e}"),
        }
    }

    if let Ok(val) = std::env::var(ENV_REPO_ROOT) {
        cfg.repo_root = PathBuf::from(val);
    }

    if let Ok(val) = std::env::var(ENV_ADAPTER_COMMAND) {
        cfg.adapter_command = Some(val);
    }

    if let Ok(val) = std::env::var(ENV_RUNTIME) {
        cfg.runtime = Some(PathBuf::from(val));
    }

    if let Ok(val) = std::env::var(ENV_EVENT_QUEUE_CAPACITY) {
        match val.parse::<usize>() {
            Ok(0) => log::warn!("{ENV_EVENT_QUEUE_CAPACITY} must be > 0, ignoring"),
            Ok(n) => cfg.event_queue_capacity = n,
            Err(e) => log::warn!("{ENV_EVENT_QUEUE_CAPACITY} has invalid value '{val}': {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Config file parsing helpers
// ---------------------------------------------------------------------------

/// Returns `~/.dap-broker/broker.conf` if `$HOME` is set.
fn default_config_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".dap-broker").join("broker.conf"))
}

/// Parses a simple `KEY = VALUE` config file.
///
/// - Lines starting with `#` (after optional whitespace) are comments.
/// - Empty lines are ignored.
/// - Keys and values are trimmed of surrounding whitespace.
fn parse_config_file(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = trimmed.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

/// Applies key-value pairs from a config file to a `BrokerConfig`.
fn apply_config_map(cfg: &mut BrokerConfig, kv: &HashMap<String, String>) {
    if let Some(val) = kv.get("request_timeout") {
        match val.parse::<u64>() {
            Ok(secs) => cfg.request_timeout = Duration::from_secs(secs),
            Err(e) => log::warn!("config: request_timeout '{val}' is not a valid number: {e}"),
        }
    }

    if let Some(val) = kv.get("event_timeout") {
        match val.parse::<u64>() {
            Ok(secs) => cfg.event_timeout = Duration::from_secs(secs),
            Err(e) => log::warn!("config: event_timeout '{val}' is not a valid number: {e}"),
        }
    }

    if let Some(val) = kv.get("endpoint_poll_interval_ms") {
        match val.parse::<u64>() {
            Ok(ms) => cfg.endpoint_poll_interval = Duration::from_millis(ms),
            Err(e) => log::warn!("config: endpoint_poll_interval_ms '{val}' is not a valid number: {e}"),
        }
    }

    if let Some(val) = kv.get("endpoint_timeout") {
        match val.parse::<u64>() {
            Ok(secs) => cfg.endpoint_timeout = Duration::from_secs(secs),
            Err(e) => log::warn!("config: endpoint_timeout '{val}' is not a valid number: {e}"),
        }
    }

    if let Some(val) = kv.get("shutdown_grace") {
        match val.parse::<u64>() {
            Ok(secs) => cfg.shutdown_grace = Duration::from_secs(secs),
            Err(e) => log::warn!("config: shutdown_grace '{val}' is not a valid number: {e}"),
        }
    }

    if let Some(val) = kv.get("repo_root") {
        cfg.repo_root = PathBuf::from(val);
    }

    if let Some(val) = kv.get("adapter_command") {
        cfg.adapter_command = Some(val.clone());
    }

    if let Some(val) = kv.get("runtime") {
        cfg.runtime = Some(PathBuf::from(val));
    }

    if let Some(val) = kv.get("event_queue_capacity") {
        match val.parse::<usize>() {
            Ok(0) => log::warn!("config: event_queue_capacity must be > 0"),
            Ok(n) => cfg.event_queue_capacity = n,
            Err(e) => log::warn!("config: event_queue_capacity '{val}' is not a valid number: {e}"),
        }
    }
}

/// Resolves the language runtime used to spawn the adapter, following the
/// ordered fallback from 6.4: a virtual-env runtime under the repo root,
/// then the runtime pointed to by the ambient virtual-env variable, then
/// `python3` verbatim if nothing on disk matched (fails lazily at spawn
/// time rather than here).
pub fn resolve_runtime(cfg: &BrokerConfig) -> PathBuf {
    if let Some(runtime) = &cfg.runtime {
        return runtime.clone();
    }

    for venv_dir in [".venv", "venv", "env"] {
        let candidate = cfg.repo_root.join(venv_dir).join("bin").join("python");
        if candidate.exists() {
            return candidate;
        }
    }

    if let Ok(virtual_env) = std::env::var("VIRTUAL_ENV") {
        let candidate = PathBuf::from(virtual_env).join("bin").join("python");
        if candidate.exists() {
            return candidate;
        }
    }

    // Nothing on disk matched; fail lazily at spawn time rather than here.
    PathBuf::from("python3")
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.request_timeout, Duration::from_secs(10));
        assert_eq!(cfg.event_timeout, Duration::from_secs(30));
        assert_eq!(cfg.event_queue_capacity, 1024);
        assert!(cfg.adapter_command.is_none());
        assert!(cfg.runtime.is_none());
    }

    #[test]
    fn test_parse_config_file_basic() {
        let contents = r#"
# Comment line
request_timeout = 20
event_queue_capacity = 512

# Another comment
adapter_command = /usr/bin/debugpy-adapter
"#;
        let kv = parse_config_file(contents);
        assert_eq!(kv.get("request_timeout").unwrap(), "20");
        assert_eq!(kv.get("event_queue_capacity").unwrap(), "512");
        assert_eq!(kv.get("adapter_command").unwrap(), "/usr/bin/debugpy-adapter");
    }

    #[test]
    fn test_parse_config_file_empty() {
        let kv = parse_config_file("");
        assert!(kv.is_empty());
    }

    #[test]
    fn test_parse_config_file_comments_only() {
        let contents = "# just a comment\n  # indented comment\n";
        let kv = parse_config_file(contents);
        assert!(kv.is_empty());
    }

    #[test]
    fn test_apply_config_map() {
        let mut cfg = BrokerConfig::default();
        let mut kv = HashMap::new();
        kv.insert("request_timeout".to_string(), "60".to_string());
        kv.insert("event_queue_capacity".to_string(), "128".to_string());

        apply_config_map(&mut cfg, &kv);

        assert_eq!(cfg.request_timeout, Duration::from_secs(60));
        assert_eq!(cfg.event_queue_capacity, 128);
    }

    #[test]
    fn test_apply_config_map_invalid_timeout_ignored() {
        let mut cfg = BrokerConfig::default();
        let mut kv = HashMap::new();
        kv.insert("request_timeout".to_string(), "not_a_number".to_string());

        apply_config_map(&mut cfg, &kv);

        assert_eq!(cfg.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_apply_config_map_zero_queue_capacity_ignored() {
        let mut cfg = BrokerConfig::default();
        let mut kv = HashMap::new();
        kv.insert("event_queue_capacity".to_string(), "0".to_string());

        apply_config_map(&mut cfg, &kv);

        assert_eq!(cfg.event_queue_capacity, 1024);
    }

    #[test]
    fn test_resolve_runtime_falls_back_to_python3() {
        let mut cfg = BrokerConfig::default();
        cfg.repo_root = PathBuf::from("/nonexistent-repo-root-for-test");
        std::env::remove_var("VIRTUAL_ENV");
        assert_eq!(resolve_runtime(&cfg), PathBuf::from("python3"));
    }

    #[test]
    fn test_resolve_runtime_honors_explicit_override() {
        let mut cfg = BrokerConfig::default();
        cfg.runtime = Some(PathBuf::from("/usr/bin/python3.11"));
        assert_eq!(resolve_runtime(&cfg), PathBuf::from("/usr/bin/python3.11"));
    }
}
