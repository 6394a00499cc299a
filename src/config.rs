//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — every knob has an `EXECD_*` override, see
//!    [`Config::apply_env`]
//! 2. **Config file** — path via `--config <path>`, or `execd.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8003"
//! max_sessions = 100
//! session_idle_timeout_secs = 300
//! max_frame_bytes = 10485760   # 10 MiB
//! heartbeat_secs = 20
//! idle_close_secs = 30
//!
//! [stream]
//! line_cap_bytes = 8192        # 8 KiB
//! output_cap_bytes = 8388608   # 8 MiB
//! drain_grace_ms = 2000
//!
//! [exec]
//! shell = "/bin/sh"
//! work_root = "/tmp/execd"
//! kill_grace_secs = 10
//! # allowlist = ["^cargo ", "^git "]   # omit to allow everything
//!
//! [timeout]
//! default_secs = 300
//! min_secs = 60
//! max_secs = 3600
//! # history_path = "/var/lib/execd/history.toml"
//!
//! [detector]
//! success = ['===\s*RESULT:::OK\s*===']
//! failure = ['===\s*RESULT:::FAIL\s*===']
//!
//! # Optional — omit entirely to disable hooks
//! [hooks]
//! pre_execute = "/usr/local/bin/pre-hook"
//! post_execute = "/usr/local/bin/post-hook"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Optional hook commands. Omit the whole table to disable hooks.
    pub hooks: Option<HookConfig>,
}

/// Listener and per-connection protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8003`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent WebSocket sessions (default 100).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Maximum concurrent TCP connections accepted by the listener (default 256).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds a session may sit idle (no requests, nothing running) before
    /// the reaper destroys it (default 300).
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u64,
    /// Maximum WebSocket message size in bytes, both directions (default 10 MiB).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Seconds between WebSocket pings (default 20).
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Seconds without a pong before the connection is closed (default 30).
    #[serde(default = "default_idle_close_secs")]
    pub idle_close_secs: u64,
}

/// Output streaming caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Maximum bytes per emitted line before it is split into truncated
    /// fragments (default 8 KiB).
    #[serde(default = "default_line_cap_bytes")]
    pub line_cap_bytes: usize,
    /// Maximum bytes of output accumulated per session for partial-result
    /// assembly (default 8 MiB). Streaming continues past the cap with
    /// `truncated` markers.
    #[serde(default = "default_output_cap_bytes")]
    pub output_cap_bytes: usize,
    /// Milliseconds to keep draining streams after a cancellation before the
    /// result is assembled (default 2000).
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

/// Child-process spawning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Shell binary commands are passed to via `-c` (default `/bin/sh`).
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Working root for executions. Artifact paths reported by the child must
    /// resolve inside it (default `/tmp/execd`).
    #[serde(default = "default_work_root")]
    pub work_root: String,
    /// Directory partial-result artifacts are written to. Defaults to
    /// `<work_root>/results` when empty.
    #[serde(default)]
    pub results_dir: String,
    /// Seconds between SIGTERM and SIGKILL on cancel (default 10).
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    /// Optional regex allow-list. When non-empty, commands matching none of
    /// the patterns are rejected.
    #[serde(default)]
    pub allowlist: Vec<String>,
}

/// Timeout estimation constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Base seconds used when the caller gives no override (default 300).
    #[serde(default = "default_timeout_default_secs")]
    pub default_secs: u64,
    /// Floor for every computed timeout (default 60).
    #[serde(default = "default_timeout_min_secs")]
    pub min_secs: u64,
    /// Ceiling for every computed timeout (default 3600).
    #[serde(default = "default_timeout_max_secs")]
    pub max_secs: u64,
    /// Seconds added per 1000 expected output tokens (default 30).
    #[serde(default = "default_secs_per_kilotoken")]
    pub secs_per_kilotoken: u64,
    /// CPU usage percentage above which timeouts are widened (default 80).
    #[serde(default = "default_load_threshold_pct")]
    pub load_threshold_pct: f32,
    /// Multiplier applied when the load threshold is exceeded (default 1.5).
    #[serde(default = "default_load_factor")]
    pub load_factor: f64,
    /// Path to the TOML duration-history store. Empty disables history.
    #[serde(default)]
    pub history_path: String,
    /// Number of recent durations kept per task fingerprint (default 20).
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

/// Completion-marker and artifact-pattern regexes, compiled once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Regexes whose match means the useful work succeeded.
    #[serde(default = "default_success_markers")]
    pub success: Vec<String>,
    /// Regexes whose match means the work failed (advisory only).
    #[serde(default = "default_failure_markers")]
    pub failure: Vec<String>,
    /// Regexes with one capture group recognizing "file created at <path>"
    /// notices.
    #[serde(default = "default_artifact_patterns")]
    pub artifacts: Vec<String>,
}

/// Auxiliary hook commands run at lifecycle points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    /// Command run before each spawn.
    pub pre_execute: Option<String>,
    /// Command run after each `process.completed`.
    pub post_execute: Option<String>,
    /// Command run when an execution fails to spawn or times out.
    pub on_error: Option<String>,
    /// Seconds a hook may run before it is killed (default 30).
    #[serde(default = "default_hook_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum hooks running at once across all sessions (default 4).
    #[serde(default = "default_max_concurrent_hooks")]
    pub max_concurrent: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8003".to_string()
}
fn default_max_sessions() -> usize {
    100
}
fn default_max_connections() -> usize {
    256
}
fn default_session_idle_timeout() -> u64 {
    300
}
fn default_max_frame_bytes() -> usize {
    10 * 1024 * 1024 // 10 MiB
}
fn default_heartbeat_secs() -> u64 {
    20
}
fn default_idle_close_secs() -> u64 {
    30
}
fn default_line_cap_bytes() -> usize {
    8 * 1024 // 8 KiB
}
fn default_output_cap_bytes() -> usize {
    8 * 1024 * 1024 // 8 MiB
}
fn default_drain_grace_ms() -> u64 {
    2000
}
fn default_shell() -> String {
    "/bin/sh".to_string()
}
fn default_work_root() -> String {
    "/tmp/execd".to_string()
}
fn default_kill_grace_secs() -> u64 {
    10
}
fn default_timeout_default_secs() -> u64 {
    300
}
fn default_timeout_min_secs() -> u64 {
    60
}
fn default_timeout_max_secs() -> u64 {
    3600
}
fn default_secs_per_kilotoken() -> u64 {
    30
}
fn default_load_threshold_pct() -> f32 {
    80.0
}
fn default_load_factor() -> f64 {
    1.5
}
fn default_history_window() -> usize {
    20
}
fn default_success_markers() -> Vec<String> {
    vec![
        r"===\s*RESULT:::OK\s*===".to_string(),
        r"\bTASK_COMPLETE\b".to_string(),
    ]
}
fn default_failure_markers() -> Vec<String> {
    vec![
        r"===\s*RESULT:::FAIL\s*===".to_string(),
        r"\bTASK_FAILED\b".to_string(),
    ]
}
fn default_artifact_patterns() -> Vec<String> {
    vec![
        r"(?i)\bfile (?:created|written|saved)(?: at| to)?:?\s+(\S+)".to_string(),
        r"(?i)\boutput written to\s+(\S+)".to_string(),
    ]
}
fn default_hook_timeout_secs() -> u64 {
    30
}
fn default_max_concurrent_hooks() -> usize {
    4
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_sessions: default_max_sessions(),
            max_connections: default_max_connections(),
            session_idle_timeout_secs: default_session_idle_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
            heartbeat_secs: default_heartbeat_secs(),
            idle_close_secs: default_idle_close_secs(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            line_cap_bytes: default_line_cap_bytes(),
            output_cap_bytes: default_output_cap_bytes(),
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            work_root: default_work_root(),
            results_dir: String::new(),
            kill_grace_secs: default_kill_grace_secs(),
            allowlist: Vec::new(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_secs: default_timeout_default_secs(),
            min_secs: default_timeout_min_secs(),
            max_secs: default_timeout_max_secs(),
            secs_per_kilotoken: default_secs_per_kilotoken(),
            load_threshold_pct: default_load_threshold_pct(),
            load_factor: default_load_factor(),
            history_path: String::new(),
            history_window: default_history_window(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            success: default_success_markers(),
            failure: default_failure_markers(),
            artifacts: default_artifact_patterns(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .map_err(|e| format!("Failed to read config file {p}: {e}"))?;
            toml::from_str(&content).map_err(|e| format!("Failed to parse config file {p}: {e}"))?
        } else if Path::new("execd.toml").exists() {
            let content = std::fs::read_to_string("execd.toml")
                .map_err(|e| format!("Failed to read execd.toml: {e}"))?;
            toml::from_str(&content).map_err(|e| format!("Failed to parse execd.toml: {e}"))?
        } else {
            Config {
                server: ServerConfig::default(),
                stream: StreamConfig::default(),
                exec: ExecConfig::default(),
                timeout: TimeoutConfig::default(),
                detector: DetectorConfig::default(),
                logging: LoggingConfig::default(),
                hooks: None,
            }
        };

        config.apply_env()?;

        if config.exec.results_dir.is_empty() {
            config.exec.results_dir = format!("{}/results", config.exec.work_root);
        }

        Ok(config)
    }

    /// Apply `EXECD_*` environment-variable overrides.
    fn apply_env(&mut self) -> Result<(), String> {
        fn parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, String>
        where
            T::Err: std::fmt::Display,
        {
            match std::env::var(name) {
                Ok(raw) => raw
                    .parse::<T>()
                    .map(Some)
                    .map_err(|e| format!("Invalid {name}={raw}: {e}")),
                Err(_) => Ok(None),
            }
        }

        if let Ok(listen) = std::env::var("EXECD_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(v) = parse("EXECD_MAX_SESSIONS")? {
            self.server.max_sessions = v;
        }
        if let Some(v) = parse("EXECD_SESSION_IDLE_TIMEOUT_SECS")? {
            self.server.session_idle_timeout_secs = v;
        }
        if let Some(v) = parse("EXECD_MAX_FRAME_BYTES")? {
            self.server.max_frame_bytes = v;
        }
        if let Some(v) = parse("EXECD_HEARTBEAT_SECS")? {
            self.server.heartbeat_secs = v;
        }
        if let Some(v) = parse("EXECD_IDLE_CLOSE_SECS")? {
            self.server.idle_close_secs = v;
        }
        if let Some(v) = parse("EXECD_LINE_CAP_BYTES")? {
            self.stream.line_cap_bytes = v;
        }
        if let Some(v) = parse("EXECD_OUTPUT_CAP_BYTES")? {
            self.stream.output_cap_bytes = v;
        }
        if let Some(v) = parse("EXECD_DRAIN_GRACE_MS")? {
            self.stream.drain_grace_ms = v;
        }
        if let Ok(shell) = std::env::var("EXECD_SHELL") {
            self.exec.shell = shell;
        }
        if let Ok(root) = std::env::var("EXECD_WORK_ROOT") {
            self.exec.work_root = root;
        }
        if let Ok(dir) = std::env::var("EXECD_RESULTS_DIR") {
            self.exec.results_dir = dir;
        }
        if let Some(v) = parse("EXECD_KILL_GRACE_SECS")? {
            self.exec.kill_grace_secs = v;
        }
        if let Some(v) = parse("EXECD_DEFAULT_TIMEOUT_SECS")? {
            self.timeout.default_secs = v;
        }
        if let Some(v) = parse("EXECD_MIN_TIMEOUT_SECS")? {
            self.timeout.min_secs = v;
        }
        if let Some(v) = parse("EXECD_MAX_TIMEOUT_SECS")? {
            self.timeout.max_secs = v;
        }
        if let Ok(path) = std::env::var("EXECD_HISTORY_PATH") {
            self.timeout.history_path = path;
        }
        if let Some(v) = parse("EXECD_MAX_CONCURRENT_HOOKS")? {
            if let Some(ref mut hooks) = self.hooks {
                hooks.max_concurrent = v;
            }
        }
        if let Ok(level) = std::env::var("EXECD_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Validate cross-field constraints. Returns all violations, not just the
    /// first, so operators can fix a config file in one pass.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.server.max_sessions == 0 {
            errors.push("server.max_sessions must be at least 1".to_string());
        }
        if self.server.max_frame_bytes < 1024 {
            errors.push("server.max_frame_bytes must be at least 1024".to_string());
        }
        if self.server.heartbeat_secs == 0 {
            errors.push("server.heartbeat_secs must be at least 1".to_string());
        }
        if self.stream.line_cap_bytes == 0 {
            errors.push("stream.line_cap_bytes must be at least 1".to_string());
        }
        if self.stream.output_cap_bytes < self.stream.line_cap_bytes {
            errors.push("stream.output_cap_bytes must be >= stream.line_cap_bytes".to_string());
        }
        if self.timeout.min_secs > self.timeout.max_secs {
            errors.push("timeout.min_secs must be <= timeout.max_secs".to_string());
        }
        if self.timeout.default_secs < self.timeout.min_secs
            || self.timeout.default_secs > self.timeout.max_secs
        {
            errors.push("timeout.default_secs must lie within [min_secs, max_secs]".to_string());
        }
        if self.timeout.load_factor < 1.0 {
            errors.push("timeout.load_factor must be >= 1.0".to_string());
        }
        if !Path::new(&self.exec.shell).exists() {
            errors.push(format!("exec.shell {} does not exist", self.exec.shell));
        }
        for pattern in self
            .detector
            .success
            .iter()
            .chain(&self.detector.failure)
            .chain(&self.detector.artifacts)
            .chain(&self.exec.allowlist)
        {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(format!("invalid regex {pattern:?}: {e}"));
            }
        }
        if let Some(ref hooks) = self.hooks {
            if hooks.max_concurrent == 0 {
                errors.push("hooks.max_concurrent must be at least 1".to_string());
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        toml::from_str("").unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        assert!(base_config().validate().is_empty());
    }

    #[test]
    fn toml_overrides_and_defaults_coexist() {
        let toml_src = r#"
            [server]
            listen = "127.0.0.1:9000"
            max_sessions = 2

            [stream]
            line_cap_bytes = 4096

            [timeout]
            min_secs = 10
            default_secs = 20
            max_secs = 30

            [hooks]
            pre_execute = "/bin/true"
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.max_sessions, 2);
        assert_eq!(config.stream.line_cap_bytes, 4096);
        assert_eq!(config.timeout.min_secs, 10);
        let hooks = config.hooks.unwrap();
        assert_eq!(hooks.pre_execute.as_deref(), Some("/bin/true"));
        assert_eq!(hooks.max_concurrent, 4);
        assert_eq!(config.stream.output_cap_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn validate_rejects_inverted_timeouts() {
        let mut config = base_config();
        config.timeout.min_secs = 100;
        config.timeout.max_secs = 50;
        config.timeout.default_secs = 75;
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("min_secs")));
    }

    #[test]
    fn validate_rejects_bad_marker_regex() {
        let mut config = base_config();
        config.detector.success.push("([unclosed".to_string());
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("invalid regex")));
    }

    #[test]
    fn validate_rejects_zero_sessions() {
        let mut config = base_config();
        config.server.max_sessions = 0;
        assert!(!config.validate().is_empty());
    }
}
