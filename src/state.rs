//! Shared application state passed to every handler via Axum's `State`
//! extractor.
//!
//! Built once at startup by [`AppState::from_config`] — the root composition
//! point. Everything with server lifetime lives here as an explicit
//! dependency; there are no ambient singletons.

use std::sync::Arc;
use std::time::Instant;

use regex::Regex;

use crate::config::Config;
use crate::detect::CompletionDetector;
use crate::hooks::HookBridge;
use crate::sessions::SessionManager;
use crate::timeout::TimeoutEstimator;

/// Shared application state for the execd server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Pool of WebSocket sessions.
    pub session_manager: SessionManager,
    /// Completion-marker and artifact matchers, compiled once.
    pub detector: Arc<CompletionDetector>,
    /// Timeout estimation (heuristic + history + load probe).
    pub estimator: Arc<TimeoutEstimator>,
    /// Lifecycle hook runner.
    pub hooks: Arc<HookBridge>,
    /// Compiled command allow-list; empty means everything is allowed.
    pub allowlist: Arc<Vec<Regex>>,
}

impl AppState {
    /// Compose the server from validated configuration.
    pub fn from_config(config: Config) -> Result<Self, String> {
        let detector = CompletionDetector::compile(&config.detector)?;
        let estimator = TimeoutEstimator::new(config.timeout.clone());
        let hooks = HookBridge::new(config.hooks.clone(), config.exec.shell.clone());
        let allowlist: Vec<Regex> = config
            .exec
            .allowlist
            .iter()
            .map(|p| Regex::new(p).map_err(|e| format!("invalid allowlist regex {p:?}: {e}")))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            session_manager: SessionManager::new(config.server.max_sessions),
            config: Arc::new(config),
            start_time: Instant::now(),
            detector: Arc::new(detector),
            estimator: Arc::new(estimator),
            hooks: Arc::new(hooks),
            allowlist: Arc::new(allowlist),
        })
    }

    /// Whether a command passes the allow-list (vacuously true when none is
    /// configured).
    pub fn command_allowed(&self, command: &str) -> bool {
        self.allowlist.is_empty() || self.allowlist.iter().any(|re| re.is_match(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowlist_allows_everything() {
        let config: Config = toml::from_str("").unwrap();
        let state = AppState::from_config(config).unwrap();
        assert!(state.command_allowed("rm -rf /tmp/x"));
    }

    #[test]
    fn allowlist_filters_commands() {
        let mut config: Config = toml::from_str("").unwrap();
        config.exec.allowlist = vec!["^cargo ".to_string(), "^git ".to_string()];
        let state = AppState::from_config(config).unwrap();
        assert!(state.command_allowed("cargo build"));
        assert!(state.command_allowed("git status"));
        assert!(!state.command_allowed("curl evil.example"));
    }
}
