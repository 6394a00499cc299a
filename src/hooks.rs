//! Auxiliary hook commands run at execution lifecycle points.
//!
//! Hooks are declared in the `[hooks]` config table and invoked at
//! `pre-execute`, `post-execute`, and `on-error`. They run in spawned tasks,
//! never on a core path: a slow or broken hook cannot stall streaming, and a
//! failing hook surfaces as a warning on the Execution Result rather than an
//! error. Construction is cheap — nothing runs until the first fire — so a
//! misconfigured hook cannot take the server down at startup.
//!
//! Hook stdout/stderr is logged, not streamed to the client. The hook
//! receives its context through `EXECD_HOOK_PHASE`, `EXECD_SESSION_ID`, and
//! `EXECD_COMMAND` environment variables.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::config::HookConfig;

/// Lifecycle point a hook fires at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    PreExecute,
    PostExecute,
    OnError,
}

impl HookPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreExecute => "pre-execute",
            Self::PostExecute => "post-execute",
            Self::OnError => "on-error",
        }
    }

    /// Parse the wire form used by the `hook` method (`"pre"` / `"post"` /
    /// `"error"`).
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "pre" => Some(Self::PreExecute),
            "post" => Some(Self::PostExecute),
            "error" => Some(Self::OnError),
            _ => None,
        }
    }
}

/// Shared sink for warnings a hook run attaches to the in-flight execution.
pub type WarningSink = Arc<Mutex<Vec<String>>>;

/// Fires configured hook commands without ever blocking the caller.
pub struct HookBridge {
    config: Option<HookConfig>,
    shell: String,
    limiter: Arc<Semaphore>,
}

impl HookBridge {
    pub fn new(config: Option<HookConfig>, shell: String) -> Self {
        let permits = config.as_ref().map_or(1, |c| c.max_concurrent.max(1));
        Self {
            config,
            shell,
            limiter: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Command configured for a phase, if any.
    fn command_for(&self, phase: HookPhase) -> Option<(String, u64)> {
        let config = self.config.as_ref()?;
        let command = match phase {
            HookPhase::PreExecute => config.pre_execute.as_ref(),
            HookPhase::PostExecute => config.post_execute.as_ref(),
            HookPhase::OnError => config.on_error.as_ref(),
        }?;
        Some((command.clone(), config.timeout_secs))
    }

    /// Fire a hook asynchronously. Returns immediately; the hook runs in its
    /// own task bounded by the configured timeout and the concurrency
    /// limiter. When a `warnings` sink is given, failures are pushed into it
    /// for attachment to the final result.
    pub fn fire(
        &self,
        phase: HookPhase,
        session_id: &str,
        task_command: &str,
        warnings: Option<WarningSink>,
    ) {
        let Some((hook_command, timeout_secs)) = self.command_for(phase) else {
            return;
        };
        let shell = self.shell.clone();
        let session_id = session_id.to_string();
        let task_command = task_command.to_string();
        let limiter = Arc::clone(&self.limiter);

        tokio::spawn(async move {
            let Ok(_permit) = limiter.acquire().await else {
                return;
            };
            let outcome = run_hook(
                &shell,
                &hook_command,
                phase,
                &session_id,
                &task_command,
                Duration::from_secs(timeout_secs),
            )
            .await;
            if let Err(message) = outcome {
                warn!("{} hook failed (session {session_id}): {message}", phase.as_str());
                if let Some(sink) = warnings {
                    sink.lock()
                        .await
                        .push(format!("{} hook: {message}", phase.as_str()));
                }
            }
        });
    }
}

async fn run_hook(
    shell: &str,
    hook_command: &str,
    phase: HookPhase,
    session_id: &str,
    task_command: &str,
    timeout: Duration,
) -> Result<(), String> {
    let mut cmd = tokio::process::Command::new(shell);
    cmd.args(["-c", hook_command])
        .env("EXECD_HOOK_PHASE", phase.as_str())
        .env("EXECD_SESSION_ID", session_id)
        .env("EXECD_COMMAND", task_command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, async {
        cmd.output().await.map_err(|e| format!("spawn: {e}"))
    })
    .await
    .map_err(|_| format!("timed out after {}s", timeout.as_secs()))??;

    if !output.stdout.is_empty() || !output.stderr.is_empty() {
        debug!(
            "{} hook output: stdout={:?} stderr={:?}",
            phase.as_str(),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    if output.status.success() {
        Ok(())
    } else {
        Err(format!("exit code {}", output.status.code().unwrap_or(-1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge(pre: Option<&str>) -> HookBridge {
        let config = pre.map(|cmd| HookConfig {
            pre_execute: Some(cmd.to_string()),
            post_execute: None,
            on_error: None,
            timeout_secs: 5,
            max_concurrent: 2,
        });
        HookBridge::new(config, "/bin/sh".to_string())
    }

    #[tokio::test]
    async fn unconfigured_phase_is_a_noop() {
        let hb = bridge(None);
        hb.fire(HookPhase::PreExecute, "s1", "true", None);
        // Nothing to await — fire simply returns.
    }

    #[tokio::test]
    async fn failing_hook_attaches_a_warning() {
        let hb = bridge(Some("exit 3"));
        let sink: WarningSink = Arc::new(Mutex::new(Vec::new()));
        hb.fire(HookPhase::PreExecute, "s1", "true", Some(Arc::clone(&sink)));

        // The hook runs detached; poll briefly for its warning.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !sink.lock().await.is_empty() {
                break;
            }
        }
        let warnings = sink.lock().await;
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("pre-execute"));
        assert!(warnings[0].contains("exit code 3"));
    }

    #[tokio::test]
    async fn successful_hook_leaves_no_warning() {
        let hb = bridge(Some("true"));
        let sink: WarningSink = Arc::new(Mutex::new(Vec::new()));
        hb.fire(HookPhase::PreExecute, "s1", "true", Some(Arc::clone(&sink)));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(sink.lock().await.is_empty());
    }

    #[test]
    fn wire_phases_parse() {
        assert_eq!(HookPhase::from_wire("pre"), Some(HookPhase::PreExecute));
        assert_eq!(HookPhase::from_wire("post"), Some(HookPhase::PostExecute));
        assert_eq!(HookPhase::from_wire("error"), Some(HookPhase::OnError));
        assert_eq!(HookPhase::from_wire("mid"), None);
    }
}
