//! The execution driver: one spawned task per `execute` that owns the whole
//! pipeline from child output to the terminal notification.
//!
//! The driver merges four event sources into one loop: framed chunks from
//! the two stream readers, the child's exit, the timeout watchdog, and the
//! controller's cancellation signal. Completion requires *all three* of
//! stdout drained, stderr drained, and child reaped — gathering, never
//! waiting on exit alone, is what keeps a full pipe from deadlocking the
//! child.
//!
//! On timeout or cancel the driver keeps draining for a short grace, then
//! hands the accumulated output to the partial-result assembler. Exactly one
//! `process.completed` ends every execution; nothing is emitted after it.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::detect::{time_saved_ms, MarkerKind};
use crate::hooks::{HookPhase, WarningSink};
use crate::partial::{
    confine_artifact, extract_structured, persist_partial, repair_json, CompletionReason,
    ExecutionResult,
};
use crate::proc::{spawn_group, ControlKind, GroupController};
use crate::rpc::jsonrpc::notification;
use crate::sessions::Session;
use crate::state::AppState;
use crate::stream::{spawn_reader, StreamEvent, StreamKind};
use crate::timeout::TaskDescriptor;
use crate::util::{expand_tilde, now_ms};

/// Why an `execute` request was rejected before anything started.
#[derive(Debug)]
pub enum ExecuteError {
    /// Another execution is active on this session.
    Busy,
    /// The command matched no allow-list pattern.
    NotAllowed,
    /// The OS refused to start the child.
    SpawnFailed(String),
}

impl std::fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Busy => write!(f, "an execution is already active on this session"),
            Self::NotAllowed => write!(f, "command is not permitted by the allow-list"),
            Self::SpawnFailed(e) => write!(f, "failed to spawn process: {e}"),
        }
    }
}

/// Immediate result of a successful `execute`.
#[derive(Debug)]
pub struct Started {
    pub pid: u32,
    pub pgid: i32,
    pub timeout: Duration,
}

/// Validate, spawn, and detach the driver for one execution.
///
/// Returns as soon as the child is running; all streaming happens through
/// `tx` afterwards. The session's active slot is held across the busy-check
/// and spawn so concurrent `execute` requests cannot race past each other.
pub async fn start_execution(
    state: &AppState,
    session: Arc<Session>,
    task: TaskDescriptor,
    tx: mpsc::UnboundedSender<Value>,
) -> Result<Started, ExecuteError> {
    if !state.command_allowed(&task.command) {
        return Err(ExecuteError::NotAllowed);
    }

    let mut slot = session.active_slot().await;
    if slot.is_some() {
        return Err(ExecuteError::Busy);
    }

    let timeout = state.estimator.estimate(&task).await;
    let warnings: WarningSink = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    state.hooks.fire(
        HookPhase::PreExecute,
        &session.id,
        &task.command,
        Some(Arc::clone(&warnings)),
    );

    let cwd_raw = task
        .cwd
        .clone()
        .unwrap_or_else(|| state.config.exec.work_root.clone());
    let cwd = expand_tilde(&cwd_raw);

    let spawned = match spawn_group(
        &state.config.exec.shell,
        &task.command,
        &cwd,
        task.env.as_ref(),
    ) {
        Ok(s) => s,
        Err(e) => {
            state
                .hooks
                .fire(HookPhase::OnError, &session.id, &task.command, None);
            return Err(ExecuteError::SpawnFailed(e.to_string()));
        }
    };

    let controller = GroupController::new(
        spawned.pgid,
        Duration::from_secs(state.config.exec.kill_grace_secs),
    );
    *slot = Some(controller.clone());
    drop(slot);
    controller.mark_running().await;

    info!(
        "Session {}: spawned pid {} (pgid {}) timeout {}s: {}",
        session.id,
        spawned.pid,
        spawned.pgid,
        timeout.as_secs(),
        crate::util::truncate_str(&task.command, 80),
    );

    let (ev_tx, ev_rx) = mpsc::channel::<StreamEvent>(256);
    spawn_reader(
        StreamKind::Stdout,
        spawned.stdout,
        state.config.stream.line_cap_bytes,
        ev_tx.clone(),
    );
    spawn_reader(
        StreamKind::Stderr,
        spawned.stderr,
        state.config.stream.line_cap_bytes,
        ev_tx.clone(),
    );

    // Exit watcher — feeds the same channel so the driver has one ordered
    // event source.
    let mut child = spawned.child;
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("child wait error: {e}");
                None
            }
        };
        let _ = ev_tx.send(StreamEvent::Exited { code }).await;
    });

    let driver = Driver {
        state: state.clone(),
        session: Arc::clone(&session),
        controller,
        task,
        timeout,
        tx,
        warnings,
    };
    tokio::spawn(driver.drive(ev_rx));

    Ok(Started {
        pid: spawned.pid,
        pgid: spawned.pgid,
        timeout,
    })
}

struct Driver {
    state: AppState,
    session: Arc<Session>,
    controller: GroupController,
    task: TaskDescriptor,
    timeout: Duration,
    tx: mpsc::UnboundedSender<Value>,
    warnings: WarningSink,
}

impl Driver {
    async fn drive(self, mut rx: mpsc::Receiver<StreamEvent>) {
        let started_wall = now_ms();
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.timeout;
        let drain_grace = Duration::from_millis(self.state.config.stream.drain_grace_ms);
        let output_cap = self.state.config.stream.output_cap_bytes as u64;
        let terminating = self.controller.terminating_signal();

        let mut stdout_closed = false;
        let mut stderr_closed = false;
        let mut exit_code: Option<Option<i32>> = None;
        let mut cancel_reason: Option<CompletionReason> = None;
        let mut drain_deadline: Option<tokio::time::Instant> = None;

        let mut accumulated = String::new();
        let mut total_bytes = 0u64;
        let mut overflow_sent = false;
        let mut token_limit_sent = false;
        let mut early_success: Option<(Instant, String)> = None;
        let mut failure_seen = false;
        let mut artifact_hits: Vec<String> = Vec::new();

        loop {
            if stdout_closed && stderr_closed && exit_code.is_some() {
                break;
            }

            tokio::select! {
                ev = rx.recv() => {
                    match ev {
                        Some(StreamEvent::Chunk(mut chunk)) => {
                            total_bytes += chunk.data.len() as u64;

                            if let Some(hit) = self.state.detector.scan_markers(&chunk.data) {
                                match hit.kind {
                                    MarkerKind::Success if early_success.is_none() => {
                                        let seen_at = Instant::now();
                                        self.notify("process.early_completion", json!({
                                            "marker": hit.matched,
                                            "time_saved_ms": time_saved_ms(seen_at, Instant::now()),
                                        }));
                                        early_success = Some((seen_at, hit.matched));
                                    }
                                    MarkerKind::Failure if !failure_seen => {
                                        failure_seen = true;
                                        debug!("Session {}: failure marker {:?}", self.session.id, hit.matched);
                                    }
                                    _ => {}
                                }
                            }
                            artifact_hits.extend(self.state.detector.scan_artifacts(&chunk.data));

                            if total_bytes > output_cap {
                                if !overflow_sent {
                                    overflow_sent = true;
                                    self.notify("error.stream_buffer_overflow", json!({
                                        "limit_bytes": output_cap,
                                        "message": "session output cap reached; further chunks are delivered but no longer accumulated",
                                    }));
                                }
                                chunk.truncated = true;
                            } else if chunk.stream == StreamKind::Stdout {
                                accumulated.push_str(&chunk.data);
                            }

                            if let Some(hint) = self.task.expected_output_tokens {
                                if !token_limit_sent && total_bytes / 4 > hint.saturating_mul(2) {
                                    token_limit_sent = true;
                                    self.notify("error.token_limit_exceeded", json!({
                                        "expected_tokens": hint,
                                        "observed_tokens": total_bytes / 4,
                                    }));
                                }
                            }

                            self.notify("process.output", json!({
                                "stream": chunk.stream.as_str(),
                                "data": chunk.data,
                                "seq": chunk.seq,
                                "truncated": chunk.truncated,
                            }));
                        }
                        Some(StreamEvent::Closed(StreamKind::Stdout)) => stdout_closed = true,
                        Some(StreamEvent::Closed(StreamKind::Stderr)) => stderr_closed = true,
                        Some(StreamEvent::Exited { code }) => {
                            exit_code = Some(code);
                            self.controller.mark_exited().await;
                        }
                        None => break,
                    }
                }
                () = tokio::time::sleep_until(deadline), if cancel_reason.is_none() => {
                    info!(
                        "Session {}: timeout after {}s, terminating group",
                        self.session.id,
                        self.timeout.as_secs()
                    );
                    cancel_reason = Some(CompletionReason::Timeout);
                    if let Err(e) = self.controller.apply(ControlKind::Cancel).await {
                        debug!("timeout cancel: {e}");
                    }
                    // The shell may already be reaped while a descendant
                    // holds the pipes open; the state machine no-ops then,
                    // so address the group directly as well.
                    if exit_code.is_some() {
                        self.controller.term_now();
                    }
                    drain_deadline = Some(tokio::time::Instant::now() + drain_grace);
                    self.state.hooks.fire(
                        HookPhase::OnError,
                        &self.session.id,
                        &self.task.command,
                        Some(Arc::clone(&self.warnings)),
                    );
                }
                () = terminating.notified(), if cancel_reason.is_none() => {
                    // Client-initiated CANCEL, observed via the controller.
                    cancel_reason = Some(CompletionReason::Cancelled);
                    self.notify("process.cancelled", json!({ "reason": "cancelled" }));
                    drain_deadline = Some(tokio::time::Instant::now() + drain_grace);
                }
                () = tokio::time::sleep_until(
                        drain_deadline.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(86400))
                    ), if drain_deadline.is_some() => {
                    debug!("Session {}: drain grace elapsed", self.session.id);
                    break;
                }
            }
        }

        // Leaving with a stream still open means a group member is alive
        // and holding the fd (the drain grace expired). While members
        // remain, the pgid cannot be reused, so the group kill is safe.
        if !(stdout_closed && stderr_closed) {
            self.controller.kill_now();
        }

        let finished_wall = now_ms();
        let elapsed = started.elapsed();
        #[allow(clippy::cast_possible_truncation)]
        let timeout_used_ms = self.timeout.as_millis() as u64;

        let time_saved = early_success
            .as_ref()
            .map(|(seen_at, _)| time_saved_ms(*seen_at, Instant::now()));

        let work_root = Path::new(&self.state.config.exec.work_root);
        let mut artifacts: Vec<String> = Vec::new();
        for raw in artifact_hits {
            match confine_artifact(work_root, &raw) {
                Ok(path) => {
                    let display = path.display().to_string();
                    if !artifacts.contains(&display) {
                        artifacts.push(display);
                    }
                }
                Err(e) => warn!("Session {}: rejected artifact: {e}", self.session.id),
            }
        }

        let hook_warnings = self.warnings.lock().await.clone();

        let result = match cancel_reason {
            Some(reason) => {
                let summary = if self.task.structured || looks_structured(&accumulated) {
                    repair_json(&accumulated)
                } else {
                    None
                };
                let raw_output = if summary.is_none() && !accumulated.is_empty() {
                    Some(accumulated.clone())
                } else {
                    None
                };
                ExecutionResult {
                    exit_code: None,
                    partial: true,
                    reason,
                    output_summary: summary,
                    raw_output,
                    timeout_after_ms: (reason == CompletionReason::Timeout)
                        .then_some(timeout_used_ms),
                    artifacts,
                    hook_warnings,
                    time_saved_ms: time_saved,
                    started_at: started_wall,
                    finished_at: finished_wall,
                    timeout_used_ms,
                }
            }
            None => {
                let code = exit_code.flatten();
                let (reason, partial) = match code {
                    Some(0) => (CompletionReason::Ok, false),
                    Some(_) => (CompletionReason::ExitNonzero, false),
                    // Killed by an outside signal (nobody cancelled).
                    None => (CompletionReason::Signal, true),
                };
                if let (Some(nonzero), Some(_)) = (code.filter(|&c| c != 0), early_success.as_ref())
                {
                    // The marker promised success but the process failed;
                    // surface the real exit code instead of masking it.
                    self.notify(
                        "process.failed_after_completion",
                        json!({ "exit_code": nonzero }),
                    );
                }
                let summary = if partial {
                    repair_json(&accumulated)
                } else {
                    extract_structured(&accumulated)
                };
                let raw_output = if partial && summary.is_none() && !accumulated.is_empty() {
                    Some(accumulated.clone())
                } else {
                    None
                };
                ExecutionResult {
                    exit_code: code,
                    partial,
                    reason,
                    output_summary: summary,
                    raw_output,
                    timeout_after_ms: None,
                    artifacts,
                    hook_warnings,
                    time_saved_ms: time_saved,
                    started_at: started_wall,
                    finished_at: finished_wall,
                    timeout_used_ms,
                }
            }
        };
        debug_assert!(result.invariant_holds());

        if matches!(
            result.reason,
            CompletionReason::Timeout | CompletionReason::Cancelled
        ) {
            persist_partial(
                Path::new(&self.state.config.exec.results_dir),
                &self.session.id,
                &result,
            )
            .await;
        }

        if matches!(
            result.reason,
            CompletionReason::Ok | CompletionReason::ExitNonzero
        ) {
            self.state
                .estimator
                .record_duration(&self.task.command, elapsed)
                .await;
        }

        let params = serde_json::to_value(&result).unwrap_or_else(|_| json!({}));
        self.notify("process.completed", params);

        self.session.finish_execution().await;
        self.state
            .hooks
            .fire(HookPhase::PostExecute, &self.session.id, &self.task.command, None);

        info!(
            "Session {}: execution finished ({:?}, exit {:?}, {} ms)",
            self.session.id,
            result.reason,
            result.exit_code,
            elapsed.as_millis()
        );
    }

    /// Non-blocking by construction: the notification channel is unbounded
    /// so a slow WebSocket consumer can never stall the drain loop. Memory
    /// stays bounded in practice by the session output cap and the
    /// heartbeat's idle close.
    fn notify(&self, method: &str, params: Value) {
        let _ = self.tx.send(notification(method, params));
    }
}

/// Does the accumulated output plausibly contain a structured reply?
fn looks_structured(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with('[') || text.contains("```json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_state(work_root: &Path) -> AppState {
        let mut config: Config = toml::from_str("").unwrap();
        config.exec.work_root = work_root.to_string_lossy().into_owned();
        config.exec.results_dir = work_root.join("results").to_string_lossy().into_owned();
        config.timeout.min_secs = 1;
        config.timeout.default_secs = 30;
        config.stream.drain_grace_ms = 500;
        AppState::from_config(config).unwrap()
    }

    fn task(command: &str) -> TaskDescriptor {
        TaskDescriptor {
            command: command.to_string(),
            ..TaskDescriptor::default()
        }
    }

    /// Drain notifications until `process.completed`, returning everything.
    async fn collect(mut rx: mpsc::UnboundedReceiver<Value>) -> Vec<Value> {
        let mut all = Vec::new();
        while let Some(msg) = rx.recv().await {
            let done = msg["method"] == "process.completed";
            all.push(msg);
            if done {
                break;
            }
        }
        all
    }

    fn completed(messages: &[Value]) -> &Value {
        messages
            .iter()
            .find(|m| m["method"] == "process.completed")
            .expect("no process.completed")
    }

    #[tokio::test]
    async fn tiny_success_streams_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let session = state.session_manager.create().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        let started = start_execution(&state, Arc::clone(&session), task("printf 'hello'"), tx)
            .await
            .unwrap();
        assert!(started.pid > 0);
        assert_eq!(started.pgid as u32, started.pid);

        let messages = collect(rx).await;
        let output: Vec<&Value> = messages
            .iter()
            .filter(|m| m["method"] == "process.output")
            .collect();
        assert_eq!(output.len(), 1);
        assert_eq!(output[0]["params"]["stream"], "stdout");
        assert_eq!(output[0]["params"]["data"], "hello");
        assert_eq!(output[0]["params"]["seq"], 1);
        assert_eq!(output[0]["params"]["truncated"], false);

        let done = completed(&messages);
        assert_eq!(done["params"]["exit_code"], 0);
        assert_eq!(done["params"]["reason"], "ok");
        assert_eq!(done["params"]["partial"], false);
        // Nothing after process.completed.
        assert!(std::ptr::eq(messages.last().unwrap(), done));

        // Session is reusable afterwards.
        assert!(!session.is_busy().await);
    }

    #[tokio::test]
    async fn stderr_and_stdout_keep_independent_contiguous_seqs() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let session = state.session_manager.create().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        start_execution(
            &state,
            session,
            task("echo a; echo b; echo err1 >&2; echo err2 >&2"),
            tx,
        )
        .await
        .unwrap();

        let messages = collect(rx).await;
        for stream in ["stdout", "stderr"] {
            let seqs: Vec<u64> = messages
                .iter()
                .filter(|m| m["method"] == "process.output" && m["params"]["stream"] == stream)
                .map(|m| m["params"]["seq"].as_u64().unwrap())
                .collect();
            assert_eq!(seqs, vec![1, 2], "stream {stream}");
        }
    }

    #[tokio::test]
    async fn large_output_does_not_deadlock() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let session = state.session_manager.create().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        // 1 MiB split across both streams in bursts — far past the 64 KiB
        // pipe buffer on each.
        let cmd = "i=0; while [ $i -lt 128 ]; do \
                   head -c 4096 /dev/zero | tr '\\0' 'a'; echo; \
                   head -c 4096 /dev/zero | tr '\\0' 'b' >&2; echo >&2; \
                   i=$((i+1)); done";
        start_execution(&state, session, task(cmd), tx).await.unwrap();

        let messages = tokio::time::timeout(Duration::from_secs(30), collect(rx))
            .await
            .expect("gather deadlocked on large output");

        let stdout_bytes: usize = messages
            .iter()
            .filter(|m| m["method"] == "process.output" && m["params"]["stream"] == "stdout")
            .map(|m| m["params"]["data"].as_str().unwrap().len())
            .sum();
        assert_eq!(stdout_bytes, 128 * 4097);
        let done = completed(&messages);
        assert_eq!(done["params"]["exit_code"], 0);
        assert_eq!(done["params"]["partial"], false);
    }

    #[tokio::test]
    async fn pause_resume_cancel_yields_partial_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let session = state.session_manager.create().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        start_execution(&state, Arc::clone(&session), task("sleep 60"), tx)
            .await
            .unwrap();
        let controller = session.controller().await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        controller.apply(ControlKind::Pause).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        controller.apply(ControlKind::Resume).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        controller.apply(ControlKind::Cancel).await.unwrap();
        // Idempotent: a second CANCEL never raises.
        controller.apply(ControlKind::Cancel).await.unwrap();

        let messages = tokio::time::timeout(Duration::from_secs(15), collect(rx))
            .await
            .unwrap();
        assert!(messages.iter().any(|m| m["method"] == "process.cancelled"));
        let done = completed(&messages);
        assert_eq!(done["params"]["reason"], "cancelled");
        assert_eq!(done["params"]["partial"], true);
        assert!(done["params"]["exit_code"].is_null());
    }

    #[tokio::test]
    async fn timeout_with_partial_json_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let session = state.session_manager.create().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut t = task("printf '{\"result\":\"partial\"'; sleep 60");
        t.timeout_secs = Some(1); // clamped to min_secs = 1
        t.structured = true;
        start_execution(&state, Arc::clone(&session), t, tx)
            .await
            .unwrap();

        let messages = tokio::time::timeout(Duration::from_secs(20), collect(rx))
            .await
            .unwrap();
        let done = completed(&messages);
        assert_eq!(done["params"]["reason"], "timeout");
        assert_eq!(done["params"]["partial"], true);
        assert!(done["params"]["exit_code"].is_null());
        assert_eq!(done["params"]["output_summary"]["result"], "partial");

        // The _PARTIAL sentinel artifact exists.
        let sentinel = dir
            .path()
            .join("results")
            .join(format!("{}_PARTIAL.json", session.id));
        assert!(sentinel.exists());
    }

    #[tokio::test]
    async fn early_marker_then_nonzero_exit_reports_failed_after_completion() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let session = state.session_manager.create().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        start_execution(
            &state,
            session,
            task("echo '=== RESULT:::OK ==='; exit 3"),
            tx,
        )
        .await
        .unwrap();

        let messages = collect(rx).await;
        let early: Vec<&Value> = messages
            .iter()
            .filter(|m| m["method"] == "process.early_completion")
            .collect();
        assert_eq!(early.len(), 1);
        assert!(early[0]["params"]["time_saved_ms"].as_u64().unwrap() < 10_000);

        assert!(messages
            .iter()
            .any(|m| m["method"] == "process.failed_after_completion"
                && m["params"]["exit_code"] == 3));

        let done = completed(&messages);
        assert_eq!(done["params"]["exit_code"], 3);
        assert_eq!(done["params"]["reason"], "exit_nonzero");
        assert_eq!(done["params"]["partial"], false);
    }

    #[tokio::test]
    async fn fenced_reply_round_trips_on_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let session = state.session_manager.create().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        start_execution(
            &state,
            session,
            task("printf '```json\\n{\"answer\": 42}\\n```\\n'"),
            tx,
        )
        .await
        .unwrap();

        let messages = collect(rx).await;
        let done = completed(&messages);
        assert_eq!(done["params"]["output_summary"]["answer"], 42);
    }

    #[tokio::test]
    async fn artifact_paths_are_confined() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let session = state.session_manager.create().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        start_execution(
            &state,
            session,
            task("echo 'File created at out/report.json'; echo 'File created at ../escape.txt'"),
            tx,
        )
        .await
        .unwrap();

        let messages = collect(rx).await;
        let done = completed(&messages);
        let artifacts = done["params"]["artifacts"].as_array().unwrap();
        assert_eq!(artifacts.len(), 1);
        assert!(artifacts[0]
            .as_str()
            .unwrap()
            .ends_with("out/report.json"));
    }

    #[tokio::test]
    async fn second_execute_while_busy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let session = state.session_manager.create().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        start_execution(&state, Arc::clone(&session), task("sleep 5"), tx.clone())
            .await
            .unwrap();
        let err = start_execution(&state, Arc::clone(&session), task("true"), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Busy));

        session.cancel_active().await;
        let _ = tokio::time::timeout(Duration::from_secs(15), collect(rx)).await;
    }

    #[tokio::test]
    async fn spawn_failure_reports_os_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let session = state.session_manager.create().await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut t = task("true");
        t.cwd = Some("/definitely/not/a/real/dir".to_string());
        let err = start_execution(&state, session, t, tx).await.unwrap_err();
        assert!(matches!(err, ExecuteError::SpawnFailed(_)));
    }
}
