//! Execution-result assembly, including timeout/cancel salvage.
//!
//! Clean exits produce a full [`ExecutionResult`]; when the watchdog fires
//! or the client cancels, the assembler turns whatever output accumulated
//! into a degraded-but-usable partial result instead of losing it:
//!
//! 1. stdout accumulated so far is concatenated,
//! 2. if the task asked for a structured reply (or the text plainly looks
//!    like JSON), a best-effort repair balances unclosed brackets and
//!    quotes, strips trailing garbage, and re-parses,
//! 3. the result is marked `partial = true` with `exit_code = null`, and
//! 4. a session-scoped `<session_id>_PARTIAL.json` artifact is written so
//!    callers can detect partial runs without parsing anything.
//!
//! Artifact paths reported by the child are confined to the configured work
//! root here; traversal never escapes it.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

/// Why an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Ok,
    /// Clean exit with a non-zero code. Also used when an early success
    /// marker was seen but the process then failed, so the real exit code is
    /// never masked by the marker.
    ExitNonzero,
    Timeout,
    Cancelled,
    Signal,
    SpawnFailed,
}

/// The terminal outcome of one `execute`, carried by `process.completed`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// `None` for partial results and signal deaths.
    pub exit_code: Option<i32>,
    pub partial: bool,
    pub reason: CompletionReason,
    /// Parsed structured reply, when one was found (or repaired).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<Value>,
    /// Raw salvaged stdout for partial results whose repair failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_after_ms: Option<u64>,
    /// Confined artifact paths announced by the child.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    /// Hook failures attached as warnings; never fatal.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hook_warnings: Vec<String>,
    /// Milliseconds between the early-success marker and process exit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_saved_ms: Option<u64>,
    pub started_at: u64,
    pub finished_at: u64,
    pub timeout_used_ms: u64,
}

impl ExecutionResult {
    /// The invariant `partial ⇒ reason ∈ {timeout, cancelled, signal}`,
    /// checked where results are built.
    pub fn invariant_holds(&self) -> bool {
        !self.partial
            || matches!(
                self.reason,
                CompletionReason::Timeout | CompletionReason::Cancelled | CompletionReason::Signal
            )
    }
}

/// Extract a structured reply from complete output.
///
/// Prefers a fenced ```json block; falls back to the first top-level JSON
/// value in the text. Strict parse only — repair is reserved for the
/// partial path.
pub fn extract_structured(stdout: &str) -> Option<Value> {
    let candidate = json_candidate(stdout)?;
    let trimmed = balanced_prefix(candidate)?;
    serde_json::from_str(trimmed).ok()
}

/// Best-effort repair of an interrupted structured reply.
///
/// Balances unclosed strings and brackets, drops a dangling comma or fills
/// a dangling colon, then parses. `None` when the text is beyond salvage.
pub fn repair_json(stdout: &str) -> Option<Value> {
    let candidate = json_candidate(stdout)?;

    // Already balanced — just strip trailing garbage.
    if let Some(prefix) = balanced_prefix(candidate) {
        if let Ok(value) = serde_json::from_str::<Value>(prefix) {
            return Some(value);
        }
    }

    let mut repaired = String::with_capacity(candidate.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in candidate.chars() {
        repaired.push(c);
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }

    if escaped {
        // A lone trailing backslash can't be completed meaningfully.
        repaired.pop();
    }
    if in_string {
        repaired.push('"');
    }

    // A value cut off after ',' or ':' leaves invalid JSON even once the
    // brackets close; tidy the tail first.
    let tail_trimmed = repaired.trim_end().to_string();
    let mut repaired = tail_trimmed;
    if repaired.ends_with(',') {
        repaired.pop();
    } else if repaired.ends_with(':') {
        repaired.push_str("null");
    }

    while let Some(closer) = stack.pop() {
        repaired.push(closer);
    }

    serde_json::from_str(&repaired).ok()
}

/// Locate the start of a JSON payload: inside a ```json fence when present,
/// otherwise at the first `{` or `[`.
fn json_candidate(text: &str) -> Option<&str> {
    if let Some(fence_start) = text.find("```json") {
        let body = &text[fence_start + "```json".len()..];
        let body = body.strip_prefix('\n').unwrap_or(body);
        let end = body.find("```").unwrap_or(body.len());
        let inner = body[..end].trim();
        if !inner.is_empty() {
            return Some(inner);
        }
    }
    let start = text.find(['{', '['])?;
    Some(text[start..].trim_end())
}

/// The shortest prefix of `text` that forms one balanced JSON value, used to
/// strip trailing garbage after a complete reply. `None` if never balanced.
fn balanced_prefix(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[..=idx]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Resolve an artifact path the child reported and confine it to the work
/// root. Rejects `..` traversal and absolute paths outside the root.
pub fn confine_artifact(work_root: &Path, raw: &str) -> Result<PathBuf, String> {
    let reported = Path::new(raw);
    let joined = if reported.is_absolute() {
        reported.to_path_buf()
    } else {
        work_root.join(reported)
    };

    // Lexical normalization — the file may not exist yet, so canonicalize()
    // is not an option.
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                return Err(format!("artifact path {raw:?} contains traversal"));
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }

    if !normalized.starts_with(work_root) {
        return Err(format!(
            "artifact path {raw:?} escapes work root {}",
            work_root.display()
        ));
    }
    Ok(normalized)
}

/// Write the session-scoped partial artifact. Best-effort: failures are
/// logged and the in-band result is unaffected.
pub async fn persist_partial(results_dir: &Path, session_id: &str, result: &ExecutionResult) {
    let path = results_dir.join(format!("{session_id}_PARTIAL.json"));
    let body = json!({
        "reason": result.reason,
        "timeout_after_ms": result.timeout_after_ms,
        "output_summary": result.output_summary,
        "raw_output": result.raw_output,
        "artifacts": result.artifacts,
    });
    let serialized = match serde_json::to_vec_pretty(&body) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("partial artifact serialize failed: {e}");
            return;
        }
    };
    if let Err(e) = tokio::fs::create_dir_all(results_dir).await {
        warn!("partial artifact dir {}: {e}", results_dir.display());
        return;
    }
    if let Err(e) = tokio::fs::write(&path, serialized).await {
        warn!("partial artifact write {}: {e}", path.display());
    }
}
