//! Adaptive timeout estimation.
//!
//! Queried exactly once per execution, at spawn. The estimate feeds the
//! cancellation watchdog; it never reads command output.
//!
//! Resolution order:
//!
//! 1. Caller-supplied timeout, clamped to `[min_secs, max_secs]`.
//! 2. `base + secs_per_kilotoken × expected_tokens / 1000`, where the token
//!    count comes from the caller's hint or a rough command heuristic.
//! 3. Widened to the history median for the task fingerprint, when a
//!    history store is configured and has seen similar tasks.
//! 4. Multiplied by `load_factor` when the CPU probe reports pressure above
//!    `load_threshold_pct`.
//! 5. Clamped to `[min_secs, max_secs]`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use sysinfo::System;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::TimeoutConfig;
use crate::history::{task_fingerprint, DurationHistory};

/// Everything the caller told us about one execution request.
///
/// Used only to derive a timeout and choose hooks; never re-interpreted
/// after spawn.
#[derive(Debug, Clone, Default)]
pub struct TaskDescriptor {
    /// Raw shell command string, trusted as-is.
    pub command: String,
    /// Caller-declared complexity: `"low"`, `"medium"`, or `"high"`.
    pub complexity: Option<String>,
    /// Caller's estimate of output size in tokens.
    pub expected_output_tokens: Option<u64>,
    /// Advisory list of tools the task may invoke.
    pub tools_allowed: Option<Vec<String>>,
    /// Explicit timeout override in seconds.
    pub timeout_secs: Option<u64>,
    /// Caller expects a structured (JSON) reply; drives partial-result repair.
    pub structured: bool,
    /// Extra environment variables for the child.
    pub env: Option<HashMap<String, String>>,
    /// Working directory override.
    pub cwd: Option<String>,
}

/// Computes execution timeouts from task descriptors, history, and load.
pub struct TimeoutEstimator {
    config: TimeoutConfig,
    history: Option<Mutex<DurationHistory>>,
    history_path: Option<PathBuf>,
    sys: Mutex<System>,
}

impl TimeoutEstimator {
    pub fn new(config: TimeoutConfig) -> Self {
        let history_path = if config.history_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&config.history_path))
        };
        let history = history_path.as_ref().map(|path| {
            let loaded = DurationHistory::load(path).unwrap_or_else(|e| {
                warn!("history store unreadable, starting empty: {e}");
                DurationHistory::default()
            });
            Mutex::new(loaded)
        });
        Self {
            config,
            history,
            history_path,
            sys: Mutex::new(System::new()),
        }
    }

    /// Compute the timeout for one task.
    pub async fn estimate(&self, task: &TaskDescriptor) -> Duration {
        let min = self.config.min_secs;
        let max = self.config.max_secs;

        if let Some(explicit) = task.timeout_secs {
            return Duration::from_secs(explicit.clamp(min, max));
        }

        let tokens = expected_tokens(task);
        let mut secs = self.config.default_secs + self.config.secs_per_kilotoken * tokens / 1000;

        if let Some(ref history) = self.history {
            let fingerprint = task_fingerprint(&task.command);
            if let Some(median_ms) = history.lock().await.median_ms(&fingerprint) {
                let median_secs = median_ms.div_ceil(1000);
                if median_secs > secs {
                    debug!("history widens timeout {secs}s -> {median_secs}s for {fingerprint}");
                    secs = median_secs;
                }
            }
        }

        if self.cpu_pressure().await {
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                secs = (secs as f64 * self.config.load_factor).round() as u64;
            }
        }

        Duration::from_secs(secs.clamp(min, max))
    }

    /// Record a finished execution's wall time for future estimates.
    pub async fn record_duration(&self, command: &str, elapsed: Duration) {
        let Some(ref history) = self.history else {
            return;
        };
        let fingerprint = task_fingerprint(command);
        #[allow(clippy::cast_possible_truncation)]
        let ms = elapsed.as_millis() as u64;
        let mut guard = history.lock().await;
        guard.record(&fingerprint, ms, self.config.history_window);
        if let Some(ref path) = self.history_path {
            if let Err(e) = guard.save(path) {
                warn!("failed to persist duration history: {e}");
            }
        }
    }

    /// Whether the CPU probe reports pressure above the threshold. The first
    /// sample after startup reads 0% and simply doesn't widen.
    async fn cpu_pressure(&self) -> bool {
        let mut sys = self.sys.lock().await;
        sys.refresh_cpu_usage();
        let usage = sys.global_cpu_usage();
        usage > self.config.load_threshold_pct
    }
}

/// Rough output-size heuristic: caller hint, else command length plus bumps
/// for keywords that correlate with long-running work.
fn expected_tokens(task: &TaskDescriptor) -> u64 {
    if let Some(hint) = task.expected_output_tokens {
        return scaled_by_complexity(hint, task.complexity.as_deref());
    }

    let mut tokens = task.command.len() as u64 / 4;
    const HEAVY_KEYWORDS: &[(&str, u64)] = &[
        ("build", 1000),
        ("compile", 1000),
        ("test", 500),
        ("install", 500),
        ("train", 4000),
        ("bench", 1000),
        ("download", 2000),
    ];
    let lowered = task.command.to_lowercase();
    for (keyword, bump) in HEAVY_KEYWORDS {
        if lowered.contains(keyword) {
            tokens += bump;
        }
    }
    scaled_by_complexity(tokens, task.complexity.as_deref())
}

fn scaled_by_complexity(tokens: u64, complexity: Option<&str>) -> u64 {
    match complexity {
        Some("high") => tokens * 2,
        Some("low") => tokens / 2,
        _ => tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TimeoutConfig {
        TimeoutConfig {
            default_secs: 300,
            min_secs: 60,
            max_secs: 3600,
            secs_per_kilotoken: 30,
            load_threshold_pct: 101.0, // never trips in tests
            load_factor: 1.5,
            history_path: String::new(),
            history_window: 20,
        }
    }

    fn task(command: &str) -> TaskDescriptor {
        TaskDescriptor {
            command: command.to_string(),
            ..TaskDescriptor::default()
        }
    }

    #[tokio::test]
    async fn explicit_timeout_is_clamped() {
        let te = TimeoutEstimator::new(config());
        let mut t = task("sleep 5");
        t.timeout_secs = Some(2);
        assert_eq!(te.estimate(&t).await, Duration::from_secs(60));
        t.timeout_secs = Some(86400);
        assert_eq!(te.estimate(&t).await, Duration::from_secs(3600));
        t.timeout_secs = Some(120);
        assert_eq!(te.estimate(&t).await, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn heuristic_bumps_on_heavy_keywords() {
        let te = TimeoutEstimator::new(config());
        let light = te.estimate(&task("ls -la")).await;
        let heavy = te.estimate(&task("cargo build --release")).await;
        assert!(heavy > light);
    }

    #[tokio::test]
    async fn estimate_never_leaves_bounds() {
        let mut cfg = config();
        cfg.default_secs = 61; // just above the floor so defaults stay valid
        let te = TimeoutEstimator::new(cfg);
        let long_cmd = "x".repeat(1_000_000);
        let estimate = te.estimate(&task(&long_cmd)).await;
        assert_eq!(estimate, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn history_median_widens_the_estimate() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.history_path = dir
            .path()
            .join("history.toml")
            .to_string_lossy()
            .into_owned();
        let te = TimeoutEstimator::new(cfg);

        // Three observed runs of ~30 minutes each.
        for _ in 0..3 {
            te.record_duration("cargo build --release", Duration::from_secs(1800))
                .await;
        }
        let estimate = te.estimate(&task("cargo build --release")).await;
        assert_eq!(estimate, Duration::from_secs(1800));
    }

    #[test]
    fn complexity_scales_tokens() {
        let mut t = task("run");
        t.expected_output_tokens = Some(1000);
        t.complexity = Some("high".to_string());
        assert_eq!(expected_tokens(&t), 2000);
        t.complexity = Some("low".to_string());
        assert_eq!(expected_tokens(&t), 500);
    }
}
