//! Duration history for timeout estimation, stored in TOML.
//!
//! Keeps the last N wall times per task fingerprint so the estimator can
//! consult "how long did similar tasks take". Reads and writes are
//! idempotent per key; the store is optional and everything degrades to the
//! heuristic when it is absent.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

/// Recent execution durations (milliseconds) keyed by task fingerprint.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DurationHistory {
    #[serde(default)]
    history: HashMap<String, Vec<u64>>,
}

impl DurationHistory {
    /// Median of the recorded durations for a fingerprint. `None` when the
    /// task has never been seen.
    pub fn median_ms(&self, fingerprint: &str) -> Option<u64> {
        let records = self.history.get(fingerprint)?;
        if records.is_empty() {
            return None;
        }
        let mut sorted = records.clone();
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2])
    }

    /// Record an observation, keeping the newest `window` entries.
    pub fn record(&mut self, fingerprint: &str, duration_ms: u64, window: usize) {
        let entry = self.history.entry(fingerprint.to_string()).or_default();
        entry.push(duration_ms);
        if entry.len() > window {
            entry.remove(0);
        }
    }

    /// Load from file. Returns default if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("read {}: {e}", path.display()))?;
        toml::from_str(&content).map_err(|e| format!("parse {}: {e}", path.display()))
    }

    /// Save to file, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("mkdir {}: {e}", parent.display()))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| format!("serialize history: {e}"))?;
        std::fs::write(path, content).map_err(|e| format!("write {}: {e}", path.display()))
    }
}

/// Fingerprint a command for history lookup.
///
/// Hashes the first three whitespace-separated tokens so invocations that
/// differ only in trailing arguments (paths, ids) land on the same key.
pub fn task_fingerprint(command: &str) -> String {
    let head: Vec<&str> = command.split_whitespace().take(3).collect();
    let digest = Sha256::digest(head.join(" ").as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_of_odd_window() {
        let mut h = DurationHistory::default();
        for ms in [100, 500, 300] {
            h.record("fp", ms, 20);
        }
        assert_eq!(h.median_ms("fp"), Some(300));
    }

    #[test]
    fn unknown_fingerprint_has_no_median() {
        assert_eq!(DurationHistory::default().median_ms("nope"), None);
    }

    #[test]
    fn window_evicts_oldest() {
        let mut h = DurationHistory::default();
        for ms in 0..25 {
            h.record("fp", ms, 20);
        }
        // 0..4 evicted; median of 5..=24 is 15.
        assert_eq!(h.median_ms("fp"), Some(15));
    }

    #[test]
    fn fingerprint_ignores_trailing_args() {
        let a = task_fingerprint("cargo build --release --target x86_64");
        let b = task_fingerprint("cargo build --release --target aarch64");
        assert_eq!(a, b);
        let c = task_fingerprint("cargo test --release");
        assert_ne!(a, c);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.toml");
        let mut h = DurationHistory::default();
        h.record("fp1", 1200, 20);
        h.record("fp2", 80, 20);
        h.save(&path).unwrap();

        let loaded = DurationHistory::load(&path).unwrap();
        assert_eq!(loaded.median_ms("fp1"), Some(1200));
        assert_eq!(loaded.median_ms("fp2"), Some(80));
    }

    #[test]
    fn load_missing_file_is_empty() {
        let loaded = DurationHistory::load(Path::new("/nonexistent/history.toml")).unwrap();
        assert_eq!(loaded.median_ms("fp"), None);
    }
}
