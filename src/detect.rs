//! Completion-marker and artifact detection over streamed output.
//!
//! Markers are operator-configured regexes (see `[detector]` in the config)
//! compiled once at startup — never per chunk. Success markers let the
//! protocol layer tell the client the useful work is done while the process
//! runs to exit; failure markers are advisory. Artifact patterns capture
//! paths from "file created at ..." notices.
//!
//! The detector never terminates a process. It only observes.

use std::time::Instant;

use regex::Regex;

use crate::config::DetectorConfig;

/// What a matched marker means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Success,
    Failure,
}

/// A marker match within one chunk.
#[derive(Debug, Clone)]
pub struct MarkerHit {
    pub kind: MarkerKind,
    /// The text the regex matched, for client display.
    pub matched: String,
}

/// Compiled marker and artifact matchers.
pub struct CompletionDetector {
    success: Vec<Regex>,
    failure: Vec<Regex>,
    artifacts: Vec<Regex>,
}

impl CompletionDetector {
    /// Compile all configured patterns. Invalid patterns are caught earlier
    /// by `Config::validate`, but compilation failures still surface here
    /// rather than panicking.
    pub fn compile(config: &DetectorConfig) -> Result<Self, String> {
        fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, String> {
            patterns
                .iter()
                .map(|p| Regex::new(p).map_err(|e| format!("invalid regex {p:?}: {e}")))
                .collect()
        }
        Ok(Self {
            success: compile_all(&config.success)?,
            failure: compile_all(&config.failure)?,
            artifacts: compile_all(&config.artifacts)?,
        })
    }

    /// Scan a chunk for the first marker hit. Success wins over failure when
    /// both match the same chunk.
    pub fn scan_markers(&self, data: &str) -> Option<MarkerHit> {
        for re in &self.success {
            if let Some(m) = re.find(data) {
                return Some(MarkerHit {
                    kind: MarkerKind::Success,
                    matched: m.as_str().to_string(),
                });
            }
        }
        for re in &self.failure {
            if let Some(m) = re.find(data) {
                return Some(MarkerHit {
                    kind: MarkerKind::Failure,
                    matched: m.as_str().to_string(),
                });
            }
        }
        None
    }

    /// Collect artifact paths announced in a chunk. Each pattern's first
    /// capture group is the path; patterns without a group are skipped.
    pub fn scan_artifacts(&self, data: &str) -> Vec<String> {
        let mut paths = Vec::new();
        for re in &self.artifacts {
            for caps in re.captures_iter(data) {
                if let Some(path) = caps.get(1) {
                    paths.push(path.as_str().to_string());
                }
            }
        }
        paths
    }
}

/// Milliseconds between the marker sighting and `now`, clamped to zero when
/// clocks disagree.
pub fn time_saved_ms(marker_seen_at: Instant, now: Instant) -> u64 {
    u64::try_from(now.saturating_duration_since(marker_seen_at).as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn detector() -> CompletionDetector {
        CompletionDetector::compile(&DetectorConfig::default()).unwrap()
    }

    #[test]
    fn default_success_marker_matches() {
        let hit = detector().scan_markers("=== RESULT:::OK ===\n").unwrap();
        assert_eq!(hit.kind, MarkerKind::Success);
        assert!(hit.matched.contains("RESULT:::OK"));
    }

    #[test]
    fn default_failure_marker_matches() {
        let hit = detector().scan_markers("x === RESULT:::FAIL === y").unwrap();
        assert_eq!(hit.kind, MarkerKind::Failure);
    }

    #[test]
    fn word_boundaries_reject_embedded_tokens() {
        let d = detector();
        assert!(d.scan_markers("TASK_COMPLETE").is_some());
        // Suffix continues the word, so the boundary does not match.
        assert!(d.scan_markers("TASK_COMPLETED").is_none());
        assert!(d.scan_markers("all done here").is_none());
    }

    #[test]
    fn artifact_path_is_captured() {
        let d = detector();
        let paths = d.scan_artifacts("File created at /tmp/execd/report.json\n");
        assert_eq!(paths, vec!["/tmp/execd/report.json".to_string()]);

        let paths = d.scan_artifacts("output written to results/out.csv and more");
        assert_eq!(paths, vec!["results/out.csv".to_string()]);
    }

    #[test]
    fn time_saved_never_negative() {
        let now = Instant::now();
        let later = now + Duration::from_millis(250);
        assert_eq!(time_saved_ms(now, later), 250);
        // Marker "seen" after now — clamped, not panicking or wrapping.
        assert_eq!(time_saved_ms(later, now), 0);
    }
}
