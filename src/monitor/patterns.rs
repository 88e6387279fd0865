//! Log-derived signals: completion and failure markers, progress, metrics.
//!
//! Exit codes of launcher shells are unreliable for long training runs, so
//! job state is read from the log itself. Failure markers always win over
//! success markers within the same scan.

use std::collections::BTreeMap;

use regex::Regex;
use tracing::debug;

/// Only the tail of the log is scanned each tick.
pub const SCAN_WINDOW_LINES: usize = 1000;

const ERROR_CONTEXT_BEFORE: usize = 5;
const ERROR_CONTEXT_AFTER: usize = 20;

const FAILURE_PATTERNS: &[&str] = &[
    r"(?i)error:",
    r"(?i)exception:",
    r"(?i)traceback\s*\(most recent call last\)",
    r"CUDA\s+out\s+of\s+memory",
    r"(?i)cuda\s+error",
    r"(?i)no\s+module\s+named",
    r"(?i)failed",
    r"(?i)fatal",
    r"(?i)killed",
    r"(?i)exit\s+code\s*:\s*[1-9]",
];

const SUCCESS_PATTERNS: &[&str] = &[
    r"(?i)training\s+completed",
    r"(?i)experiment\s+(?:finished|completed|done)",
    r"(?i)all\s+tasks?\s+complete",
    r"(?i)final\s+results?:",
];

const EPOCH_PATTERN: &str = r"(?i)epoch[:\s]*(\d+)\s*/\s*(\d+)";

const METRIC_PATTERNS: &[(&str, &str)] = &[
    ("loss", r"(?i)loss[:\s]+([\d.]+)"),
    ("accuracy", r"(?i)acc(?:uracy)?[:\s=]+([\d.]+)"),
    ("auc", r"(?i)auc[:\s=]+([\d.]+)"),
    ("f1", r"(?i)f1[:\s=]+([\d.]+)"),
];

/// What a log scan concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum LogVerdict {
    /// A failure marker, with surrounding log context for the repair
    /// prompt.
    Failure { matched_line: String, detail: String },
    Success { matched_line: String },
}

/// Compiled marker sets for one job.
#[derive(Debug)]
pub struct MarkerSet {
    failure: Vec<Regex>,
    success: Vec<Regex>,
}

impl Default for MarkerSet {
    fn default() -> Self {
        Self {
            failure: compile_all(FAILURE_PATTERNS),
            success: compile_all(SUCCESS_PATTERNS),
        }
    }
}

impl MarkerSet {
    /// Default markers plus a job-specific completion pattern, which is
    /// tried before the built-in success markers. An invalid pattern is
    /// retried as a literal.
    pub fn with_completion_pattern(pattern: &str) -> Self {
        let mut set = Self::default();
        let compiled = Regex::new(pattern)
            .or_else(|_| Regex::new(&regex::escape(pattern)));
        match compiled {
            Ok(re) => set.success.insert(0, re),
            Err(e) => debug!(pattern, "unusable completion pattern: {e}"),
        }
        set
    }

    /// Scan the tail of the log. Failure markers are checked across the
    /// whole window before any success marker is considered.
    pub fn scan(&self, log: &str) -> Option<LogVerdict> {
        let lines: Vec<&str> = log.lines().collect();
        let start = lines.len().saturating_sub(SCAN_WINDOW_LINES);
        let window = &lines[start..];

        for (idx, line) in window.iter().enumerate() {
            if self.failure.iter().any(|re| re.is_match(line)) {
                return Some(LogVerdict::Failure {
                    matched_line: line.to_string(),
                    detail: error_context(window, idx),
                });
            }
        }

        for line in window {
            if self.success.iter().any(|re| re.is_match(line)) {
                return Some(LogVerdict::Success {
                    matched_line: line.to_string(),
                });
            }
        }
        None
    }
}

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("built-in pattern must compile"))
        .collect()
}

/// Lines around a failure marker, enough for an agent to diagnose from.
fn error_context(lines: &[&str], idx: usize) -> String {
    let start = idx.saturating_sub(ERROR_CONTEXT_BEFORE);
    let end = (idx + ERROR_CONTEXT_AFTER + 1).min(lines.len());
    lines[start..end].join("\n")
}

/// Latest progress readable from the log tail.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    /// `(current, total)` from the last epoch marker seen.
    pub epoch: Option<(u64, u64)>,
    pub metrics: BTreeMap<String, f64>,
}

impl ProgressSnapshot {
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some((current, total)) = self.epoch {
            parts.push(format!("epoch {current}/{total}"));
        }
        for (name, value) in &self.metrics {
            parts.push(format!("{name}={value:.4}"));
        }
        parts.join(", ")
    }
}

/// Parse epoch and metric values from the log tail, keeping the last
/// occurrence of each. Percentage-style values are normalized to [0, 1]
/// for everything except loss.
pub fn parse_progress(log: &str) -> ProgressSnapshot {
    let epoch_re = Regex::new(EPOCH_PATTERN).expect("built-in pattern must compile");
    let metric_res: Vec<(&str, Regex)> = METRIC_PATTERNS
        .iter()
        .map(|(name, p)| (*name, Regex::new(p).expect("built-in pattern must compile")))
        .collect();

    let mut snapshot = ProgressSnapshot::default();
    let lines: Vec<&str> = log.lines().collect();
    let start = lines.len().saturating_sub(SCAN_WINDOW_LINES);

    for line in &lines[start..] {
        if let Some(caps) = epoch_re.captures(line) {
            let current = caps[1].parse().ok();
            let total = caps[2].parse().ok();
            if let (Some(c), Some(t)) = (current, total) {
                snapshot.epoch = Some((c, t));
            }
        }
        for (name, re) in &metric_res {
            if let Some(caps) = re.captures(line) {
                if let Ok(mut value) = caps[1].parse::<f64>() {
                    if *name != "loss" && value > 1.0 {
                        value /= 100.0;
                    }
                    snapshot.metrics.insert((*name).to_string(), value);
                }
            }
        }
    }
    snapshot
}
