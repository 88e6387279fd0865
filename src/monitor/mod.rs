//! Background job supervision.
//!
//! A background job is a detached shell command writing to a log file. The
//! supervisor polls the log on an adaptive schedule and decides the job's
//! fate from log markers, process exit, inactivity, and a hard runtime
//! ceiling.

pub mod directive;
pub mod patterns;
pub mod recovery;

pub use directive::{contains_directive, parse_directive, JobDirective};
pub use patterns::{parse_progress, LogVerdict, MarkerSet, ProgressSnapshot};
pub use recovery::{run_with_recovery, JobReport};

use std::fs::{File, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::process::terminate_process;
use crate::resources::DeviceAllocator;

/// Lines of log tail handed to the repair agent.
const REPAIR_LOG_TAIL_LINES: usize = 300;

const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Polling and deadline parameters for one supervised job.
///
/// Early failures (import errors, bad paths, OOM on first batch) surface in
/// the first minutes, so polling starts tight and relaxes once the job has
/// proven it can run.
#[derive(Debug, Clone)]
pub struct MonitorTiming {
    pub initial_interval: Duration,
    pub initial_window: Duration,
    pub steady_interval: Duration,
    /// No stall verdict before this much runtime has elapsed.
    pub stall_grace: Duration,
    /// Log inactivity beyond this is a stall.
    pub stall_threshold: Duration,
    /// Absolute runtime ceiling.
    pub timeout: Duration,
}

impl MonitorTiming {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            initial_window: Duration::from_secs(300),
            steady_interval: Duration::from_secs(60),
            stall_grace: Duration::from_secs(120),
            stall_threshold: config.stall_threshold(),
            timeout: config.job_timeout(),
        }
    }

    pub fn poll_interval(&self, elapsed: Duration) -> Duration {
        if elapsed < self.initial_window {
            self.initial_interval
        } else {
            self.steady_interval
        }
    }

    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            initial_interval: Duration::from_millis(50),
            initial_window: Duration::from_secs(60),
            steady_interval: Duration::from_millis(50),
            stall_grace: Duration::from_millis(200),
            stall_threshold: Duration::from_secs(3600),
            timeout: Duration::from_secs(3600),
        }
    }
}

/// One job to supervise.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: String,
    pub command: String,
    pub log_file: PathBuf,
    pub completion_pattern: Option<String>,
    /// Device index to pin via `CUDA_VISIBLE_DEVICES`.
    pub device: Option<u32>,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Completed,
    Failed,
    Stalled,
    TimedOut,
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stalled => "stalled",
            JobStatus::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}

/// Outcome of a single supervised attempt.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    /// Error context for failed attempts, fed into the repair prompt.
    pub detail: String,
    pub progress: ProgressSnapshot,
    pub log_tail: String,
    pub elapsed: Duration,
}

/// Launch and supervise one attempt of a background job to completion.
///
/// `Err` means the job could not be launched at all; every launched job
/// produces a [`JobOutcome`], however it ends. Setting `cancel` terminates
/// the process and ends the attempt as failed.
pub fn run_job(spec: &JobSpec, timing: &MonitorTiming, cancel: &AtomicBool) -> Result<JobOutcome> {
    let markers = match &spec.completion_pattern {
        Some(pattern) => MarkerSet::with_completion_pattern(pattern),
        None => MarkerSet::default(),
    };

    if let Some(parent) = spec.log_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    // Each attempt starts on a truncated log; a failure marker left by an
    // earlier attempt must not decide this one.
    File::create(&spec.log_file)
        .with_context(|| format!("failed to truncate log file {}", spec.log_file.display()))?;
    let log_out = log_handle(&spec.log_file)?;
    let log_err = log_handle(&spec.log_file)?;

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&spec.command)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_out))
        .stderr(Stdio::from(log_err))
        // Own process group; a terminal interrupt must not take the job down.
        .process_group(0);
    if let Some(value) = DeviceAllocator::visibility_env(spec.device) {
        command.env("CUDA_VISIBLE_DEVICES", value);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to launch job '{}'", spec.id))?;
    let pid = child.id();
    info!(job = %spec.id, pid, log = %spec.log_file.display(), "background job launched");

    let started = Instant::now();
    loop {
        thread::sleep(timing.poll_interval(started.elapsed()));
        let elapsed = started.elapsed();
        let log = read_log(&spec.log_file);

        if cancel.load(Ordering::SeqCst) {
            warn!(job = %spec.id, "cancel requested, terminating job");
            terminate_process(pid, TERMINATE_GRACE);
            let _ = child.wait();
            let detail = "cancelled on operator request".to_string();
            return Ok(outcome(JobStatus::Failed, detail, &log, elapsed));
        }

        // Markers first: a failure line in the log outranks a process
        // that is still running.
        if let Some(verdict) = markers.scan(&log) {
            let _ = child.try_wait();
            terminate_process(pid, TERMINATE_GRACE);
            let _ = child.wait();
            return Ok(match verdict {
                LogVerdict::Failure { matched_line, detail } => {
                    warn!(job = %spec.id, line = %matched_line, "failure marker in log");
                    outcome(JobStatus::Failed, detail, &log, elapsed)
                }
                LogVerdict::Success { matched_line } => {
                    debug!(job = %spec.id, line = %matched_line, "completion marker in log");
                    outcome(JobStatus::Completed, String::new(), &log, elapsed)
                }
            });
        }

        if let Some(status) = child.try_wait()? {
            let log = read_log(&spec.log_file);
            if let Some(LogVerdict::Failure { detail, .. }) = markers.scan(&log) {
                return Ok(outcome(JobStatus::Failed, detail, &log, elapsed));
            }
            return Ok(if status.success() {
                outcome(JobStatus::Completed, String::new(), &log, elapsed)
            } else {
                let detail = format!("process exited with {status}\n{}", tail(&log));
                outcome(JobStatus::Failed, detail, &log, elapsed)
            });
        }

        if elapsed > timing.timeout {
            warn!(job = %spec.id, "job exceeded runtime ceiling");
            terminate_process(pid, TERMINATE_GRACE);
            let _ = child.wait();
            let detail = format!("job exceeded the {}s runtime ceiling", timing.timeout.as_secs());
            return Ok(outcome(JobStatus::TimedOut, detail, &log, elapsed));
        }

        if elapsed > timing.stall_grace {
            if let Some(idle) = log_idle_time(&spec.log_file) {
                if idle > timing.stall_threshold {
                    warn!(job = %spec.id, idle_secs = idle.as_secs(), "job stalled");
                    terminate_process(pid, TERMINATE_GRACE);
                    let _ = child.wait();
                    let detail = format!(
                        "no log activity for {}s (threshold {}s)\n{}",
                        idle.as_secs(),
                        timing.stall_threshold.as_secs(),
                        tail(&log)
                    );
                    return Ok(outcome(JobStatus::Stalled, detail, &log, elapsed));
                }
            }
        }
    }
}

fn outcome(status: JobStatus, detail: String, log: &str, elapsed: Duration) -> JobOutcome {
    JobOutcome {
        status,
        detail,
        progress: parse_progress(log),
        log_tail: tail(log),
        elapsed,
    }
}

fn log_handle(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

fn read_log(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

fn log_idle_time(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Last lines of the log, for repair prompts and failure reports.
pub fn tail(log: &str) -> String {
    let lines: Vec<&str> = log.lines().collect();
    let start = lines.len().saturating_sub(REPAIR_LOG_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn spec(dir: &Path, id: &str, command: &str) -> JobSpec {
        JobSpec {
            id: id.to_string(),
            command: command.to_string(),
            log_file: dir.join(format!("{id}.log")),
            completion_pattern: None,
            device: None,
            cwd: dir.to_path_buf(),
        }
    }

    fn no_cancel() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn test_clean_exit_completes() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(dir.path(), "clean", "echo 'epoch 1/1'; echo 'loss: 0.5'");
        let out = run_job(&spec, &MonitorTiming::fast(), &no_cancel()).unwrap();
        assert_eq!(out.status, JobStatus::Completed);
        assert_eq!(out.progress.epoch, Some((1, 1)));
    }

    #[test]
    fn test_failure_marker_beats_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(
            dir.path(),
            "marked",
            "echo 'RuntimeError exception: shape mismatch'; exit 0",
        );
        let out = run_job(&spec, &MonitorTiming::fast(), &no_cancel()).unwrap();
        assert_eq!(out.status, JobStatus::Failed);
        assert!(out.detail.contains("shape mismatch"));
    }

    #[test]
    fn test_nonzero_exit_without_markers_fails() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(dir.path(), "exit2", "echo 'partial work'; exit 2");
        let out = run_job(&spec, &MonitorTiming::fast(), &no_cancel()).unwrap();
        assert_eq!(out.status, JobStatus::Failed);
        assert!(out.detail.contains("exited with"));
    }

    #[test]
    fn test_stale_failure_marker_is_cleared_at_launch() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(dir.path(), "stale", "echo 'Training completed'");
        std::fs::write(&spec.log_file, "error: no module named torch\n").unwrap();
        let out = run_job(&spec, &MonitorTiming::fast(), &no_cancel()).unwrap();
        assert_eq!(out.status, JobStatus::Completed);
        assert!(!out.log_tail.contains("no module named torch"));
    }

    // These assert on wall-clock windows; run them one at a time.
    #[test]
    #[serial]
    fn test_completion_marker_ends_a_lingering_process() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(
            dir.path(),
            "linger",
            "echo 'Training completed'; sleep 30",
        );
        let started = Instant::now();
        let out = run_job(&spec, &MonitorTiming::fast(), &no_cancel()).unwrap();
        assert_eq!(out.status, JobStatus::Completed);
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    #[serial]
    fn test_runtime_ceiling_kills_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(dir.path(), "ceiling", "sleep 30");
        let mut timing = MonitorTiming::fast();
        timing.timeout = Duration::from_millis(300);
        let started = Instant::now();
        let out = run_job(&spec, &timing, &no_cancel()).unwrap();
        assert_eq!(out.status, JobStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    #[serial]
    fn test_stalled_job_is_detected_and_killed() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(dir.path(), "stall", "echo 'started'; sleep 30");
        let mut timing = MonitorTiming::fast();
        timing.stall_threshold = Duration::from_millis(400);
        let out = run_job(&spec, &timing, &no_cancel()).unwrap();
        assert_eq!(out.status, JobStatus::Stalled);
        assert!(out.detail.contains("no log activity"));
    }

    #[test]
    #[serial]
    fn test_cancel_terminates_a_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(dir.path(), "cancel", "sleep 30");
        let cancel = AtomicBool::new(false);
        let started = Instant::now();
        let out = thread::scope(|scope| {
            let handle = scope.spawn(|| run_job(&spec, &MonitorTiming::fast(), &cancel));
            thread::sleep(Duration::from_millis(200));
            cancel.store(true, Ordering::SeqCst);
            handle.join().unwrap()
        })
        .unwrap();
        assert_eq!(out.status, JobStatus::Failed);
        assert!(out.detail.contains("cancelled"));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn test_custom_completion_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec(dir.path(), "custom", "echo 'WROTE predictions.csv'; sleep 30");
        spec.completion_pattern = Some(r"WROTE\s+predictions\.csv".to_string());
        let out = run_job(&spec, &MonitorTiming::fast(), &no_cancel()).unwrap();
        assert_eq!(out.status, JobStatus::Completed);
    }

    #[test]
    fn test_unlaunchable_job_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec(dir.path(), "bad-cwd", "echo hi");
        spec.cwd = dir.path().join("no/such/dir");
        assert!(run_job(&spec, &MonitorTiming::fast(), &no_cancel()).is_err());
    }

    #[test]
    fn test_tail_caps_line_count() {
        let log: String = (0..400).map(|i| format!("line {i}\n")).collect();
        let tail = tail(&log);
        assert!(tail.starts_with("line 100"));
        assert!(tail.ends_with("line 399"));
    }
}
