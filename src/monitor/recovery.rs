//! Bounded auto-repair for failed background jobs.
//!
//! A failed attempt is handed back to a coder agent together with the
//! original task and the error log; the agent answers with a revised
//! directive which becomes the next attempt. The loop is bounded by
//! `max_job_retries`, and an agent that cannot produce a usable revised
//! directive ends the loop early.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::agents::{AgentInvoker, AgentKind};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::monitor::directive::{parse_directive, JobDirective};
use crate::monitor::{run_job, JobSpec, JobStatus, MonitorTiming, ProgressSnapshot};

const REPAIR_PROMPT: &str = "\
A background experiment you implemented has failed. Diagnose the error and
produce a corrected version.

ORIGINAL TASK:
{task}

EXPERIMENT NAME: {job_id}

PREVIOUS COMMAND:
{command}

ERROR LOG (tail):
{error_log}

Fix the underlying problem. Modify code or configuration files as needed,
then respond in the same format as before:

BACKGROUND_TASK: <short name>
COMMAND: <the corrected command to run>
LOG_FILE: <log file path>
COMPLETION_PATTERN: <pattern marking success, optional>
";

/// Final word on a supervised job after all attempts.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: String,
    pub status: JobStatus,
    /// Attempts beyond the first.
    pub retry_count: u32,
    pub progress: ProgressSnapshot,
    pub detail: String,
}

impl JobReport {
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }

    /// Result block carried into the round record.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("EXPERIMENT: {}", self.job_id)];
        match self.status {
            JobStatus::Completed => {
                lines.push("STATUS: SUCCESS (background job completed)".to_string());
            }
            other => lines.push(format!("STATUS: FAILED ({other})")),
        }
        lines.push(format!("ATTEMPTS: {}", self.attempts()));
        let progress = self.progress.summary();
        if !progress.is_empty() {
            lines.push(format!("METRICS: {progress}"));
        }
        if !self.detail.is_empty() {
            lines.push(format!("ERROR: {}", self.detail));
        }
        lines.join("\n")
    }
}

/// Run a background job with bounded repair-and-retry.
///
/// Each attempt starts over from scratch on a truncated log rather than
/// resuming the previous process. A cancel signal ends the loop without a
/// repair pass. Permanent failure is an [`EngineError::JobFailure`].
#[allow(clippy::too_many_arguments)]
pub fn run_with_recovery(
    invoker: &dyn AgentInvoker,
    config: &EngineConfig,
    timing: &MonitorTiming,
    job_id: &str,
    task_context: &str,
    initial: JobDirective,
    device: Option<u32>,
    cwd: &Path,
    logs_dir: &Path,
    cancel: &AtomicBool,
) -> Result<JobReport, EngineError> {
    let max_retries = config.max_job_retries;
    let mut directive = initial;
    let mut retry_count: u32 = 0;

    loop {
        let spec = attempt_spec(job_id, &directive, retry_count, device, cwd, logs_dir);
        info!(job = job_id, attempt = retry_count + 1, command = %spec.command, "running background job");

        let outcome = run_job(&spec, timing, cancel).map_err(|e| EngineError::JobFailure {
            job_id: job_id.to_string(),
            attempts: retry_count + 1,
            reason: format!("launch failed: {e:#}"),
        })?;

        if outcome.status.is_success() {
            return Ok(JobReport {
                job_id: job_id.to_string(),
                status: JobStatus::Completed,
                retry_count,
                progress: outcome.progress,
                detail: String::new(),
            });
        }

        warn!(job = job_id, attempt = retry_count + 1, status = %outcome.status, "job attempt failed");

        if cancel.load(Ordering::SeqCst) {
            return Err(EngineError::JobFailure {
                job_id: job_id.to_string(),
                attempts: retry_count + 1,
                reason: "cancelled on operator request".to_string(),
            });
        }

        if retry_count >= max_retries {
            return Err(EngineError::JobFailure {
                job_id: job_id.to_string(),
                attempts: retry_count + 1,
                reason: format!("{}: {}", outcome.status, first_line(&outcome.detail)),
            });
        }

        let error_log = if outcome.detail.is_empty() {
            outcome.log_tail.clone()
        } else {
            outcome.detail.clone()
        };
        directive = match request_repair(invoker, config, job_id, task_context, &directive, &error_log, cwd) {
            Ok(d) => d,
            Err(reason) => {
                return Err(EngineError::JobFailure {
                    job_id: job_id.to_string(),
                    attempts: retry_count + 1,
                    reason: format!("{}: {}; repair abandoned: {reason}", outcome.status, first_line(&outcome.detail)),
                });
            }
        };
        retry_count += 1;
    }
}

fn attempt_spec(
    job_id: &str,
    directive: &JobDirective,
    retry_count: u32,
    device: Option<u32>,
    cwd: &Path,
    logs_dir: &Path,
) -> JobSpec {
    let log_file = match &directive.log_file {
        Some(path) => cwd.join(path),
        None => logs_dir.join(format!("{job_id}_attempt{}.log", retry_count + 1)),
    };
    JobSpec {
        id: job_id.to_string(),
        command: directive.command.clone(),
        log_file,
        completion_pattern: directive.completion_pattern.clone(),
        device,
        cwd: cwd.to_path_buf(),
    }
}

fn request_repair(
    invoker: &dyn AgentInvoker,
    config: &EngineConfig,
    job_id: &str,
    task_context: &str,
    failed: &JobDirective,
    error_log: &str,
    cwd: &Path,
) -> Result<JobDirective, String> {
    let prompt = REPAIR_PROMPT
        .replace("{task}", task_context)
        .replace("{job_id}", job_id)
        .replace("{command}", &failed.command)
        .replace("{error_log}", error_log);

    let output = invoker
        .invoke(AgentKind::Coder, &prompt, cwd, config.invocation_timeout())
        .map_err(|e| format!("repair invocation failed: {e:#}"))?;
    if !output.success() {
        return Err(format!("repair agent failed: {}", output.failure_reason()));
    }

    match parse_directive(&output.text) {
        Ok(Some(directive)) => Ok(directive),
        Ok(None) => Err("repair output contained no background task directive".to_string()),
        Err(e) => Err(e),
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::ScriptedInvoker;

    fn quick_config() -> EngineConfig {
        EngineConfig::default()
    }

    fn directive(command: &str) -> JobDirective {
        JobDirective {
            command: command.to_string(),
            log_file: None,
            completion_pattern: None,
            estimated_time: None,
        }
    }

    #[test]
    fn test_first_attempt_success_needs_no_repair() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = ScriptedInvoker::new();
        let report = run_with_recovery(
            &invoker,
            &quick_config(),
            &MonitorTiming::fast(),
            "exp1",
            "train the baseline",
            directive("echo 'loss: 0.4'; echo 'Training completed'"),
            None,
            dir.path(),
            dir.path(),
            &AtomicBool::new(false),
        )
        .unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.retry_count, 0);
        assert_eq!(report.attempts(), 1);
        assert!(invoker.invocations().is_empty());
        assert!(report.summary().contains("STATUS: SUCCESS"));
    }

    #[test]
    fn test_failed_attempt_is_repaired_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = ScriptedInvoker::new();
        invoker.on(
            "has failed",
            "Fixed the import path.\n\nBACKGROUND_TASK: retry\nCOMMAND: echo 'auc: 0.82'; echo 'Training completed'\n",
        );

        let report = run_with_recovery(
            &invoker,
            &quick_config(),
            &MonitorTiming::fast(),
            "exp2",
            "train the wide model",
            directive("echo 'error: no module named torch'"),
            None,
            dir.path(),
            dir.path(),
            &AtomicBool::new(false),
        )
        .unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.retry_count, 1);
        assert!((report.progress.metrics["auc"] - 0.82).abs() < 1e-9);

        // The repair prompt carried the original task and the error.
        let repairs = invoker.prompts_containing("has failed");
        assert_eq!(repairs.len(), 1);
        assert!(repairs[0].contains("train the wide model"));
        assert!(repairs[0].contains("no module named torch"));
    }

    #[test]
    fn test_retry_budget_exhaustion_is_permanent_failure() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = ScriptedInvoker::new();
        invoker.on(
            "has failed",
            "BACKGROUND_TASK: retry\nCOMMAND: echo 'error: still broken'\n",
        );

        let mut config = quick_config();
        config.max_job_retries = 2;

        let err = run_with_recovery(
            &invoker,
            &config,
            &MonitorTiming::fast(),
            "exp3",
            "task",
            directive("echo 'error: broken'"),
            None,
            dir.path(),
            dir.path(),
            &AtomicBool::new(false),
        )
        .unwrap_err();

        match err {
            EngineError::JobFailure { job_id, attempts, .. } => {
                assert_eq!(job_id, "exp3");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected JobFailure, got {other}"),
        }
        assert_eq!(invoker.prompts_containing("has failed").len(), 2);
    }

    #[test]
    fn test_unparseable_repair_stops_the_loop_early() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = ScriptedInvoker::new();
        invoker.on("has failed", "I cannot figure out what is wrong with this job.");

        let err = run_with_recovery(
            &invoker,
            &quick_config(),
            &MonitorTiming::fast(),
            "exp4",
            "task",
            directive("echo 'fatal: disk full'"),
            None,
            dir.path(),
            dir.path(),
            &AtomicBool::new(false),
        )
        .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("repair abandoned"));
        // Only one job attempt ran.
        assert_eq!(invoker.prompts_containing("has failed").len(), 1);
    }

    #[test]
    fn test_explicit_log_file_is_reusable_across_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = ScriptedInvoker::new();
        invoker.on(
            "has failed",
            "Installed the missing package.\n\nBACKGROUND_TASK: retry\nCOMMAND: echo 'Training completed'\nLOG_FILE: shared.log\n",
        );

        let report = run_with_recovery(
            &invoker,
            &quick_config(),
            &MonitorTiming::fast(),
            "exp_shared_log",
            "task",
            JobDirective {
                command: "echo 'error: no module named torch'".to_string(),
                log_file: Some("shared.log".to_string()),
                completion_pattern: None,
                estimated_time: None,
            },
            None,
            dir.path(),
            dir.path(),
            &AtomicBool::new(false),
        )
        .unwrap();

        // The first attempt's failure marker in shared.log must not
        // condemn the second attempt.
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.retry_count, 1);
        let log = std::fs::read_to_string(dir.path().join("shared.log")).unwrap();
        assert!(!log.contains("no module named torch"));
    }

    #[test]
    fn test_each_attempt_writes_a_fresh_log() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = ScriptedInvoker::new();
        invoker.on(
            "has failed",
            "BACKGROUND_TASK: retry\nCOMMAND: echo 'Training completed'\n",
        );

        run_with_recovery(
            &invoker,
            &quick_config(),
            &MonitorTiming::fast(),
            "exp5",
            "task",
            directive("echo 'error: first try'"),
            None,
            dir.path(),
            dir.path(),
            &AtomicBool::new(false),
        )
        .unwrap();

        assert!(dir.path().join("exp5_attempt1.log").exists());
        assert!(dir.path().join("exp5_attempt2.log").exists());
    }
}
