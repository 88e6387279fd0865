//! Engine configuration.
//!
//! All knobs live in one `EngineConfig` value loaded from an optional
//! `warp.toml` in the working directory and overridden by CLI flags.
//! Every field has a serde default so a missing or partial file is fine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "warp.toml";

/// Default timeout for a single agent invocation (30 minutes).
pub const DEFAULT_INVOCATION_TIMEOUT_SECS: u64 = 30 * 60;

/// Absolute wall-clock ceiling for a monitored background job (24 hours).
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 24 * 3600;

/// No new log bytes for this long classifies a running job as stalled.
pub const DEFAULT_STALL_THRESHOLD_SECS: u64 = 10 * 60;

/// Auto-repair retry cap for monitored jobs.
pub const DEFAULT_MAX_JOB_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Number of research rounds per session.
    pub rounds: u32,
    /// Pool size for the Problem Analysis step.
    pub analysts: usize,
    /// Pool size for the implementation half of the Methodology step.
    pub implementers: usize,
    /// Pool size for the Experiment Execution step.
    pub experiments: usize,
    /// Concurrency bound for parallel-eligible units within a wave.
    pub max_parallel: usize,
    /// Per-invocation timeout in seconds.
    pub invocation_timeout_secs: u64,
    /// Wall-clock ceiling for one monitored job attempt, in seconds.
    pub job_timeout_secs: u64,
    /// Stall threshold for monitored jobs, in seconds.
    pub stall_threshold_secs: u64,
    /// Auto-repair retry cap per monitored job.
    pub max_job_retries: u32,
    /// Minimum free device memory (GB) a device must have to be allocated.
    pub min_free_memory_gb: Option<f64>,
    /// Maximum device utilization (%) for a device to be allocated.
    pub max_device_utilization: u32,
    /// Command line template per agent kind. The prompt is appended as the
    /// final argument. Example: `reasoner = "claude --print"`.
    pub agent_commands: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut agent_commands = HashMap::new();
        agent_commands.insert(
            "reasoner".to_string(),
            "claude --print --permission-mode bypassPermissions".to_string(),
        );
        agent_commands.insert("coder".to_string(), "codex exec".to_string());

        Self {
            rounds: 3,
            analysts: 2,
            implementers: 2,
            experiments: 2,
            max_parallel: 4,
            invocation_timeout_secs: DEFAULT_INVOCATION_TIMEOUT_SECS,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            stall_threshold_secs: DEFAULT_STALL_THRESHOLD_SECS,
            max_job_retries: DEFAULT_MAX_JOB_RETRIES,
            min_free_memory_gb: None,
            max_device_utilization: 30,
            agent_commands,
        }
    }
}

impl EngineConfig {
    /// Load config from `warp.toml` under `dir`, falling back to defaults
    /// when the file does not exist.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    /// Command line for an agent kind, falling back to the reasoner command
    /// for kinds with no explicit entry.
    pub fn agent_command(&self, kind: &str) -> Option<&str> {
        self.agent_commands
            .get(kind)
            .or_else(|| self.agent_commands.get("reasoner"))
            .map(String::as_str)
    }
}
