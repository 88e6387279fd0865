//! Engine error taxonomy.
//!
//! These are the errors that cross component boundaries. Per-member agent
//! failures inside a pool or a wave are data (recorded on the output),
//! not errors; only conditions that abort a step, a round, or the whole
//! session surface through this enum.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed dependency graph: cycle, unknown dependency, or duplicate
    /// unit id. Aborts the run before any unit executes.
    #[error("graph error: {0}")]
    Graph(String),

    /// Every member of an agent pool failed. Fatal to the owning step;
    /// the session checkpoint still points at the step so a resume with an
    /// adjusted pool size restarts exactly there.
    #[error("all {member_count} pool member(s) failed in step '{step}'")]
    PoolExhausted { step: String, member_count: usize },

    /// The synthesis invocation failed. The step has no carried-forward
    /// output, so it cannot complete.
    #[error("synthesis failed in step '{step}': {reason}")]
    SynthesisFailed { step: String, reason: String },

    /// A monitored background job exhausted its retry budget. Reported to
    /// the round as a failed experiment member, never as a crash.
    #[error("job '{job_id}' failed after {attempts} attempt(s): {reason}")]
    JobFailure {
        job_id: String,
        attempts: u32,
        reason: String,
    },

    /// Snapshot write or read failure. Fatal to the session: continuing
    /// would risk silent loss of completed work on the next resume.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The plan generator did not return a usable task graph.
    #[error("planning failed: {0}")]
    PlanningFailed(String),
}

impl EngineError {
    pub fn graph(msg: impl Into<String>) -> Self {
        EngineError::Graph(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        EngineError::Persistence(msg.into())
    }

    pub fn planning(msg: impl Into<String>) -> Self {
        EngineError::PlanningFailed(msg.into())
    }
}
