//! Per-round records: the six pipeline steps and their outputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::AgentKind;

/// The fixed six-step round pipeline, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    Understand,
    Analyze,
    Methodology,
    Experiment,
    Results,
    Conclusion,
}

impl StepId {
    pub const ALL: [StepId; 6] = [
        StepId::Understand,
        StepId::Analyze,
        StepId::Methodology,
        StepId::Experiment,
        StepId::Results,
        StepId::Conclusion,
    ];

    /// 1-based position in the pipeline.
    pub fn number(&self) -> u32 {
        match self {
            StepId::Understand => 1,
            StepId::Analyze => 2,
            StepId::Methodology => 3,
            StepId::Experiment => 4,
            StepId::Results => 5,
            StepId::Conclusion => 6,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StepId::Understand => "Goal Understanding",
            StepId::Analyze => "Problem Analysis",
            StepId::Methodology => "Methodology & Implementation",
            StepId::Experiment => "Experiment Execution",
            StepId::Results => "Result Analysis",
            StepId::Conclusion => "Conclusion",
        }
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Output of one pool member (or single agent) within a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub role: String,
    pub kind: AgentKind,
    pub text: String,
    pub duration_secs: f64,
    pub success: bool,
    #[serde(default)]
    pub error: String,
}

impl AgentOutput {
    pub fn success(role: impl Into<String>, kind: AgentKind, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            kind,
            text: text.into(),
            duration_secs: 0.0,
            success: true,
            error: String::new(),
        }
    }

    pub fn failure(role: impl Into<String>, kind: AgentKind, error: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            kind,
            text: String::new(),
            duration_secs: 0.0,
            success: false,
            error: error.into(),
        }
    }
}

/// One completed step: the raw member outputs, the critic report (if any),
/// and the synthesized text carried into later steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: StepId,
    pub outputs: Vec<AgentOutput>,
    #[serde(default)]
    pub critic_report: Option<String>,
    /// Set when a critic pass was expected but its invocation failed; the
    /// step proceeded on raw member outputs.
    #[serde(default)]
    pub critic_unavailable: bool,
    pub synthesized: String,
    pub duration_secs: f64,
    pub completed_at: DateTime<Utc>,
}

impl StepRecord {
    /// The text threaded into subsequent steps: the synthesis when present,
    /// otherwise the first member output.
    pub fn primary_output(&self) -> &str {
        if !self.synthesized.is_empty() {
            &self.synthesized
        } else {
            self.outputs.first().map(|o| o.text.as_str()).unwrap_or("")
        }
    }
}

/// Research direction declared by the Conclusion step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Continue,
    Pivot,
    Done,
}

/// One full pass through the pipeline. Appended to the session history when
/// complete and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round_num: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub conclusion: String,
    #[serde(default)]
    pub next_hypotheses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_metric: Option<String>,
    #[serde(default)]
    pub direction: Direction,
}

impl RoundRecord {
    pub fn new(round_num: u32) -> Self {
        Self {
            round_num,
            started_at: Utc::now(),
            finished_at: None,
            steps: Vec::new(),
            conclusion: String::new(),
            next_hypotheses: Vec::new(),
            best_metric: None,
            direction: Direction::Continue,
        }
    }

    pub fn step(&self, id: StepId) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step == id)
    }

    /// Record a completed step, replacing any earlier record for the same
    /// step id (a resumed run may re-execute a partially-completed step).
    pub fn record_step(&mut self, record: StepRecord) {
        self.steps.retain(|s| s.step != record.step);
        self.steps.push(record);
        self.steps.sort_by_key(|s| s.step);
    }

    /// The next step to execute, or `None` when the round is complete.
    pub fn next_step(&self) -> Option<StepId> {
        StepId::ALL.iter().copied().find(|id| self.step(*id).is_none())
    }

    pub fn is_complete(&self) -> bool {
        self.next_step().is_none()
    }
}
