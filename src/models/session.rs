//! Persisted session state.
//!
//! `SessionState` is an explicit value passed through every top-level
//! operation; the session store owns its on-disk representation. There is
//! no ambient singleton.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::models::round::{RoundRecord, StepId};
use crate::plan::Plan;

/// Bumped whenever the snapshot layout changes incompatibly.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Longest slice of a prior conclusion injected into prompts.
const CONCLUSION_CONTEXT_CHARS: usize = 800;

/// Longest slice of a step output injected into prompts.
const STEP_CONTEXT_CHARS: usize = 1500;

/// How many recent rounds are visible to prompts.
const ROUND_CONTEXT_WINDOW: usize = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// N-round research loop.
    Research,
    /// One-shot plan execution.
    Plan,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Cancelled,
}

impl SessionStatus {
    /// `InProgress` may complete or cancel; the terminal states accept no
    /// further transitions.
    pub fn try_transition(self, new_status: SessionStatus) -> Result<SessionStatus> {
        match (self, new_status) {
            (SessionStatus::InProgress, SessionStatus::Completed)
            | (SessionStatus::InProgress, SessionStatus::Cancelled) => Ok(new_status),
            (from, to) if from == to => Ok(to),
            (from, to) => bail!("invalid session transition: {from:?} -> {to:?}"),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Context produced by one round and consumed by the next. An explicit
/// accumulator rather than shared memory, so rounds replay independently.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Carryover {
    pub hypotheses: Vec<String>,
    pub learnings: Vec<String>,
}

impl Carryover {
    pub fn as_prompt_context(&self) -> String {
        if self.hypotheses.is_empty() && self.learnings.is_empty() {
            return "No carried-over context yet.".to_string();
        }
        let mut parts = Vec::new();
        if !self.hypotheses.is_empty() {
            let items: Vec<String> =
                self.hypotheses.iter().map(|h| format!("  - {h}")).collect();
            parts.push(format!("Open hypotheses:\n{}", items.join("\n")));
        }
        if !self.learnings.is_empty() {
            let items: Vec<String> =
                self.learnings.iter().map(|l| format!("  - {l}")).collect();
            parts.push(format!("Learnings so far:\n{}", items.join("\n")));
        }
        parts.join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub version: u32,
    pub id: String,
    pub kind: SessionKind,
    pub goal: String,
    pub cwd: PathBuf,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    // Research sessions.
    #[serde(default)]
    pub total_rounds: u32,
    #[serde(default)]
    pub rounds: Vec<RoundRecord>,
    #[serde(default)]
    pub carryover: Carryover,

    // Plan sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub completed_units: Vec<String>,
    #[serde(default)]
    pub unit_outputs: HashMap<String, String>,
}

impl SessionState {
    pub fn new_research(goal: impl Into<String>, cwd: PathBuf, total_rounds: u32) -> Self {
        let goal = goal.into();
        let now = Utc::now();
        Self {
            version: SNAPSHOT_VERSION,
            id: generate_id(&goal),
            kind: SessionKind::Research,
            goal,
            cwd,
            status: SessionStatus::InProgress,
            created_at: now,
            updated_at: now,
            total_rounds,
            rounds: Vec::new(),
            carryover: Carryover::default(),
            plan: None,
            completed_units: Vec::new(),
            unit_outputs: HashMap::new(),
        }
    }

    pub fn new_plan(goal: impl Into<String>, cwd: PathBuf, plan: Plan) -> Self {
        let goal = goal.into();
        let now = Utc::now();
        Self {
            version: SNAPSHOT_VERSION,
            id: generate_id(&goal),
            kind: SessionKind::Plan,
            goal,
            cwd,
            status: SessionStatus::InProgress,
            created_at: now,
            updated_at: now,
            total_rounds: 0,
            rounds: Vec::new(),
            carryover: Carryover::default(),
            plan: Some(plan),
            completed_units: Vec::new(),
            unit_outputs: HashMap::new(),
        }
    }

    pub fn try_mark_completed(&mut self) -> Result<()> {
        self.status = self.status.try_transition(SessionStatus::Completed)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn try_mark_cancelled(&mut self) -> Result<()> {
        self.status = self.status.try_transition(SessionStatus::Cancelled)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// The round currently in flight, if any.
    pub fn current_round(&self) -> Option<&RoundRecord> {
        self.rounds.last().filter(|r| r.finished_at.is_none())
    }

    /// Number of fully completed rounds.
    pub fn completed_rounds(&self) -> u32 {
        self.rounds
            .iter()
            .filter(|r| r.finished_at.is_some())
            .count() as u32
    }

    pub fn mark_unit_done(&mut self, unit_id: &str, output: &str) {
        if !self.completed_units.iter().any(|id| id == unit_id) {
            self.completed_units.push(unit_id.to_string());
        }
        self.unit_outputs
            .insert(unit_id.to_string(), output.to_string());
        self.updated_at = Utc::now();
    }

    /// Short progress description for session listings.
    pub fn progress_label(&self) -> String {
        match self.kind {
            SessionKind::Research => {
                format!("Round {}/{}", self.completed_rounds(), self.total_rounds)
            }
            SessionKind::Plan => {
                let total = self.plan.as_ref().map(|p| p.units.len()).unwrap_or(0);
                format!("{}/{} units", self.completed_units.len(), total)
            }
        }
    }

    /// Identifier of the last persisted checkpoint, quoted verbatim in
    /// fatal errors so resume instructions are exact.
    pub fn checkpoint_label(&self) -> String {
        match self.kind {
            SessionKind::Research => match self.rounds.last() {
                None => "session start".to_string(),
                Some(round) => match round.steps.last() {
                    Some(step) => format!(
                        "round {}, step {} ({})",
                        round.round_num,
                        step.step.number(),
                        step.step.name()
                    ),
                    None => format!("round {} start", round.round_num),
                },
            },
            SessionKind::Plan => format!("{} unit(s) completed", self.completed_units.len()),
        }
    }

    /// Conclusions and hypotheses of the most recent rounds, bounded for
    /// prompt injection.
    pub fn round_context(&self) -> String {
        let finished: Vec<&RoundRecord> = self
            .rounds
            .iter()
            .filter(|r| r.finished_at.is_some())
            .collect();
        if finished.is_empty() {
            return "No previous rounds.".to_string();
        }
        let mut parts = Vec::new();
        let window_start = finished.len().saturating_sub(ROUND_CONTEXT_WINDOW);
        for round in &finished[window_start..] {
            parts.push(format!("=== Round {} ===", round.round_num));
            if !round.conclusion.is_empty() {
                parts.push(format!(
                    "Conclusion: {}",
                    truncate_chars(&round.conclusion, CONCLUSION_CONTEXT_CHARS)
                ));
            }
            if !round.next_hypotheses.is_empty() {
                let items: Vec<String> = round
                    .next_hypotheses
                    .iter()
                    .map(|h| format!("  - {h}"))
                    .collect();
                parts.push(format!("Next hypotheses:\n{}", items.join("\n")));
            }
            if let Some(metric) = &round.best_metric {
                parts.push(format!("Best metric: {metric}"));
            }
        }
        parts.join("\n")
    }

    /// Primary outputs of this round's earlier steps, bounded per step.
    pub fn step_context(&self, round: &RoundRecord, up_to: StepId) -> String {
        let mut parts = Vec::new();
        for id in StepId::ALL {
            if id >= up_to {
                break;
            }
            if let Some(step) = round.step(id) {
                let output = truncate_chars(step.primary_output(), STEP_CONTEXT_CHARS);
                parts.push(format!("[Step: {}]\n{}", step.step.name(), output));
            }
        }
        parts.join("\n\n")
    }
}

fn generate_id(goal: &str) -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let uuid_short = uuid::Uuid::new_v4()
        .to_string()
        .split('-')
        .next()
        .unwrap_or("")
        .to_string();
    format!("{timestamp}_{}_{uuid_short}", slugify(goal))
}

fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for ch in text.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
        } else if ch.is_whitespace() || ch == '-' || ch == '_' {
            if !slug.ends_with('_') {
                slug.push('_');
            }
        }
        if slug.len() >= 40 {
            break;
        }
    }
    slug.trim_matches('_').to_string()
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}\n... [truncated]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentKind;
    use crate::models::round::{AgentOutput, StepRecord};

    fn finished_round(num: u32, conclusion: &str) -> RoundRecord {
        let mut round = RoundRecord::new(num);
        round.conclusion = conclusion.to_string();
        round.finished_at = Some(Utc::now());
        round
    }

    #[test]
    fn test_status_transitions() {
        assert!(SessionStatus::InProgress
            .try_transition(SessionStatus::Completed)
            .is_ok());
        assert!(SessionStatus::InProgress
            .try_transition(SessionStatus::Cancelled)
            .is_ok());
        assert!(SessionStatus::Completed
            .try_transition(SessionStatus::InProgress)
            .is_err());
        assert!(SessionStatus::Cancelled
            .try_transition(SessionStatus::Completed)
            .is_err());
    }

    #[test]
    fn test_id_embeds_goal_slug() {
        let state = SessionState::new_research("Improve AUROC by 5%", PathBuf::from("."), 3);
        assert!(state.id.contains("improve_auroc_by_5"));
    }

    #[test]
    fn test_round_context_windows_last_three() {
        let mut state = SessionState::new_research("goal", PathBuf::from("."), 5);
        for i in 1..=5 {
            state.rounds.push(finished_round(i, &format!("conclusion {i}")));
        }
        let ctx = state.round_context();
        assert!(!ctx.contains("=== Round 1 ==="));
        assert!(!ctx.contains("=== Round 2 ==="));
        assert!(ctx.contains("=== Round 3 ==="));
        assert!(ctx.contains("=== Round 5 ==="));
    }

    #[test]
    fn test_round_context_truncates_long_conclusions() {
        let mut state = SessionState::new_research("goal", PathBuf::from("."), 1);
        state.rounds.push(finished_round(1, &"x".repeat(5000)));
        let ctx = state.round_context();
        assert!(ctx.contains("... [truncated]"));
        assert!(ctx.len() < 2000);
    }

    #[test]
    fn test_step_context_only_includes_earlier_steps() {
        let mut round = RoundRecord::new(1);
        for (id, text) in [
            (StepId::Understand, "framing"),
            (StepId::Analyze, "analysis"),
        ] {
            round.record_step(StepRecord {
                step: id,
                outputs: vec![AgentOutput::success("solo", AgentKind::Reasoner, text)],
                critic_report: None,
                critic_unavailable: false,
                synthesized: text.to_string(),
                duration_secs: 0.0,
                completed_at: Utc::now(),
            });
        }
        let state = SessionState::new_research("goal", PathBuf::from("."), 1);
        let ctx = state.step_context(&round, StepId::Analyze);
        assert!(ctx.contains("framing"));
        assert!(!ctx.contains("analysis"));
    }

    #[test]
    fn test_checkpoint_label_tracks_last_persisted_step() {
        let mut state = SessionState::new_research("goal", PathBuf::from("."), 3);
        assert_eq!(state.checkpoint_label(), "session start");

        let mut round = RoundRecord::new(1);
        round.record_step(StepRecord {
            step: StepId::Understand,
            outputs: vec![],
            critic_report: None,
            critic_unavailable: false,
            synthesized: "s".to_string(),
            duration_secs: 0.0,
            completed_at: Utc::now(),
        });
        state.rounds.push(round);
        assert_eq!(
            state.checkpoint_label(),
            "round 1, step 1 (Goal Understanding)"
        );
    }

    #[test]
    fn test_progress_label() {
        let mut state = SessionState::new_research("goal", PathBuf::from("."), 3);
        state.rounds.push(finished_round(1, "c"));
        assert_eq!(state.progress_label(), "Round 1/3");
    }
}
