//! Plan schema: units of work with declared dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::AgentKind;
use crate::errors::EngineError;

/// Lifecycle of a unit. Terminal states are `Succeeded`, `Failed` and
/// `Skipped`; once terminal a unit is never re-executed (resume treats
/// `Succeeded` as an immediately satisfied dependency).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    /// A dependency failed, so this unit was never executed.
    Skipped,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitStatus::Succeeded | UnitStatus::Failed | UnitStatus::Skipped
        )
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Ready => "ready",
            UnitStatus::Running => "running",
            UnitStatus::Succeeded => "succeeded",
            UnitStatus::Failed => "failed",
            UnitStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One schedulable piece of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub agent: AgentKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Whether this unit may run concurrently with other eligible units in
    /// its wave. Non-eligible units run sequentially even inside a wave.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub status: UnitStatus,
    #[serde(default)]
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Unit {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            prompt: prompt.into(),
            agent: AgentKind::default(),
            depends_on: Vec::new(),
            parallel: false,
            status: UnitStatus::Pending,
            result: String::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn parallel_eligible(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn with_agent(mut self, agent: AgentKind) -> Self {
        self.agent = agent;
        self
    }
}

/// An ordered collection of units plus plan-level context.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Plan {
    pub goal: String,
    #[serde(default)]
    pub summary: String,
    pub units: Vec<Unit>,
    /// Free-form instructions prepended to every unit's context.
    #[serde(default)]
    pub additional_context: String,
}

impl Plan {
    /// Structural validation: non-empty, unique ids, resolvable
    /// dependencies, non-empty prompts. Cycle detection happens when the
    /// graph is built.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.units.is_empty() {
            return Err(EngineError::graph("plan contains no units"));
        }
        let mut seen = std::collections::HashSet::new();
        for unit in &self.units {
            if unit.id.trim().is_empty() {
                return Err(EngineError::graph("unit with empty id"));
            }
            if !seen.insert(unit.id.as_str()) {
                return Err(EngineError::graph(format!("duplicate unit id '{}'", unit.id)));
            }
            if unit.prompt.trim().is_empty() {
                return Err(EngineError::graph(format!(
                    "unit '{}' has an empty prompt",
                    unit.id
                )));
            }
        }
        for unit in &self.units {
            for dep in &unit.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(EngineError::graph(format!(
                        "unit '{}' depends on unknown unit '{}'",
                        unit.id, dep
                    )));
                }
                if dep == &unit.id {
                    return Err(EngineError::graph(format!(
                        "unit '{}' depends on itself",
                        unit.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn unit(&self, id: &str) -> Option<&Unit> {
        self.units.iter().find(|u| u.id == id)
    }
}
