//! Agent Invocation Port.
//!
//! Every external agent is an opaque command-line worker: it takes a prompt
//! and a working directory and eventually emits text. The engine only ever
//! talks to agents through [`AgentInvoker`], so tests substitute a scripted
//! implementation and the rest of the engine cannot tell the difference.

mod cli;
mod scripted;

pub use cli::CliInvoker;
pub use scripted::{RecordedInvocation, ScriptedInvoker, ScriptedResponse};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// The kind of worker a unit is assigned to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Analysis, critique, synthesis, planning.
    #[default]
    Reasoner,
    /// Code and experiment execution.
    Coder,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Reasoner => "reasoner",
            AgentKind::Coder => "coder",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one agent invocation.
///
/// An unsuccessful invocation is data, not an `Err`: callers decide whether
/// a failed member aborts anything. `Err` from [`AgentInvoker::invoke`] is
/// reserved for the invoker itself being unable to run (missing binary,
/// spawn failure).
#[derive(Debug, Clone)]
pub struct InvocationOutput {
    pub text: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub timed_out: bool,
}

impl InvocationOutput {
    /// Zero exit, no timeout, and non-empty output.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.text.trim().is_empty()
    }

    /// Human-readable failure reason, empty for successful invocations.
    pub fn failure_reason(&self) -> String {
        if self.timed_out {
            "invocation timed out".to_string()
        } else if self.exit_code != Some(0) {
            match self.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            }
        } else if self.text.trim().is_empty() {
            "empty output".to_string()
        } else {
            String::new()
        }
    }
}

/// The single capability the engine needs from the outside world.
///
/// Implementations must never block indefinitely: the timeout is mandatory
/// and an implementation that ignores it is broken.
pub trait AgentInvoker: Send + Sync {
    fn invoke(
        &self,
        kind: AgentKind,
        prompt: &str,
        cwd: &Path,
        timeout: Duration,
    ) -> anyhow::Result<InvocationOutput>;
}
