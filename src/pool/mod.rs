//! Parallel agent pool: fan a prompt out to several members, critique the
//! surviving outputs, and synthesize one answer.
//!
//! Member failures degrade the pool rather than aborting it. Only when
//! every member fails does the step itself fail.

use std::path::Path;
use std::thread;
use std::time::Instant;

use tracing::{debug, warn};

use crate::agents::{AgentInvoker, AgentKind};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::models::AgentOutput;

const CRITIC_PROMPT: &str = "\
You are a rigorous critic reviewing parallel analyses of the same problem.

Review the following outputs and produce:
1. Logical Flaws: reasoning errors or unsupported claims in any output.
2. Missing Considerations: important angles no output covered.
3. Contradictions: where outputs disagree, and which position is stronger.
4. Overconfidence: conclusions stated more firmly than the evidence allows.
5. Verdict: which outputs (or combination) to trust, and why.

{combined}";

const SYNTHESIS_PROMPT: &str = "\
Synthesize these {count} parallel agent outputs into one unified, \
comprehensive response. Keep all unique insights. Resolve contradictions \
explicitly instead of averaging them.

{combined}";

/// One member of a pool run: a role label and the prompt it receives.
#[derive(Debug, Clone)]
pub struct PoolMember {
    pub role: String,
    pub kind: AgentKind,
    pub prompt: String,
}

impl PoolMember {
    pub fn new(role: impl Into<String>, kind: AgentKind, prompt: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            kind,
            prompt: prompt.into(),
        }
    }
}

/// Result of a full pool pass over one step.
#[derive(Debug, Clone)]
pub struct PoolResult {
    pub outputs: Vec<AgentOutput>,
    pub critic_report: Option<String>,
    /// A critic pass was warranted but its invocation failed.
    pub critic_unavailable: bool,
    pub synthesized: String,
}

impl PoolResult {
    pub fn successful_outputs(&self) -> impl Iterator<Item = &AgentOutput> {
        self.outputs.iter().filter(|o| o.success)
    }
}

/// Run every member in parallel, then critic and synthesis passes.
///
/// A solo pool has nothing to reconcile, so its critic and synthesis
/// passes are skipped and the output is carried forward as-is. A larger
/// pool keeps both passes even when failures leave one survivor.
pub fn run_pool(
    invoker: &dyn AgentInvoker,
    config: &EngineConfig,
    step_name: &str,
    members: Vec<PoolMember>,
    cwd: &Path,
) -> Result<PoolResult, EngineError> {
    let member_count = members.len();
    debug!(step = step_name, members = member_count, "starting pool");

    let outputs = run_members(invoker, config, members, cwd);
    let successes: Vec<&AgentOutput> = outputs.iter().filter(|o| o.success).collect();

    if successes.is_empty() {
        return Err(EngineError::PoolExhausted {
            step: step_name.to_string(),
            member_count,
        });
    }

    if member_count == 1 {
        let synthesized = successes[0].text.clone();
        return Ok(PoolResult {
            outputs,
            critic_report: None,
            critic_unavailable: false,
            synthesized,
        });
    }

    let combined = combine_outputs(&successes);

    let (critic_report, critic_unavailable) = match run_critic(invoker, config, &combined, cwd) {
        Some(report) => (Some(report), false),
        None => {
            warn!(step = step_name, "critic pass unavailable, synthesizing raw outputs");
            (None, true)
        }
    };

    let synthesized = run_synthesis(
        invoker,
        config,
        step_name,
        successes.len(),
        &combined,
        critic_report.as_deref(),
        cwd,
    )?;

    Ok(PoolResult {
        outputs,
        critic_report,
        critic_unavailable,
        synthesized,
    })
}

fn run_members(
    invoker: &dyn AgentInvoker,
    config: &EngineConfig,
    members: Vec<PoolMember>,
    cwd: &Path,
) -> Vec<AgentOutput> {
    let timeout = config.invocation_timeout();
    thread::scope(|scope| {
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                scope.spawn(move || {
                    let started = Instant::now();
                    let result = invoker.invoke(member.kind, &member.prompt, cwd, timeout);
                    let mut output = match result {
                        Ok(out) if out.success() => {
                            AgentOutput::success(&member.role, member.kind, out.text)
                        }
                        Ok(out) => {
                            AgentOutput::failure(&member.role, member.kind, out.failure_reason())
                        }
                        Err(e) => {
                            AgentOutput::failure(&member.role, member.kind, format!("{e:#}"))
                        }
                    };
                    output.duration_secs = started.elapsed().as_secs_f64();
                    if !output.success {
                        warn!(role = %output.role, error = %output.error, "pool member failed");
                    }
                    output
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("pool member thread panicked")).collect()
    })
}

/// Successful outputs under role banners, the form both the critic and the
/// synthesizer receive.
fn combine_outputs(successes: &[&AgentOutput]) -> String {
    successes
        .iter()
        .map(|o| format!("=== {} ===\n{}", o.role.to_uppercase(), o.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn run_critic(
    invoker: &dyn AgentInvoker,
    config: &EngineConfig,
    combined: &str,
    cwd: &Path,
) -> Option<String> {
    let prompt = CRITIC_PROMPT.replace("{combined}", combined);
    match invoker.invoke(AgentKind::Reasoner, &prompt, cwd, config.invocation_timeout()) {
        Ok(out) if out.success() => Some(out.text),
        Ok(out) => {
            debug!(reason = %out.failure_reason(), "critic invocation unsuccessful");
            None
        }
        Err(e) => {
            debug!(error = %format!("{e:#}"), "critic invocation errored");
            None
        }
    }
}

fn run_synthesis(
    invoker: &dyn AgentInvoker,
    config: &EngineConfig,
    step_name: &str,
    count: usize,
    combined: &str,
    critic_report: Option<&str>,
    cwd: &Path,
) -> Result<String, EngineError> {
    let mut input = combined.to_string();
    if let Some(report) = critic_report {
        input.push_str("\n\n=== CRITIC REVIEW ===\n");
        input.push_str(report);
    }
    let prompt = SYNTHESIS_PROMPT
        .replace("{count}", &count.to_string())
        .replace("{combined}", &input);

    let output = invoker
        .invoke(AgentKind::Reasoner, &prompt, cwd, config.invocation_timeout())
        .map_err(|e| EngineError::SynthesisFailed {
            step: step_name.to_string(),
            reason: format!("{e:#}"),
        })?;

    if !output.success() {
        return Err(EngineError::SynthesisFailed {
            step: step_name.to_string(),
            reason: output.failure_reason(),
        });
    }
    Ok(output.text)
}
