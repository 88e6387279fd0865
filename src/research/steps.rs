//! The six steps of a research round.
//!
//! Steps 1, 5 and 6 are single-agent. Step 2 fans out to an analyst pool
//! with rotating perspectives, step 3 to an implementer pool over a shared
//! experiment plan, and step 4 executes the planned experiments, handing
//! long-running ones to the background job supervisor.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Instant;

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::agents::{AgentInvoker, AgentKind};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::models::{AgentOutput, Direction, RoundRecord, SessionState, StepId, StepRecord};
use crate::monitor::recovery::run_with_recovery;
use crate::monitor::{parse_directive, MonitorTiming};
use crate::pool::{run_pool, PoolMember, PoolResult};

const ANALYST_PERSPECTIVES: &[&str] = &[
    "Focus on architectural and model design issues",
    "Focus on training dynamics, loss functions, and optimization",
    "Focus on data distribution, feature quality, and preprocessing",
];

const UNDERSTAND_PROMPT: &str = "\
You are beginning research round {round} of {total}.

RESEARCH GOAL:
{goal}

{context}Produce a focused framing for this round:
1. Core Research Question: the single question this round must answer.
2. Current State: what is already known or established.
3. Success Metrics: how improvement will be measured.
4. Hypotheses: concrete, testable hypotheses for this round.
5. Key Challenges: what is most likely to go wrong.
6. Scope: what is explicitly out of bounds this round.
";

const ANALYZE_PROMPT: &str = "\
ROUND {round} PROBLEM ANALYSIS

RESEARCH GOAL:
{goal}

ROUND FRAMING:
{framing}

{perspective}.

From that angle, identify the most significant problems, risks, and
opportunities. Be specific: name the mechanism, not just the symptom, and
say what evidence would confirm or refute each claim.
";

const PLAN_PROMPT: &str = "\
ROUND {round} METHODOLOGY

RESEARCH GOAL:
{goal}

PROBLEM ANALYSIS:
{analysis}

Design {count} experiments for this round. Each should test one hypothesis
with one deliberate change. Prefer cheap, decisive experiments over
expensive, ambiguous ones.

End your response with exactly this JSON block:
```json
{\"experiments\": [{\"name\": \"...\", \"description\": \"...\", \"key_change\": \"...\", \"expected_gain\": \"...\"}]}
```
";

const IMPLEMENT_PROMPT: &str = "\
Implement experiment configuration #{index} from the plan below. Write the
code and configuration needed so the experiment can run, and describe
exactly what you changed.

PLAN:
{plan}
";

const EXPERIMENT_PROMPT: &str = "\
Execute this experiment.

EXPERIMENT: {name}
DESCRIPTION: {description}
KEY CHANGE: {key_change}

METHODOLOGY AND IMPLEMENTATION:
{methodology}

If the experiment runs in under a couple of minutes, run it now and report:
EXPERIMENT RESULT: <what happened, with metric values>

If it needs a long-running process (training, large evaluation), do NOT run
it inline. Prepare everything, then respond with:
BACKGROUND_TASK: <short name>
COMMAND: <the command to run>
LOG_FILE: <where the command writes its log>
COMPLETION_PATTERN: <log pattern marking success, optional>
ESTIMATED_TIME: <rough estimate, optional>
";

const RESULTS_PROMPT: &str = "\
ROUND {round} RESULT ANALYSIS

METHODOLOGY:
{methodology}

EXECUTION RESULTS:
{results}

Analyze the outcomes: which hypotheses were confirmed or refuted, which
metric movements are signal versus noise, and what the failed experiments
(if any) still teach us. Flag any result that contradicts the round framing.
";

const CONCLUSION_PROMPT: &str = "\
ROUND {round} CONCLUSION

RESEARCH GOAL:
{goal}

THIS ROUND:
{round_summary}

Write the round conclusion: what was learned, what changed in our
understanding, and what the next round should do.

End your response with exactly this JSON block:
```json
{\"best_metric\": \"...\", \"next_hypotheses\": [\"...\"], \"direction\": \"continue|pivot|done\", \"critical_question\": \"...\"}
```
";

/// Shared handles every step needs.
pub struct StepContext<'a> {
    pub invoker: &'a dyn AgentInvoker,
    pub config: &'a EngineConfig,
    pub timing: &'a MonitorTiming,
    pub cwd: &'a Path,
    pub logs_dir: PathBuf,
    /// Device indexes assigned to this round's experiments, in order.
    pub devices: Vec<Option<u32>>,
    /// Observed by the job supervisor; a set flag terminates running jobs.
    pub cancel: &'a AtomicBool,
}

/// Execute one step of a round and produce its record.
pub fn run_step(
    ctx: &StepContext<'_>,
    state: &SessionState,
    round: &RoundRecord,
    step: StepId,
) -> Result<StepRecord, EngineError> {
    info!(round = round.round_num, step = step.number(), name = step.name(), "running step");
    let started = Instant::now();

    let record = match step {
        StepId::Understand => run_understand(ctx, state, round),
        StepId::Analyze => run_analyze(ctx, state, round),
        StepId::Methodology => run_methodology(ctx, state, round),
        StepId::Experiment => run_experiment(ctx, round),
        StepId::Results => run_results(ctx, round),
        StepId::Conclusion => run_conclusion(ctx, state, round),
    }?;

    let mut record = record;
    record.duration_secs = started.elapsed().as_secs_f64();
    Ok(record)
}

fn run_understand(
    ctx: &StepContext<'_>,
    state: &SessionState,
    round: &RoundRecord,
) -> Result<StepRecord, EngineError> {
    let mut context = String::new();
    let carryover = state.carryover.as_prompt_context();
    if !carryover.is_empty() {
        context.push_str(&carryover);
        context.push_str("\n\n");
    }
    let history = state.round_context();
    if !history.is_empty() {
        context.push_str(&history);
        context.push_str("\n\n");
    }

    let prompt = UNDERSTAND_PROMPT
        .replace("{round}", &round.round_num.to_string())
        .replace("{total}", &state.total_rounds.to_string())
        .replace("{goal}", &state.goal)
        .replace("{context}", &context);

    run_solo(ctx, StepId::Understand, "framing", AgentKind::Reasoner, &prompt)
}

fn run_analyze(
    ctx: &StepContext<'_>,
    state: &SessionState,
    round: &RoundRecord,
) -> Result<StepRecord, EngineError> {
    let framing = prior_output(round, StepId::Understand);
    let members = (0..ctx.config.analysts.max(1))
        .map(|i| {
            let perspective = ANALYST_PERSPECTIVES[i % ANALYST_PERSPECTIVES.len()];
            let prompt = ANALYZE_PROMPT
                .replace("{round}", &round.round_num.to_string())
                .replace("{goal}", &state.goal)
                .replace("{framing}", framing)
                .replace("{perspective}", perspective);
            PoolMember::new(format!("analyst-{}", i + 1), AgentKind::Reasoner, prompt)
        })
        .collect();

    let pooled = run_pool(ctx.invoker, ctx.config, StepId::Analyze.name(), members, ctx.cwd)?;
    Ok(record_from_pool(StepId::Analyze, pooled))
}

fn run_methodology(
    ctx: &StepContext<'_>,
    state: &SessionState,
    round: &RoundRecord,
) -> Result<StepRecord, EngineError> {
    let analysis = prior_output(round, StepId::Analyze);
    let plan_prompt = PLAN_PROMPT
        .replace("{round}", &round.round_num.to_string())
        .replace("{goal}", &state.goal)
        .replace("{analysis}", analysis)
        .replace("{count}", &ctx.config.experiments.to_string());

    let plan_record = run_solo(ctx, StepId::Methodology, "planner", AgentKind::Reasoner, &plan_prompt)?;
    let plan_text = plan_record.synthesized.clone();

    let members = (0..ctx.config.implementers.max(1))
        .map(|i| {
            let prompt = IMPLEMENT_PROMPT
                .replace("{index}", &(i + 1).to_string())
                .replace("{plan}", &plan_text);
            PoolMember::new(format!("implementer-{}", i + 1), AgentKind::Coder, prompt)
        })
        .collect();

    let pooled = run_pool(ctx.invoker, ctx.config, StepId::Methodology.name(), members, ctx.cwd)?;

    // The plan (with its experiments block) stays at the head of the step
    // output; step 4 parses experiments back out of it.
    let mut record = record_from_pool(StepId::Methodology, pooled);
    record.outputs.insert(0, plan_record.outputs[0].clone());
    record.synthesized = format!(
        "{plan_text}\n\n=== IMPLEMENTATION ===\n{}",
        record.synthesized
    );
    Ok(record)
}

fn run_experiment(ctx: &StepContext<'_>, round: &RoundRecord) -> Result<StepRecord, EngineError> {
    let methodology = prior_output(round, StepId::Methodology);
    let experiments = extract_experiments(methodology, ctx.config.experiments);
    info!(count = experiments.len(), "executing experiments");

    let jobs: Vec<(usize, ExperimentPlan, String)> = experiments
        .into_iter()
        .enumerate()
        .map(|(i, exp)| {
            let prompt = EXPERIMENT_PROMPT
                .replace("{name}", &exp.name)
                .replace("{description}", &exp.description)
                .replace("{key_change}", &exp.key_change)
                .replace("{methodology}", methodology);
            (i, exp, prompt)
        })
        .collect();

    let mut outputs: Vec<(usize, AgentOutput)> = Vec::new();
    for chunk in jobs.chunks(ctx.config.max_parallel.max(1)) {
        let chunk_results: Vec<(usize, AgentOutput)> = thread::scope(|scope| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|(i, exp, prompt)| {
                    let device = ctx.devices.get(*i).copied().flatten();
                    scope.spawn(move || (*i, run_one_experiment(ctx, exp, prompt, device)))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("experiment thread panicked"))
                .collect()
        });
        outputs.extend(chunk_results);
    }
    outputs.sort_by_key(|(i, _)| *i);
    let outputs: Vec<AgentOutput> = outputs.into_iter().map(|(_, o)| o).collect();

    let synthesized = outputs
        .iter()
        .map(|o| if o.success { o.text.clone() } else { o.error.clone() })
        .collect::<Vec<_>>()
        .join("\n\n");

    Ok(StepRecord {
        step: StepId::Experiment,
        outputs,
        critic_report: None,
        critic_unavailable: false,
        synthesized,
        duration_secs: 0.0,
        completed_at: Utc::now(),
    })
}

/// One experiment: ask a coder agent to execute it, and if the agent hands
/// back a background directive, supervise that job with repair-and-retry.
fn run_one_experiment(
    ctx: &StepContext<'_>,
    exp: &ExperimentPlan,
    prompt: &str,
    device: Option<u32>,
) -> AgentOutput {
    let role = format!("experiment:{}", exp.name);
    let started = Instant::now();

    let invoked = ctx
        .invoker
        .invoke(AgentKind::Coder, prompt, ctx.cwd, ctx.config.invocation_timeout());
    let output = match invoked {
        Ok(out) if out.success() => out,
        Ok(out) => {
            let mut failed = AgentOutput::failure(&role, AgentKind::Coder, format!(
                "EXPERIMENT: {}\nSTATUS: FAILED (agent: {})",
                exp.name,
                out.failure_reason()
            ));
            failed.duration_secs = started.elapsed().as_secs_f64();
            return failed;
        }
        Err(e) => {
            let mut failed = AgentOutput::failure(&role, AgentKind::Coder, format!(
                "EXPERIMENT: {}\nSTATUS: FAILED (invocation: {e:#})",
                exp.name
            ));
            failed.duration_secs = started.elapsed().as_secs_f64();
            return failed;
        }
    };

    let result = match parse_directive(&output.text) {
        Ok(Some(directive)) => {
            debug!(experiment = %exp.name, command = %directive.command, "background directive received");
            match run_with_recovery(
                ctx.invoker,
                ctx.config,
                ctx.timing,
                &exp.name,
                &output.text,
                directive,
                device,
                ctx.cwd,
                &ctx.logs_dir,
                ctx.cancel,
            ) {
                Ok(report) => AgentOutput::success(&role, AgentKind::Coder, report.summary()),
                Err(e) => {
                    warn!(experiment = %exp.name, "background job failed permanently: {e}");
                    AgentOutput::failure(&role, AgentKind::Coder, format!(
                        "EXPERIMENT: {}\nSTATUS: FAILED\nERROR: {e}",
                        exp.name
                    ))
                }
            }
        }
        Ok(None) => AgentOutput::success(&role, AgentKind::Coder, output.text),
        Err(reason) => AgentOutput::failure(&role, AgentKind::Coder, format!(
            "EXPERIMENT: {}\nSTATUS: FAILED (bad directive: {reason})",
            exp.name
        )),
    };

    let mut result = result;
    result.duration_secs = started.elapsed().as_secs_f64();
    result
}

fn run_results(ctx: &StepContext<'_>, round: &RoundRecord) -> Result<StepRecord, EngineError> {
    let prompt = RESULTS_PROMPT
        .replace("{round}", &round.round_num.to_string())
        .replace("{methodology}", prior_output(round, StepId::Methodology))
        .replace("{results}", prior_output(round, StepId::Experiment));
    run_solo(ctx, StepId::Results, "results", AgentKind::Reasoner, &prompt)
}

fn run_conclusion(
    ctx: &StepContext<'_>,
    state: &SessionState,
    round: &RoundRecord,
) -> Result<StepRecord, EngineError> {
    let round_summary = format!(
        "FRAMING:\n{}\n\nRESULT ANALYSIS:\n{}",
        prior_output(round, StepId::Understand),
        prior_output(round, StepId::Results)
    );
    let prompt = CONCLUSION_PROMPT
        .replace("{round}", &round.round_num.to_string())
        .replace("{goal}", &state.goal)
        .replace("{round_summary}", &round_summary);
    run_solo(ctx, StepId::Conclusion, "conclusion", AgentKind::Reasoner, &prompt)
}

fn run_solo(
    ctx: &StepContext<'_>,
    step: StepId,
    role: &str,
    kind: AgentKind,
    prompt: &str,
) -> Result<StepRecord, EngineError> {
    let members = vec![PoolMember::new(role, kind, prompt)];
    let pooled = run_pool(ctx.invoker, ctx.config, step.name(), members, ctx.cwd)?;
    Ok(record_from_pool(step, pooled))
}

fn record_from_pool(step: StepId, pooled: PoolResult) -> StepRecord {
    StepRecord {
        step,
        outputs: pooled.outputs,
        critic_report: pooled.critic_report,
        critic_unavailable: pooled.critic_unavailable,
        synthesized: pooled.synthesized,
        duration_secs: 0.0,
        completed_at: Utc::now(),
    }
}

fn prior_output(round: &RoundRecord, step: StepId) -> &str {
    round.step(step).map(|r| r.primary_output()).unwrap_or("")
}

/// One experiment as declared by the methodology plan.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ExperimentPlan {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub key_change: String,
    #[serde(default)]
    pub expected_gain: String,
}

#[derive(Debug, Deserialize)]
struct ExperimentBlock {
    experiments: Vec<ExperimentPlan>,
}

/// Pull the experiments JSON block out of the methodology output. A
/// missing or unparseable block degrades to numbered placeholders so the
/// round can still proceed.
pub fn extract_experiments(methodology: &str, fallback_count: usize) -> Vec<ExperimentPlan> {
    let re = Regex::new(r#"(?s)```json\s*(\{.*?"experiments".*?\})\s*```"#)
        .expect("built-in pattern must compile");
    if let Some(caps) = re.captures(methodology) {
        match serde_json::from_str::<ExperimentBlock>(&caps[1]) {
            Ok(block) if !block.experiments.is_empty() => return block.experiments,
            Ok(_) => {}
            Err(e) => debug!("experiments block did not parse: {e}"),
        }
    }
    (1..=fallback_count.max(1))
        .map(|i| ExperimentPlan {
            name: format!("experiment_{i}"),
            description: format!("Experiment configuration #{i} from the methodology"),
            key_change: String::new(),
            expected_gain: String::new(),
        })
        .collect()
}

/// Structured fields of the conclusion's JSON block.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct ConclusionSummary {
    #[serde(default)]
    pub best_metric: Option<String>,
    #[serde(default)]
    pub next_hypotheses: Vec<String>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub critical_question: String,
}

/// Parse the conclusion block. Malformed output degrades to defaults
/// (continue, no hypotheses) rather than failing the round.
pub fn parse_conclusion(text: &str) -> ConclusionSummary {
    let re = Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").expect("built-in pattern must compile");
    if let Some(caps) = re.captures(text) {
        match serde_json::from_str::<ConclusionSummary>(&caps[1]) {
            Ok(summary) => return summary,
            Err(e) => debug!("conclusion block did not parse: {e}"),
        }
    }
    ConclusionSummary::default()
}
