//! Wave-based execution of a task graph.
//!
//! Units run in dependency waves. Within a wave, units flagged parallel run
//! on worker threads (bounded by `max_parallel`); the rest run serially.
//! A failed unit never stops the graph: its dependents are skipped and
//! every other unit still runs.

use std::collections::HashMap;
use std::path::Path;
use std::thread;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::agents::AgentInvoker;
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::plan::graph::TaskGraph;
use crate::plan::schema::UnitStatus;

/// Dependency outputs are truncated to this many characters when injected
/// into a downstream prompt.
const DEP_CONTEXT_CHARS: usize = 2000;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

impl ExecutionSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Execute every unit of the graph, wave by wave.
///
/// `completed` carries cached results from an interrupted earlier run;
/// those units are marked succeeded up front and their agents are not
/// re-invoked. `checkpoint` is called after every wave, before the next
/// wave starts, and a checkpoint failure aborts execution.
pub fn execute_graph(
    graph: &mut TaskGraph,
    invoker: &dyn AgentInvoker,
    config: &EngineConfig,
    cwd: &Path,
    completed: &HashMap<String, String>,
    checkpoint: &mut dyn FnMut(&TaskGraph) -> Result<(), EngineError>,
) -> Result<ExecutionSummary, EngineError> {
    for (id, result) in completed {
        if let Some(unit) = graph.unit_mut(id) {
            unit.status = UnitStatus::Succeeded;
            unit.result = result.clone();
            debug!(unit = %id, "restored from checkpoint");
        }
    }

    let waves = graph.waves();
    info!(units = graph.len(), waves = waves.len(), "executing task graph");

    for (wave_idx, wave) in waves.iter().enumerate() {
        let (parallel_batch, serial_batch) = stage_wave(graph, wave)?;

        debug!(
            wave = wave_idx + 1,
            parallel = parallel_batch.len(),
            serial = serial_batch.len(),
            "wave composition"
        );

        for chunk in parallel_batch.chunks(config.max_parallel.max(1)) {
            for (id, _) in chunk {
                graph.unit_mut(id).expect("unit exists").status = UnitStatus::Running;
            }
            let results = run_chunk(graph, invoker, config, cwd, chunk);
            for (id, outcome) in results {
                apply_outcome(graph, &id, outcome);
            }
        }
        for (id, prompt) in &serial_batch {
            graph.unit_mut(id).expect("unit exists").status = UnitStatus::Running;
            let outcome = run_unit(graph, invoker, config, cwd, id, prompt);
            apply_outcome(graph, id, outcome);
        }

        checkpoint(graph)?;
    }

    Ok(summarize(graph))
}

type Batch = Vec<(String, String)>;

/// Classify one wave's pending units. Runnable units are marked `Ready`
/// and split into a parallel and a serial batch; units with a failed or
/// incomplete dependency are marked `Skipped` here.
fn stage_wave(graph: &mut TaskGraph, wave: &[String]) -> Result<(Batch, Batch), EngineError> {
    let mut parallel_batch: Batch = Vec::new();
    let mut serial_batch: Batch = Vec::new();

    for id in wave {
        let unit = graph
            .unit(id)
            .ok_or_else(|| EngineError::graph(format!("unknown unit '{id}' in wave")))?;
        if unit.status != UnitStatus::Pending {
            continue;
        }
        if graph.has_failed_dep(id) {
            let unit = graph.unit_mut(id).expect("unit exists");
            unit.status = UnitStatus::Skipped;
            unit.result = "skipped: a dependency failed".to_string();
            warn!(unit = %id, "skipping unit with failed dependency");
            continue;
        }
        if !graph.deps_satisfied(id) {
            // Waves guarantee dependencies already ran, so an
            // unsatisfied dependency here is a failed or skipped one.
            let unit = graph.unit_mut(id).expect("unit exists");
            unit.status = UnitStatus::Skipped;
            unit.result = "skipped: a dependency did not complete".to_string();
            continue;
        }

        let prompt = build_unit_prompt(graph, id);
        let parallel = unit_is_parallel(graph, id) && wave.len() > 1;
        graph.unit_mut(id).expect("unit exists").status = UnitStatus::Ready;
        if parallel {
            parallel_batch.push((id.clone(), prompt));
        } else {
            serial_batch.push((id.clone(), prompt));
        }
    }
    Ok((parallel_batch, serial_batch))
}

fn unit_is_parallel(graph: &TaskGraph, id: &str) -> bool {
    graph.unit(id).map(|u| u.parallel).unwrap_or(false)
}

struct UnitOutcome {
    succeeded: bool,
    result: String,
    started_at: chrono::DateTime<Utc>,
}

fn run_chunk(
    graph: &TaskGraph,
    invoker: &dyn AgentInvoker,
    config: &EngineConfig,
    cwd: &Path,
    chunk: &[(String, String)],
) -> Vec<(String, UnitOutcome)> {
    thread::scope(|scope| {
        let handles: Vec<_> = chunk
            .iter()
            .map(|(id, prompt)| {
                scope.spawn(move || (id.clone(), run_unit(graph, invoker, config, cwd, id, prompt)))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("unit worker thread panicked"))
            .collect()
    })
}

fn run_unit(
    graph: &TaskGraph,
    invoker: &dyn AgentInvoker,
    config: &EngineConfig,
    cwd: &Path,
    id: &str,
    prompt: &str,
) -> UnitOutcome {
    let unit = graph.unit(id).expect("unit exists");
    let started_at = Utc::now();
    let started = Instant::now();
    info!(unit = %id, agent = %unit.agent, "running unit");

    let result = invoker.invoke(unit.agent, prompt, cwd, config.invocation_timeout());
    let elapsed = started.elapsed().as_secs();
    match result {
        Ok(out) if out.success() => {
            info!(unit = %id, secs = elapsed, "unit succeeded");
            UnitOutcome {
                succeeded: true,
                result: out.text,
                started_at,
            }
        }
        Ok(out) => {
            warn!(unit = %id, reason = %out.failure_reason(), "unit failed");
            UnitOutcome {
                succeeded: false,
                result: format!("agent failed: {}", out.failure_reason()),
                started_at,
            }
        }
        Err(e) => {
            warn!(unit = %id, error = %format!("{e:#}"), "unit invocation errored");
            UnitOutcome {
                succeeded: false,
                result: format!("invocation error: {e:#}"),
                started_at,
            }
        }
    }
}

fn apply_outcome(graph: &mut TaskGraph, id: &str, outcome: UnitOutcome) {
    let unit = graph.unit_mut(id).expect("unit exists");
    unit.status = if outcome.succeeded {
        UnitStatus::Succeeded
    } else {
        UnitStatus::Failed
    };
    unit.result = outcome.result;
    unit.started_at = Some(outcome.started_at);
    unit.finished_at = Some(Utc::now());
}

/// The prompt a unit's agent receives: global instructions, the outputs of
/// its dependencies, then its own task.
fn build_unit_prompt(graph: &TaskGraph, id: &str) -> String {
    let unit = graph.unit(id).expect("unit exists");
    let mut sections = Vec::new();

    if !graph.additional_context.is_empty() {
        sections.push(format!("=== Global Instructions ===\n{}", graph.additional_context));
    }
    for dep_id in &unit.depends_on {
        if let Some(dep) = graph.unit(dep_id) {
            if dep.status == UnitStatus::Succeeded && !dep.result.is_empty() {
                sections.push(format!(
                    "=== Output from task {dep_id} ===\n{}",
                    truncate_chars(&dep.result, DEP_CONTEXT_CHARS)
                ));
            }
        }
    }
    sections.push(format!("--- Your task ---\n{}", unit.prompt));
    sections.join("\n\n")
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}\n... [truncated]", &s[..idx]),
        None => s.to_string(),
    }
}

fn summarize(graph: &TaskGraph) -> ExecutionSummary {
    let mut summary = ExecutionSummary::default();
    for unit in graph.units() {
        match unit.status {
            UnitStatus::Succeeded => summary.succeeded.push(unit.id.clone()),
            UnitStatus::Failed => summary.failed.push(unit.id.clone()),
            UnitStatus::Skipped => summary.skipped.push(unit.id.clone()),
            other => {
                // Unreachable after a full pass, but make it visible
                // instead of silently dropping the unit.
                warn!(unit = %unit.id, status = %other, "unit left non-terminal");
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::ScriptedInvoker;
    use crate::plan::schema::{Plan, Unit};

    fn diamond() -> TaskGraph {
        let plan = Plan {
            goal: "build a thing".to_string(),
            summary: String::new(),
            units: vec![
                Unit::new("root", "do the root work"),
                Unit::new("left", "do the left work")
                    .with_deps(&["root"])
                    .parallel_eligible(),
                Unit::new("right", "do the right work")
                    .with_deps(&["root"])
                    .parallel_eligible(),
                Unit::new("join", "combine left and right").with_deps(&["left", "right"]),
            ],
            additional_context: String::new(),
        };
        TaskGraph::build(plan).unwrap()
    }

    fn no_checkpoint() -> impl FnMut(&TaskGraph) -> Result<(), EngineError> {
        |_| Ok(())
    }

    #[test]
    fn test_full_graph_success() {
        let mut graph = diamond();
        let invoker = ScriptedInvoker::new();
        invoker.default_response("done");

        let config = EngineConfig::default();
        let summary = execute_graph(
            &mut graph,
            &invoker,
            &config,
            Path::new("."),
            &HashMap::new(),
            &mut no_checkpoint(),
        )
        .unwrap();

        assert!(summary.all_succeeded());
        assert_eq!(summary.succeeded.len(), 4);
        assert!(graph.units().iter().all(|u| u.status == UnitStatus::Succeeded));
        assert!(graph.units().iter().all(|u| u.finished_at.is_some()));
    }

    #[test]
    fn test_staging_marks_runnable_units_ready() {
        let mut graph = diamond();
        let waves = graph.waves();

        let (parallel, serial) = stage_wave(&mut graph, &waves[0]).unwrap();
        assert!(parallel.is_empty());
        assert_eq!(serial[0].0, "root");
        assert_eq!(graph.unit("root").unwrap().status, UnitStatus::Ready);
        // Later waves are untouched until their turn.
        assert_eq!(graph.unit("left").unwrap().status, UnitStatus::Pending);

        // With the root done, the second wave stages its eligible units in
        // the parallel batch.
        graph.unit_mut("root").unwrap().status = UnitStatus::Succeeded;
        let (parallel, serial) = stage_wave(&mut graph, &waves[1]).unwrap();
        assert!(serial.is_empty());
        assert_eq!(parallel.len(), 2);
        assert_eq!(graph.unit("left").unwrap().status, UnitStatus::Ready);
        assert_eq!(graph.unit("right").unwrap().status, UnitStatus::Ready);
    }

    #[test]
    fn test_failed_unit_skips_dependents_but_not_siblings() {
        let mut graph = diamond();
        let invoker = ScriptedInvoker::new();
        invoker.fail_on("do the left work", "agent crashed");
        invoker.default_response("done");

        let config = EngineConfig::default();
        let summary = execute_graph(
            &mut graph,
            &invoker,
            &config,
            Path::new("."),
            &HashMap::new(),
            &mut no_checkpoint(),
        )
        .unwrap();

        assert_eq!(summary.failed, vec!["left".to_string()]);
        assert_eq!(summary.skipped, vec!["join".to_string()]);
        // The sibling still ran.
        assert!(summary.succeeded.contains(&"right".to_string()));
        // Every unit is terminal.
        assert!(graph.units().iter().all(|u| u.status.is_terminal()));
    }

    #[test]
    fn test_dependency_output_is_injected_downstream() {
        let mut graph = diamond();
        graph.additional_context = "Prefer small steps.".to_string();
        let invoker = ScriptedInvoker::new();
        invoker.on("do the root work", "ROOT FINDINGS");
        invoker.default_response("done");

        let config = EngineConfig::default();
        execute_graph(
            &mut graph,
            &invoker,
            &config,
            Path::new("."),
            &HashMap::new(),
            &mut no_checkpoint(),
        )
        .unwrap();

        let left_prompts = invoker.prompts_containing("do the left work");
        assert_eq!(left_prompts.len(), 1);
        assert!(left_prompts[0].contains("=== Global Instructions ===\nPrefer small steps."));
        assert!(left_prompts[0].contains("=== Output from task root ===\nROOT FINDINGS"));
        assert!(left_prompts[0].contains("--- Your task ---\ndo the left work"));
    }

    #[test]
    fn test_resume_skips_cached_units_and_reuses_outputs() {
        let mut graph = diamond();
        let invoker = ScriptedInvoker::new();
        invoker.default_response("done");

        let mut completed = HashMap::new();
        completed.insert("root".to_string(), "CACHED ROOT OUTPUT".to_string());

        let config = EngineConfig::default();
        let summary = execute_graph(
            &mut graph,
            &invoker,
            &config,
            Path::new("."),
            &completed,
            &mut no_checkpoint(),
        )
        .unwrap();

        assert!(summary.all_succeeded());
        // The cached unit's agent was never re-invoked.
        assert!(invoker.prompts_containing("do the root work").is_empty());
        // But its cached output flowed into dependents.
        let left_prompts = invoker.prompts_containing("do the left work");
        assert!(left_prompts[0].contains("CACHED ROOT OUTPUT"));
    }

    #[test]
    fn test_checkpoint_runs_after_every_wave() {
        let mut graph = diamond();
        let invoker = ScriptedInvoker::new();
        invoker.default_response("done");

        let mut snapshots: Vec<usize> = Vec::new();
        let mut checkpoint = |g: &TaskGraph| {
            snapshots.push(g.units().iter().filter(|u| u.status.is_terminal()).count());
            Ok(())
        };

        let config = EngineConfig::default();
        execute_graph(
            &mut graph,
            &invoker,
            &config,
            Path::new("."),
            &HashMap::new(),
            &mut checkpoint,
        )
        .unwrap();

        // Three waves: root, left+right, join.
        assert_eq!(snapshots, vec![1, 3, 4]);
    }

    #[test]
    fn test_checkpoint_failure_aborts_execution() {
        let mut graph = diamond();
        let invoker = ScriptedInvoker::new();
        invoker.default_response("done");

        let mut checkpoint =
            |_: &TaskGraph| Err(EngineError::persistence("disk full"));

        let config = EngineConfig::default();
        let err = execute_graph(
            &mut graph,
            &invoker,
            &config,
            Path::new("."),
            &HashMap::new(),
            &mut checkpoint,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
        // Only the first wave ran.
        assert!(invoker.prompts_containing("do the left work").is_empty());
    }

    #[test]
    fn test_long_dependency_output_is_truncated() {
        let mut graph = diamond();
        let invoker = ScriptedInvoker::new();
        invoker.on("do the root work", &"x".repeat(5000));
        invoker.default_response("done");

        let config = EngineConfig::default();
        execute_graph(
            &mut graph,
            &invoker,
            &config,
            Path::new("."),
            &HashMap::new(),
            &mut no_checkpoint(),
        )
        .unwrap();

        let left_prompts = invoker.prompts_containing("do the left work");
        assert!(left_prompts[0].contains("... [truncated]"));
        assert!(left_prompts[0].len() < 4000);
    }
}
