//! `warp plan` - decompose a goal into a task graph and execute it.

use std::collections::HashMap;

use anyhow::{Context, Result};
use colored::Colorize;

use crate::commands::{build_invoker, open_store};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::fs::SessionStore;
use crate::models::SessionState;
use crate::plan::graph::TaskGraph;
use crate::plan::planner::generate_plan;
use crate::plan::schema::UnitStatus;
use crate::scheduler::execute_graph;

pub fn execute(goal: String, context: Option<String>, max_parallel: Option<usize>) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to determine working directory")?;
    let mut config = EngineConfig::load(&cwd)?;
    if let Some(max_parallel) = max_parallel {
        config.max_parallel = max_parallel;
    }

    let invoker = build_invoker(&config)?;
    let store = open_store()?;

    println!("{} {goal}", "Planning:".bold());
    let mut graph = generate_plan(&invoker, &config, &goal, &cwd)?;
    if let Some(context) = context {
        graph.additional_context = context;
    }
    print_graph(&graph);

    let plan = graph_to_plan(&graph);
    let mut state = SessionState::new_plan(goal, cwd, plan);
    store.save(&mut state)?;
    println!("{} {}\n", "Session:".bold(), state.id);

    run_graph(&mut graph, &invoker, &config, &store, &mut state)
}

/// Execute the graph, checkpointing unit completions into the session.
pub(crate) fn run_graph(
    graph: &mut TaskGraph,
    invoker: &dyn crate::agents::AgentInvoker,
    config: &EngineConfig,
    store: &SessionStore,
    state: &mut SessionState,
) -> Result<()> {
    let completed: HashMap<String, String> = state.unit_outputs.clone();
    let cwd = state.cwd.clone();

    let summary = {
        let mut checkpoint = |g: &TaskGraph| -> Result<(), EngineError> {
            for unit in g.units() {
                if unit.status == UnitStatus::Succeeded {
                    state.mark_unit_done(&unit.id, &unit.result);
                }
            }
            store.save(state)
        };
        execute_graph(graph, invoker, config, &cwd, &completed, &mut checkpoint)?
    };

    state.plan = Some(graph_to_plan(graph));
    if summary.all_succeeded() {
        state.try_mark_completed()?;
    }
    store.save(state)?;

    println!(
        "\n{} {} succeeded, {} failed, {} skipped",
        "Finished:".bold(),
        summary.succeeded.len().to_string().green(),
        summary.failed.len().to_string().red(),
        summary.skipped.len().to_string().yellow()
    );
    for id in &summary.failed {
        if let Some(unit) = graph.unit(id) {
            println!("  {} {}: {}", "failed".red(), id, first_line(&unit.result));
        }
    }
    if !summary.all_succeeded() {
        println!("{} warp resume {}", "Retry with:".yellow(), state.id);
    }
    Ok(())
}

fn print_graph(graph: &TaskGraph) {
    for (i, wave) in graph.waves().iter().enumerate() {
        println!("  wave {}: {}", i + 1, wave.join(", "));
    }
}

pub(crate) fn graph_to_plan(graph: &TaskGraph) -> crate::plan::schema::Plan {
    crate::plan::schema::Plan {
        goal: graph.goal.clone(),
        summary: String::new(),
        units: graph.units().to_vec(),
        additional_context: graph.additional_context.clone(),
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}
