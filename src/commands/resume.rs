//! `warp resume` - continue an interrupted session from its last checkpoint.

use anyhow::{bail, Context, Result};
use colored::Colorize;

use crate::commands::plan::run_graph;
use crate::commands::research::{install_cancel_handler, report_outcome};
use crate::commands::{build_invoker, confirm_next_round, open_store};
use crate::config::EngineConfig;
use crate::models::{SessionKind, SessionState, SessionStatus};
use crate::plan::graph::TaskGraph;
use crate::research::ResearchEngine;

pub fn execute(session_id: String, yes: bool) -> Result<()> {
    let store = open_store()?;
    let mut state = store.load(&session_id)?;

    if state.status != SessionStatus::InProgress {
        bail!(
            "Session '{}' is {} and cannot be resumed",
            session_id,
            state.status
        );
    }

    let config = EngineConfig::load(&state.cwd)?;
    let invoker = build_invoker(&config)?;

    println!("{} {}", "Resuming:".bold(), state.id);
    println!("{} {}", "Goal:".bold(), state.goal);
    println!("{} {}\n", "Checkpoint:".bold(), state.checkpoint_label());

    match state.kind {
        SessionKind::Research => resume_research(&invoker, &config, &store, &mut state, yes),
        SessionKind::Plan => resume_plan(&invoker, &config, &store, &mut state),
    }
}

fn resume_research(
    invoker: &crate::agents::CliInvoker,
    config: &EngineConfig,
    store: &crate::fs::SessionStore,
    state: &mut SessionState,
    yes: bool,
) -> Result<()> {
    let engine = ResearchEngine::new(invoker, config, store);
    install_cancel_handler(&engine);

    let cwd = state.cwd.clone();
    let mut hook = |next: u32| yes || confirm_next_round(next);
    let outcome = match engine.run(state, &mut hook) {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!(
                "{} {e}\n{} {}",
                "Session failed:".red().bold(),
                "Last checkpoint:".yellow(),
                state.checkpoint_label()
            );
            return Err(e.into());
        }
    };
    report_outcome(state, outcome, &cwd)
}

fn resume_plan(
    invoker: &crate::agents::CliInvoker,
    config: &EngineConfig,
    store: &crate::fs::SessionStore,
    state: &mut SessionState,
) -> Result<()> {
    let mut plan = state
        .plan
        .clone()
        .context("Plan session has no stored plan")?;

    // Statuses are rebuilt from the checkpoint, so reset any non-terminal
    // leftovers before re-execution.
    for unit in &mut plan.units {
        if !state.completed_units.contains(&unit.id) {
            unit.status = Default::default();
            unit.result = String::new();
        }
    }

    let mut graph = TaskGraph::build(plan)?;
    println!(
        "{} {} of {} unit(s) already completed",
        "Progress:".bold(),
        state.completed_units.len(),
        graph.len()
    );

    run_graph(&mut graph, invoker, config, store, state)
}
