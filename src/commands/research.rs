//! `warp research` - run a multi-round research session.

use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use colored::Colorize;

use crate::commands::{build_invoker, confirm_next_round, open_store};
use crate::config::EngineConfig;
use crate::models::SessionState;
use crate::report::write_report;
use crate::research::{ResearchEngine, RunOutcome};

/// Command-line overrides applied on top of `warp.toml`.
#[derive(Debug, Default)]
pub struct Overrides {
    pub rounds: Option<u32>,
    pub analysts: Option<usize>,
    pub implementers: Option<usize>,
    pub experiments: Option<usize>,
}

impl Overrides {
    fn apply(&self, config: &mut EngineConfig) {
        if let Some(rounds) = self.rounds {
            config.rounds = rounds;
        }
        if let Some(analysts) = self.analysts {
            config.analysts = analysts;
        }
        if let Some(implementers) = self.implementers {
            config.implementers = implementers;
        }
        if let Some(experiments) = self.experiments {
            config.experiments = experiments;
        }
    }
}

pub fn execute(goal: String, overrides: Overrides, yes: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to determine working directory")?;
    let mut config = EngineConfig::load(&cwd)?;
    overrides.apply(&mut config);

    let invoker = build_invoker(&config)?;
    let store = open_store()?;
    let mut state = SessionState::new_research(goal, cwd.clone(), config.rounds);

    println!("{} {}", "Session:".bold(), state.id);
    println!("{} {}", "Goal:".bold(), state.goal);
    println!(
        "{} {} rounds, {} analysts, {} experiments per round\n",
        "Setup:".bold(),
        config.rounds,
        config.analysts,
        config.experiments
    );

    let engine = ResearchEngine::new(&invoker, &config, &store);
    install_cancel_handler(&engine);

    let mut hook = |next: u32| yes || confirm_next_round(next);
    let outcome = match engine.run(&mut state, &mut hook) {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!(
                "{} {e}\n{} {}\n{} warp resume {}",
                "Session failed:".red().bold(),
                "Last checkpoint:".yellow(),
                state.checkpoint_label(),
                "Resume with:".yellow(),
                state.id
            );
            return Err(e.into());
        }
    };

    report_outcome(&state, outcome, &cwd)
}

pub(crate) fn install_cancel_handler(engine: &ResearchEngine<'_>) {
    let flag = engine.cancel_flag();
    let result = ctrlc::set_handler(move || {
        eprintln!("\nCancel requested; stopping at the next round boundary...");
        flag.store(true, Ordering::SeqCst);
    });
    if let Err(e) = result {
        tracing::warn!("could not install cancel handler: {e}");
    }
}

pub(crate) fn report_outcome(
    state: &SessionState,
    outcome: RunOutcome,
    cwd: &std::path::Path,
) -> Result<()> {
    match outcome {
        RunOutcome::Completed => {
            let path = write_report(state, cwd)?;
            println!(
                "\n{} {} round(s) finished",
                "Done.".green().bold(),
                state.completed_rounds()
            );
            println!("{} {}", "Report:".bold(), path.display());
        }
        RunOutcome::Paused => {
            println!(
                "\n{} resume with: warp resume {}",
                "Paused.".yellow().bold(),
                state.id
            );
        }
        RunOutcome::Cancelled => {
            println!(
                "\n{} {} round(s) completed before cancel",
                "Cancelled.".yellow().bold(),
                state.completed_rounds()
            );
        }
    }
    Ok(())
}
