//! `warp sessions` - list and inspect stored sessions.

use anyhow::Result;
use colored::Colorize;

use crate::commands::open_store;

pub fn list(limit: usize) -> Result<()> {
    let store = open_store()?;
    let sessions = store.list();
    if sessions.is_empty() {
        println!("(no sessions under {})", store.root().display());
        return Ok(());
    }

    println!(
        "{:<44} {:<12} {:<14} {}",
        "SESSION".bold(),
        "STATUS".bold(),
        "PROGRESS".bold(),
        "GOAL".bold()
    );
    for session in sessions.iter().take(limit) {
        println!(
            "{:<44} {:<12} {:<14} {}",
            session.id,
            session.status.to_string(),
            session.progress_label(),
            truncate(&session.goal, 60)
        );
    }
    Ok(())
}

pub fn show(session_id: String) -> Result<()> {
    let store = open_store()?;
    let state = store.load(&session_id)?;

    println!("{} {}", "Session:".bold(), state.id);
    println!("{} {}", "Goal:".bold(), state.goal);
    println!("{} {}", "Status:".bold(), state.status);
    println!("{} {}", "Progress:".bold(), state.progress_label());
    println!("{} {}", "Checkpoint:".bold(), state.checkpoint_label());
    println!("{} {}", "Updated:".bold(), state.updated_at.format("%Y-%m-%d %H:%M UTC"));

    for round in &state.rounds {
        let marker = if round.finished_at.is_some() {
            "done".green()
        } else {
            "in flight".yellow()
        };
        println!("\n{} {} [{marker}]", "Round".bold(), round.round_num);
        for step in &round.steps {
            println!(
                "  step {} ({}): {:.0}s, {} output(s)",
                step.step.number(),
                step.step.name(),
                step.duration_secs,
                step.outputs.len()
            );
        }
        if let Some(metric) = &round.best_metric {
            println!("  best metric: {metric}");
        }
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}
