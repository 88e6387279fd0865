//! Markdown report rendered from a finished (or stopped) session.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::models::{SessionState, StepId};

/// Render the session as a self-contained markdown document.
pub fn render_report(state: &SessionState) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Research Report: {}\n\n", state.goal));
    out.push_str(&format!("- Session: `{}`\n", state.id));
    out.push_str(&format!("- Status: {}\n", state.status));
    out.push_str(&format!(
        "- Rounds completed: {}/{}\n",
        state.completed_rounds(),
        state.total_rounds
    ));
    out.push_str(&format!(
        "- Generated: {}\n\n",
        Utc::now().format("%Y-%m-%d %H:%M UTC")
    ));

    for round in &state.rounds {
        out.push_str(&format!("## Round {}\n\n", round.round_num));
        if let Some(metric) = &round.best_metric {
            out.push_str(&format!("**Best metric:** {metric}\n\n"));
        }

        if let Some(experiment) = round.step(StepId::Experiment) {
            out.push_str("### Experiments\n\n");
            for output in &experiment.outputs {
                let body = if output.success {
                    &output.text
                } else {
                    &output.error
                };
                out.push_str(&format!("```\n{}\n```\n\n", body.trim()));
            }
        }

        if !round.conclusion.is_empty() {
            out.push_str("### Conclusion\n\n");
            out.push_str(round.conclusion.trim());
            out.push_str("\n\n");
        }
        if !round.next_hypotheses.is_empty() {
            out.push_str("### Next hypotheses\n\n");
            for hypothesis in &round.next_hypotheses {
                out.push_str(&format!("- {hypothesis}\n"));
            }
            out.push('\n');
        }
    }

    if !state.carryover.learnings.is_empty() {
        out.push_str("## Accumulated learnings\n\n");
        for learning in &state.carryover.learnings {
            out.push_str(&format!("- {learning}\n"));
        }
        out.push('\n');
    }
    out
}

/// Write the report to `dir` under a timestamped name and return its path.
pub fn write_report(state: &SessionState, dir: &Path) -> Result<PathBuf> {
    let name = format!("research_report_{}.md", Utc::now().format("%Y%m%d_%H%M%S"));
    let path = dir.join(name);
    std::fs::write(&path, render_report(state))
        .with_context(|| format!("failed to write report to {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RoundRecord;
    use std::path::PathBuf;

    fn state_with_round() -> SessionState {
        let mut state = SessionState::new_research("improve auc", PathBuf::from("."), 2);
        let mut round = RoundRecord::new(1);
        round.conclusion = "Wider nets help.".to_string();
        round.best_metric = Some("auc 0.83".to_string());
        round.next_hypotheses = vec!["try depth next".to_string()];
        round.finished_at = Some(Utc::now());
        state.rounds.push(round);
        state.carryover.learnings.push("Round 1: best metric auc 0.83".to_string());
        state
    }

    #[test]
    fn test_report_structure() {
        let report = render_report(&state_with_round());
        assert!(report.starts_with("# Research Report: improve auc"));
        assert!(report.contains("## Round 1"));
        assert!(report.contains("**Best metric:** auc 0.83"));
        assert!(report.contains("Wider nets help."));
        assert!(report.contains("- try depth next"));
        assert!(report.contains("## Accumulated learnings"));
    }

    #[test]
    fn test_write_report_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_report(&state_with_round(), dir.path()).unwrap();
        assert!(path.exists());
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("Rounds completed: 1/2"));
    }
}
