//! CLI command entry points.
//! Usage: warp [research|plan|resume|sessions] ...

pub mod plan;
pub mod research;
pub mod resume;
pub mod sessions;

use std::io::{BufRead, Write};

use anyhow::Result;

use crate::agents::CliInvoker;
use crate::config::EngineConfig;
use crate::fs::SessionStore;

/// Shared setup for commands that invoke agents.
pub(crate) fn build_invoker(config: &EngineConfig) -> Result<CliInvoker> {
    let invoker = CliInvoker::new(config.clone());
    invoker.check_binaries()?;
    Ok(invoker)
}

pub(crate) fn open_store() -> Result<SessionStore> {
    SessionStore::open_default()
}

/// Between-round prompt. Anything other than `n` or `q` continues.
pub(crate) fn confirm_next_round(next_round: u32) -> bool {
    print!("Continue to round {next_round}? [Y/n/q] ");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    if std::io::stdin().lock().read_line(&mut line).is_err() {
        return false;
    }
    let answer = line.trim().to_lowercase();
    !matches!(answer.as_str(), "n" | "q")
}
