//! Parsing of background-task directives out of agent output.
//!
//! An agent that wants a long-running job supervised rather than executed
//! inline emits a `BACKGROUND_TASK` block:
//!
//! ```text
//! BACKGROUND_TASK: train baseline
//! COMMAND: python train.py --config exp1.yaml
//! LOG_FILE: logs/exp1.log
//! COMPLETION_PATTERN: Final AUC:
//! ESTIMATED_TIME: 4h
//! ```
//!
//! Only `COMMAND` is mandatory. Output with no `BACKGROUND_TASK` marker is
//! an inline result, not a directive.

use regex::Regex;

pub const DIRECTIVE_MARKER: &str = "BACKGROUND_TASK";

#[derive(Debug, Clone, PartialEq)]
pub struct JobDirective {
    pub command: String,
    pub log_file: Option<String>,
    pub completion_pattern: Option<String>,
    pub estimated_time: Option<String>,
}

/// Whether agent output requests background supervision at all.
pub fn contains_directive(output: &str) -> bool {
    output.contains(DIRECTIVE_MARKER)
}

/// Extract a directive from agent output.
///
/// `Ok(None)` means the output is an inline result. `Err` means the agent
/// asked for a background job but the block is unusable (no command).
pub fn parse_directive(output: &str) -> Result<Option<JobDirective>, String> {
    if !contains_directive(output) {
        return Ok(None);
    }

    let command = capture_field(output, "COMMAND")
        .ok_or_else(|| "background task directive has no COMMAND line".to_string())?;
    if command.is_empty() {
        return Err("background task directive has an empty COMMAND".to_string());
    }

    Ok(Some(JobDirective {
        command,
        log_file: capture_field(output, "LOG_FILE").filter(|s| !s.is_empty()),
        completion_pattern: capture_field(output, "COMPLETION_PATTERN").filter(|s| !s.is_empty()),
        estimated_time: capture_field(output, "ESTIMATED_TIME").filter(|s| !s.is_empty()),
    }))
}

fn capture_field(output: &str, field: &str) -> Option<String> {
    let re = Regex::new(&format!(r"{field}:\s*(.+?)(?:\n|$)"))
        .expect("field pattern must compile");
    re.captures(output)
        .map(|caps| caps[1].trim().to_string())
}
