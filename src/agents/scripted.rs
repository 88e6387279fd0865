//! Scripted invoker for tests: canned outputs instead of real processes.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use super::{AgentInvoker, AgentKind, InvocationOutput};

/// One canned response. Matched by substring against the prompt; a response
/// with no matcher matches anything. Matching is first-wins in insertion
/// order, and responses with `once = true` are consumed.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub matcher: Option<String>,
    pub text: String,
    pub exit_code: i32,
    pub once: bool,
}

/// Record of one invocation, kept for assertions.
#[derive(Debug, Clone)]
pub struct RecordedInvocation {
    pub kind: AgentKind,
    pub prompt: String,
}

#[derive(Default)]
struct ScriptState {
    responses: Vec<ScriptedResponse>,
    invocations: Vec<RecordedInvocation>,
}

/// In-memory [`AgentInvoker`] returning scripted outputs.
#[derive(Default)]
pub struct ScriptedInvoker {
    state: Mutex<ScriptState>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond with `text` to any prompt containing `matcher`.
    pub fn on(&self, matcher: &str, text: &str) -> &Self {
        self.push(ScriptedResponse {
            matcher: Some(matcher.to_string()),
            text: text.to_string(),
            exit_code: 0,
            once: false,
        });
        self
    }

    /// Like [`Self::on`] but consumed after the first match. Queue several
    /// for attempt-by-attempt sequences.
    pub fn on_once(&self, matcher: &str, text: &str) -> &Self {
        self.push(ScriptedResponse {
            matcher: Some(matcher.to_string()),
            text: text.to_string(),
            exit_code: 0,
            once: true,
        });
        self
    }

    /// Fail (non-zero exit) any prompt containing `matcher`.
    pub fn fail_on(&self, matcher: &str, text: &str) -> &Self {
        self.push(ScriptedResponse {
            matcher: Some(matcher.to_string()),
            text: text.to_string(),
            exit_code: 1,
            once: false,
        });
        self
    }

    /// Fallback response for prompts nothing else matches.
    pub fn default_response(&self, text: &str) -> &Self {
        self.push(ScriptedResponse {
            matcher: None,
            text: text.to_string(),
            exit_code: 0,
            once: false,
        });
        self
    }

    fn push(&self, response: ScriptedResponse) {
        self.state.lock().unwrap().responses.push(response);
    }

    /// All prompts seen so far, in invocation order.
    pub fn invocations(&self) -> Vec<RecordedInvocation> {
        self.state.lock().unwrap().invocations.clone()
    }

    /// Prompts containing the given substring.
    pub fn prompts_containing(&self, needle: &str) -> Vec<String> {
        self.invocations()
            .into_iter()
            .map(|i| i.prompt)
            .filter(|p| p.contains(needle))
            .collect()
    }
}

impl AgentInvoker for ScriptedInvoker {
    fn invoke(
        &self,
        kind: AgentKind,
        prompt: &str,
        _cwd: &Path,
        _timeout: Duration,
    ) -> anyhow::Result<InvocationOutput> {
        let mut state = self.state.lock().unwrap();
        state.invocations.push(RecordedInvocation {
            kind,
            prompt: prompt.to_string(),
        });

        let matched = state.responses.iter().position(|r| match &r.matcher {
            Some(m) => prompt.contains(m.as_str()),
            None => true,
        });

        let response = match matched {
            Some(idx) => {
                if state.responses[idx].once {
                    state.responses.remove(idx)
                } else {
                    state.responses[idx].clone()
                }
            }
            None => ScriptedResponse {
                matcher: None,
                text: format!("scripted output for: {kind}"),
                exit_code: 0,
                once: false,
            },
        };

        Ok(InvocationOutput {
            text: response.text,
            exit_code: Some(response.exit_code),
            duration: Duration::from_millis(1),
            timed_out: false,
        })
    }
}
