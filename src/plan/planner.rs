//! Plan generation through the Agent Invocation Port.
//!
//! The goal is handed to a reasoner agent with a strict-JSON prompt; the
//! reply is parsed into a [`Plan`]. Failure is non-retryable for the
//! invocation: the caller decides whether to ask again.

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::agents::{AgentInvoker, AgentKind};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::plan::graph::TaskGraph;
use crate::plan::schema::{Plan, Unit};

const PLAN_PROMPT: &str = "\
You are a software development task planner.

Break the following goal into 3-8 concrete, actionable subtasks.
Assign each task to the most appropriate agent:

- \"reasoner\": architecture design, complex reasoning, analysis, debugging,
               code review, documentation, strategy
- \"coder\":    code generation, writing tests, implementing functions,
               creating files, refactoring specific code

Rules:
1. Each task prompt must be self-contained and specific enough for the agent to act on alone.
2. Respect natural dependencies (depends_on: list of task ids that must finish first).
3. Tasks with no dependencies and no conflicts can run in parallel (parallel: true).
4. Keep titles short.

Goal: {goal}
Working directory: {cwd}

Respond with ONLY valid JSON, no markdown fences, no explanation:
{
  \"goal\": \"...\",
  \"summary\": \"One sentence: what will be built\",
  \"tasks\": [
    {
      \"id\": \"task-1\",
      \"title\": \"Short action title\",
      \"prompt\": \"Detailed, self-contained prompt for the agent.\",
      \"agent\": \"reasoner\",
      \"depends_on\": [],
      \"parallel\": false
    }
  ]
}";

/// Wire shape of the planner reply. Optional fields are defaulted; a task
/// with no id or no prompt fails planning.
#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    goal: String,
    #[serde(default)]
    summary: String,
    tasks: Vec<RawTask>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    id: String,
    #[serde(default)]
    title: String,
    prompt: String,
    #[serde(default)]
    agent: AgentKind,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    parallel: bool,
}

/// Ask a reasoner agent to decompose `goal` into a validated task graph.
pub fn generate_plan(
    invoker: &dyn AgentInvoker,
    config: &EngineConfig,
    goal: &str,
    cwd: &Path,
) -> Result<TaskGraph, EngineError> {
    let prompt = PLAN_PROMPT
        .replace("{goal}", goal)
        .replace("{cwd}", &cwd.display().to_string());

    let output = invoker
        .invoke(AgentKind::Reasoner, &prompt, cwd, config.invocation_timeout())
        .map_err(|e| EngineError::planning(format!("planner invocation failed: {e:#}")))?;

    if !output.success() {
        return Err(EngineError::planning(format!(
            "planner agent failed: {}",
            output.failure_reason()
        )));
    }

    let plan = parse_plan(&output.text, goal)?;
    debug!(units = plan.units.len(), "plan generated");
    TaskGraph::build(plan)
}

/// Extract the outermost JSON object from agent output and deserialize it.
pub fn parse_plan(raw: &str, fallback_goal: &str) -> Result<Plan, EngineError> {
    let json = extract_json_object(raw).ok_or_else(|| {
        EngineError::planning(format!(
            "no JSON object in planner output: {}",
            truncate(raw, 200)
        ))
    })?;

    let raw_plan: RawPlan = serde_json::from_str(json)
        .map_err(|e| EngineError::planning(format!("invalid planner JSON: {e}")))?;

    if raw_plan.tasks.is_empty() {
        return Err(EngineError::planning("planner returned no tasks"));
    }

    let units = raw_plan
        .tasks
        .into_iter()
        .map(|t| Unit {
            title: if t.title.is_empty() {
                t.id.clone()
            } else {
                t.title
            },
            id: t.id,
            prompt: t.prompt,
            agent: t.agent,
            depends_on: t.depends_on,
            parallel: t.parallel,
            status: Default::default(),
            result: String::new(),
            started_at: None,
            finished_at: None,
        })
        .collect();

    Ok(Plan {
        goal: if raw_plan.goal.is_empty() {
            fallback_goal.to_string()
        } else {
            raw_plan.goal
        },
        summary: raw_plan.summary,
        units,
        additional_context: String::new(),
    })
}

/// First balanced `{...}` spanning the text, tolerating prose or fences
/// around it.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"Here is the plan:
{
  "goal": "build a parser",
  "summary": "parser work",
  "tasks": [
    {"id": "design", "title": "Design grammar", "prompt": "design it", "agent": "reasoner"},
    {"id": "impl", "prompt": "implement it", "agent": "coder", "depends_on": ["design"], "parallel": true}
  ]
}
done."#;

    #[test]
    fn test_parse_plan_with_surrounding_prose() {
        let plan = parse_plan(VALID, "fallback").unwrap();
        assert_eq!(plan.goal, "build a parser");
        assert_eq!(plan.units.len(), 2);
        assert_eq!(plan.units[1].depends_on, vec!["design".to_string()]);
        assert!(plan.units[1].parallel);
        // Missing title falls back to the id.
        assert_eq!(plan.units[1].title, "impl");
    }

    #[test]
    fn test_parse_plan_missing_prompt_fails() {
        let raw = r#"{"tasks": [{"id": "t1"}]}"#;
        assert!(parse_plan(raw, "g").is_err());
    }

    #[test]
    fn test_parse_plan_no_json_fails() {
        let err = parse_plan("I could not produce a plan, sorry.", "g").unwrap_err();
        assert!(err.to_string().contains("no JSON object"));
    }

    #[test]
    fn test_parse_plan_empty_tasks_fails() {
        let err = parse_plan(r#"{"tasks": []}"#, "g").unwrap_err();
        assert!(err.to_string().contains("no tasks"));
    }

    #[test]
    fn test_extract_json_handles_braces_in_strings() {
        let raw = r#"{"tasks": [{"id": "a", "prompt": "use {curly} braces"}]}"#;
        assert_eq!(extract_json_object(raw), Some(raw));
    }

    #[test]
    fn test_generate_plan_surfaces_agent_failure() {
        use crate::agents::ScriptedInvoker;
        let invoker = ScriptedInvoker::new();
        invoker.fail_on("task planner", "rate limited");
        let config = crate::config::EngineConfig::default();
        let err =
            generate_plan(&invoker, &config, "goal", Path::new(".")).unwrap_err();
        assert!(matches!(err, EngineError::PlanningFailed(_)));
    }
}
