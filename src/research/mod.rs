//! The research round loop.
//!
//! A session runs up to `total_rounds` rounds of the six-step pipeline.
//! The session snapshot is saved after every step, so a crash or cancel
//! resumes from the last completed step, never re-running earlier ones.
//! Cancellation is honored at round boundaries only.

pub mod steps;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::agents::AgentInvoker;
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::fs::SessionStore;
use crate::models::{Direction, RoundRecord, SessionState, StepId};
use crate::monitor::MonitorTiming;
use crate::resources::{discover_devices, DeviceAllocator};
use steps::{parse_conclusion, run_step, StepContext};

/// How a research run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All rounds ran, or a round declared the goal reached.
    Completed,
    /// The operator declined the next round; the session stays resumable.
    Paused,
    /// A cancel signal arrived; honored at the round boundary.
    Cancelled,
}

pub struct ResearchEngine<'a> {
    invoker: &'a dyn AgentInvoker,
    config: &'a EngineConfig,
    store: &'a SessionStore,
    timing: MonitorTiming,
    cancel: Arc<AtomicBool>,
}

impl<'a> ResearchEngine<'a> {
    pub fn new(
        invoker: &'a dyn AgentInvoker,
        config: &'a EngineConfig,
        store: &'a SessionStore,
    ) -> Self {
        Self {
            invoker,
            config,
            store,
            timing: MonitorTiming::from_config(config),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override the job supervision schedule (tests use a tight one).
    pub fn with_timing(mut self, timing: MonitorTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Flag checked at round boundaries; setting it from a signal handler
    /// stops the session after the current round.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run rounds until done, paused, or cancelled. `continue_hook` is
    /// consulted between rounds; returning false pauses the session.
    pub fn run(
        &self,
        state: &mut SessionState,
        continue_hook: &mut dyn FnMut(u32) -> bool,
    ) -> Result<RunOutcome, EngineError> {
        while state.completed_rounds() < state.total_rounds {
            if self.cancel.load(Ordering::SeqCst) {
                info!("cancel requested, stopping at round boundary");
                state
                    .try_mark_cancelled()
                    .map_err(|e| EngineError::persistence(format!("{e:#}")))?;
                self.store.save(state)?;
                return Ok(RunOutcome::Cancelled);
            }

            let round_num = state.completed_rounds() + 1;
            let mut round = match state.current_round() {
                Some(r) => {
                    info!(round = r.round_num, "resuming partially completed round");
                    r.clone()
                }
                None => {
                    let round = RoundRecord::new(round_num);
                    write_back(state, round.clone());
                    self.store.save(state)?;
                    round
                }
            };

            while let Some(step) = round.next_step() {
                let ctx = self.step_context(state, step);
                let record = run_step(&ctx, state, &round, step)?;
                round.record_step(record);
                write_back(state, round.clone());
                self.store.save(state)?;
            }

            let direction = self.finalize_round(state, &mut round)?;
            match direction {
                Direction::Done => {
                    info!(round = round.round_num, "round declared the goal reached");
                    break;
                }
                Direction::Pivot => {
                    warn!(round = round.round_num, "round recommends a pivot in approach");
                }
                Direction::Continue => {}
            }

            if state.completed_rounds() < state.total_rounds {
                let next = round.round_num + 1;
                if !continue_hook(next) {
                    info!(next_round = next, "operator paused before next round");
                    self.store.save(state)?;
                    return Ok(RunOutcome::Paused);
                }
            }
        }

        state
            .try_mark_completed()
            .map_err(|e| EngineError::persistence(format!("{e:#}")))?;
        self.store.save(state)?;
        Ok(RunOutcome::Completed)
    }

    fn step_context<'s>(&'s self, state: &'s SessionState, step: StepId) -> StepContext<'s> {
        // Devices are probed once per experiment step, not per job: the
        // jobs of one round should see one consistent snapshot.
        let devices = if step == StepId::Experiment {
            let allocator = DeviceAllocator::new(
                discover_devices(),
                self.config.min_free_memory_gb,
                Some(self.config.max_device_utilization),
            );
            allocator.assign(self.config.experiments.max(1))
        } else {
            Vec::new()
        };

        StepContext {
            invoker: self.invoker,
            config: self.config,
            timing: &self.timing,
            cwd: &state.cwd,
            logs_dir: self.logs_dir(state),
            devices,
            cancel: self.cancel.as_ref(),
        }
    }

    fn logs_dir(&self, state: &SessionState) -> PathBuf {
        self.store.root().join(&state.id).join("logs")
    }

    fn finalize_round(
        &self,
        state: &mut SessionState,
        round: &mut RoundRecord,
    ) -> Result<Direction, EngineError> {
        let conclusion_text = round
            .step(StepId::Conclusion)
            .map(|r| r.primary_output().to_string())
            .unwrap_or_default();
        let summary = parse_conclusion(&conclusion_text);

        round.conclusion = conclusion_text;
        round.best_metric = summary.best_metric.clone();
        round.next_hypotheses = summary.next_hypotheses.clone();
        round.direction = summary.direction;
        round.finished_at = Some(Utc::now());

        state.carryover.hypotheses = summary.next_hypotheses;
        let learning = match &summary.best_metric {
            Some(metric) => format!("Round {}: best metric {metric}", round.round_num),
            None => format!(
                "Round {}: {}",
                round.round_num,
                round.conclusion.lines().next().unwrap_or("no conclusion")
            ),
        };
        state.carryover.learnings.push(learning);

        write_back(state, round.clone());
        self.store.save(state)?;
        Ok(summary.direction)
    }
}

fn write_back(state: &mut SessionState, round: RoundRecord) {
    if let Some(existing) = state
        .rounds
        .iter_mut()
        .find(|r| r.round_num == round.round_num)
    {
        *existing = round;
    } else {
        state.rounds.push(round);
    }
}
