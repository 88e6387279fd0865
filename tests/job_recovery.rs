//! Background jobs inside the experiment step: supervision and repair.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use warp::agents::ScriptedInvoker;
use warp::config::EngineConfig;
use warp::fs::SessionStore;
use warp::models::{SessionState, StepId};
use warp::monitor::MonitorTiming;
use warp::research::{ResearchEngine, RunOutcome};

const DONE_CONCLUSION: &str = "wrap-up\n```json\n{\"best_metric\": \"loss 0.4\", \"next_hypotheses\": [], \"direction\": \"done\", \"critical_question\": \"\"}\n```";

fn fast_timing() -> MonitorTiming {
    MonitorTiming {
        initial_interval: Duration::from_millis(50),
        initial_window: Duration::from_secs(60),
        steady_interval: Duration::from_millis(50),
        stall_grace: Duration::from_secs(60),
        stall_threshold: Duration::from_secs(3600),
        timeout: Duration::from_secs(600),
    }
}

fn script_non_experiment_steps(invoker: &ScriptedInvoker) {
    invoker.on("Produce a focused framing", "framing");
    invoker.on("From that angle", "analysis");
    invoker.on(
        "experiments for this round",
        "plan\n```json\n{\"experiments\": [{\"name\": \"train_run\", \"description\": \"train it\", \"key_change\": \"lr\"}]}\n```",
    );
    invoker.on("Implement experiment configuration", "implemented");
    invoker.on("Analyze the outcomes", "results analysis");
    invoker.on("Write the round conclusion", DONE_CONCLUSION);
}

fn config() -> EngineConfig {
    EngineConfig {
        analysts: 1,
        implementers: 1,
        experiments: 1,
        ..EngineConfig::default()
    }
}

fn session(dir: &Path) -> (SessionStore, SessionState) {
    let store = SessionStore::open(dir.join("sessions"));
    let state = SessionState::new_research("lower the loss", dir.to_path_buf(), 1);
    (store, state)
}

#[test]
fn background_directive_is_supervised_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let invoker = ScriptedInvoker::new();
    script_non_experiment_steps(&invoker);
    invoker.on(
        "Execute this experiment",
        "BACKGROUND_TASK: train_run\nCOMMAND: echo 'epoch 1/1'; echo 'loss: 0.40'; echo 'Training completed'\n",
    );

    let config = config();
    let (store, mut state) = session(dir.path());
    let engine = ResearchEngine::new(&invoker, &config, &store).with_timing(fast_timing());

    let outcome = engine.run(&mut state, &mut |_| true).unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let experiment = state.rounds[0].step(StepId::Experiment).unwrap();
    assert_eq!(experiment.outputs.len(), 1);
    assert!(experiment.outputs[0].success);
    assert!(experiment.outputs[0].text.contains("STATUS: SUCCESS"));
    assert!(experiment.outputs[0].text.contains("ATTEMPTS: 1"));
    assert!(experiment.outputs[0].text.contains("loss=0.4000"));
}

#[test]
fn failed_job_is_repaired_and_succeeds_on_retry() {
    let dir = tempfile::tempdir().unwrap();
    let invoker = ScriptedInvoker::new();
    script_non_experiment_steps(&invoker);
    invoker.on(
        "Execute this experiment",
        "BACKGROUND_TASK: train_run\nCOMMAND: echo 'error: no module named torch'\n",
    );
    invoker.on(
        "has failed",
        "Installed the dependency.\n\nBACKGROUND_TASK: train_run\nCOMMAND: echo 'loss: 0.38'; echo 'Training completed'\n",
    );

    let config = config();
    let (store, mut state) = session(dir.path());
    let engine = ResearchEngine::new(&invoker, &config, &store).with_timing(fast_timing());

    let outcome = engine.run(&mut state, &mut |_| true).unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let experiment = state.rounds[0].step(StepId::Experiment).unwrap();
    assert!(experiment.outputs[0].success);
    assert!(experiment.outputs[0].text.contains("ATTEMPTS: 2"));
    assert!(experiment.outputs[0].text.contains("loss=0.3800"));

    // The repair prompt carried the failing command and the error lines.
    let repairs = invoker.prompts_containing("has failed");
    assert_eq!(repairs.len(), 1);
    assert!(repairs[0].contains("no module named torch"));
}

#[test]
fn cancel_during_a_background_job_terminates_it_and_stops_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let invoker = ScriptedInvoker::new();
    // Registered first so it outranks the DONE conclusion below; the
    // session must still be running when the cancel lands.
    invoker.on(
        "Write the round conclusion",
        "wrap-up\n```json\n{\"best_metric\": null, \"next_hypotheses\": [\"keep going\"], \"direction\": \"continue\", \"critical_question\": \"\"}\n```",
    );
    script_non_experiment_steps(&invoker);
    invoker.on(
        "Execute this experiment",
        "BACKGROUND_TASK: long_train\nCOMMAND: sleep 30\n",
    );

    let config = config();
    let store = SessionStore::open(dir.path().join("sessions"));
    let mut state = SessionState::new_research("lower the loss", dir.path().to_path_buf(), 2);
    let engine = ResearchEngine::new(&invoker, &config, &store).with_timing(fast_timing());
    let cancel = engine.cancel_flag();

    let started = Instant::now();
    let outcome = thread::scope(|scope| {
        let handle = scope.spawn(|| engine.run(&mut state, &mut |_| true));
        thread::sleep(Duration::from_millis(500));
        cancel.store(true, Ordering::SeqCst);
        handle.join().unwrap()
    })
    .unwrap();

    // The 30s job was terminated, not waited out.
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(outcome, RunOutcome::Cancelled);

    let experiment = state.rounds[0].step(StepId::Experiment).unwrap();
    assert!(!experiment.outputs[0].success);
    assert!(experiment.outputs[0].error.contains("cancelled"));
}

#[test]
fn permanently_failing_job_marks_the_experiment_failed_but_the_round_continues() {
    let dir = tempfile::tempdir().unwrap();
    let invoker = ScriptedInvoker::new();
    script_non_experiment_steps(&invoker);
    invoker.on(
        "Execute this experiment",
        "BACKGROUND_TASK: train_run\nCOMMAND: echo 'fatal: disk full'\n",
    );
    invoker.on(
        "has failed",
        "BACKGROUND_TASK: train_run\nCOMMAND: echo 'fatal: still broken'\n",
    );

    let mut config = config();
    config.max_job_retries = 1;
    let (store, mut state) = session(dir.path());
    let engine = ResearchEngine::new(&invoker, &config, &store).with_timing(fast_timing());

    let outcome = engine.run(&mut state, &mut |_| true).unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let experiment = state.rounds[0].step(StepId::Experiment).unwrap();
    assert!(!experiment.outputs[0].success);
    assert!(experiment.outputs[0].error.contains("failed after 2 attempt(s)"));

    // The failure reached the result-analysis prompt, so later steps can
    // reason about it.
    let results_prompts = invoker.prompts_containing("Analyze the outcomes");
    assert!(results_prompts[0].contains("failed after 2 attempt(s)"));
}
