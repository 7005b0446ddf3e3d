//! The engine sequencer (§4.4).
//!
//! `run_tasks` is the reusable "RunTasks" interface the design notes call
//! for (§9: "model the engine as a reusable interface that [PARALLEL and
//! FOR] invoke, rather than having the actions reimplement sequencing"):
//! the top-level `Engine::run` and the `PARALLEL`/`FOR` actions all drive
//! the same sequential task loop, just over different task slices and
//! (for PARALLEL) independent variable snapshots.
//!
//! Grounded on the teacher's `runtime/runner.rs` main loop for the
//! dispatch/event shape, and on `chem-core`'s `engine/core.rs` for the
//! explicit index-driven single-step state machine that jump/resume
//! semantics need (`chem-core` advances a cursor one step per call in
//! exactly this way; the teacher's own DAG scheduler doesn't, since it
//! schedules by readiness rather than position).

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::context::{ExecutionContext, RunContext};
use crate::error::{FlowError, Result};
use crate::event::{EventBus, FlowEventKind, TaskSnapshot};
use crate::expansion::expand_object_excluding;
use crate::loader::{Flow, Task};
use crate::registry::{global_registry, ActionOutcome};
use crate::store::{ResultStore, TaskResult, VariableStore};

/// What happened at the end of a task sequence (§4.4 step 8).
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFlow {
    /// Ran every task in the sequence without an exit/break/unresolved jump.
    Continue,
    /// A task set `exit=true`; propagates all the way to the top-level run.
    Exit,
    /// A task set `breakLoop=true`; the caller must be a `FOR` frame.
    Break,
    /// A jump target wasn't found in this sequence; the caller should try
    /// to resolve it in its own enclosing scope.
    Jump(String),
}

/// Carve-out fields per action, kept unexpanded until the composite action
/// itself expands them with the correct nested scope (§4.2).
fn carve_out_fields(action: &str) -> &'static [&'static str] {
    match action.to_uppercase().as_str() {
        "PARALLEL" => &["tasks"],
        "EVALUATE" => &["if_conditions"],
        "FOR" => &["tasks", "condition"],
        _ => &[],
    }
}

/// Expands a task's payload and dispatches it to its registered handler.
/// Expansion failures and handler errors alike are attributed to this task
/// by the caller, which stores them under `task.id` (§7).
#[instrument(skip(task, variables, results, run, events), fields(task_id = %task.id, action = %task.action))]
pub(crate) async fn dispatch_task(
    task: &Task,
    variables: &VariableStore,
    results: &ResultStore,
    run: &RunContext,
    events: &EventBus,
) -> Result<ActionOutcome> {
    let snapshot = variables.snapshot();
    let exclude = carve_out_fields(&task.action);
    let payload = expand_object_excluding(&task.fields, exclude, &snapshot, results)?;
    let payload_json = Json::Object(payload);

    let handler = global_registry()
        .get(&task.action)
        .ok_or_else(|| FlowError::UnknownAction {
            action: task.action.clone(),
        })?;

    let ctx = ExecutionContext::new(&task.id, &task.action, results, variables, run.clone(), events);
    handler.execute(&ctx, &payload_json).await
}

fn snapshot_for(
    task: &Task,
    started_at: DateTime<Utc>,
    result: Option<&TaskResult>,
) -> TaskSnapshot {
    match result {
        None => TaskSnapshot {
            id: task.id.clone(),
            action: task.action.clone(),
            status: "started",
            success: false,
            started_at,
            finished_at: None,
            duration_seconds: None,
            result_type: None,
            result: None,
        },
        Some(r) if r.is_success() => TaskSnapshot {
            id: task.id.clone(),
            action: task.action.clone(),
            status: "success",
            success: true,
            started_at,
            finished_at: Some(Utc::now()),
            duration_seconds: Some(r.duration.as_secs_f64()),
            result_type: Some(r.result_type.wire_str()),
            result: Some(r.value.to_json_masked()),
        },
        Some(r) => TaskSnapshot {
            id: task.id.clone(),
            action: task.action.clone(),
            status: "failed",
            success: false,
            started_at,
            finished_at: Some(Utc::now()),
            duration_seconds: Some(r.duration.as_secs_f64()),
            result_type: None,
            result: None,
        },
    }
}

/// Sequentially runs `tasks`, the reusable interface composite actions call
/// back into. `variables` is mutated in place (sequential semantics);
/// callers that need isolation (PARALLEL children) pass an independent
/// store and merge its writes back themselves.
pub async fn run_tasks(
    tasks: &[Task],
    variables: &VariableStore,
    results: &ResultStore,
    run: &RunContext,
    events: &EventBus,
) -> Result<ControlFlow> {
    let mut index = 0usize;

    while index < tasks.len() {
        run.check()?;

        let task = &tasks[index];

        if run.is_resume() && results.contains_successful(&task.id) {
            debug!(task_id = %task.id, "resume: skipping already-successful task");
            index += 1;
            continue;
        }

        let started_at = Utc::now();
        let t0 = Instant::now();
        events.emit(
            FlowEventKind::TaskStarted,
            Some(snapshot_for(task, started_at, None)),
        );

        let dispatch_result = dispatch_task(task, variables, results, run, events).await;
        let duration = t0.elapsed();

        match dispatch_result {
            Ok(outcome) => {
                let control = outcome.control.clone();
                let result = TaskResult::success_with_control(
                    outcome.value,
                    outcome.result_type,
                    control.clone(),
                    duration,
                );
                results.insert(task.id.clone(), result.clone());
                info!(task_id = %task.id, "task completed");
                events.emit(
                    FlowEventKind::TaskCompleted,
                    Some(snapshot_for(task, started_at, Some(&result))),
                );

                if control.exit {
                    return Ok(ControlFlow::Exit);
                }
                if control.break_loop {
                    return Ok(ControlFlow::Break);
                }
                if let Some(target) = control.jump_to_task_id {
                    match tasks.iter().position(|t| t.id == target) {
                        Some(pos) => index = pos,
                        None => return Ok(ControlFlow::Jump(target)),
                    }
                } else {
                    index += 1;
                }

                if run.stop_at_task().as_deref() == Some(task.id.as_str()) {
                    warn!(task_id = %task.id, "stop-at-task marker reached, requesting stop");
                    run.request_stop();
                }
            }
            Err(e) => {
                let result = TaskResult::failed(e.to_string(), duration);
                results.insert(task.id.clone(), result.clone());
                events.emit(
                    FlowEventKind::TaskFailed {
                        error: e.to_string(),
                    },
                    Some(snapshot_for(task, started_at, Some(&result))),
                );
                return Err(e);
            }
        }
    }

    Ok(ControlFlow::Continue)
}

/// Host-facing exit-code mapping for the outcome of a run (§6). Not used
/// internally — a CLI front end is out of scope here — but kept as a
/// single place for an embedding host to map `Engine::run`'s `Result` onto
/// a process exit code: `0` success, `1` flow failure, `2` usage error
/// (the host's own invocation was malformed, not something this crate can
/// observe), `3` load/validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunOutcome {
    Success = 0,
    FlowFailure = 1,
    UsageError = 2,
    LoadError = 3,
}

impl RunOutcome {
    /// Classifies a completed run's result. Load/validation failures (bad
    /// JSON, unknown actions, schema mismatches) map to `LoadError`;
    /// everything else that failed during execution maps to `FlowFailure`.
    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => RunOutcome::Success,
            Err(
                FlowError::Decode { .. }
                | FlowError::ImportMissing { .. }
                | FlowError::DuplicateId { .. }
                | FlowError::UnknownAction { .. }
                | FlowError::Schema { .. },
            ) => RunOutcome::LoadError,
            Err(_) => RunOutcome::FlowFailure,
        }
    }
}

/// Owns the per-run state: variable store, result store, event bus, and
/// cancellation/stop context. One `Engine` drives exactly one flow run.
pub struct Engine {
    flow_id: String,
    pub variables: VariableStore,
    pub results: ResultStore,
    pub events: EventBus,
    pub run: RunContext,
}

impl Engine {
    /// `config` is attached to `run` (and so to every child context derived
    /// from it via `RunContext::child`) and also sizes the event bus's
    /// broadcast channel, so SLEEP/EVALUATE/PARALLEL handlers dispatched
    /// under this engine all observe the same limits.
    pub fn new(flow_id: impl Into<String>, run: RunContext, config: EngineConfig) -> Self {
        let flow_id = flow_id.into();
        let run = run.with_config(config.clone());
        Self {
            events: EventBus::new(flow_id.clone(), config.event_channel_capacity),
            flow_id,
            variables: VariableStore::new(),
            results: ResultStore::new(),
            run,
        }
    }

    /// Convenience constructor for callers that don't track their own flow
    /// ids (e.g. ad hoc/test runs): stamps a fresh UUID as the run's
    /// `flow_id` rather than leaving it empty in emitted events.
    pub fn new_anonymous(run: RunContext, config: EngineConfig) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), run, config)
    }

    /// Resume variant: pre-populates the result store so tasks with an
    /// existing successful result are skipped (§4.4 "Resume semantics").
    pub fn resumable(flow_id: impl Into<String>, results: ResultStore, config: EngineConfig) -> Self {
        let flow_id = flow_id.into();
        let run = RunContext::resumable().with_config(config.clone());
        Self {
            events: EventBus::new(flow_id.clone(), config.event_channel_capacity),
            flow_id,
            variables: VariableStore::new(),
            results,
            run,
        }
    }

    #[instrument(skip(self, flow), fields(flow_id = %self.flow_id))]
    pub async fn run(&self, flow: &Flow) -> Result<()> {
        self.events.emit(FlowEventKind::FlowLoaded, None);
        self.events.emit(FlowEventKind::FlowStarted, None);

        let outcome = run_tasks(
            &flow.tasks,
            &self.variables,
            &self.results,
            &self.run,
            &self.events,
        )
        .await;

        let final_result = match outcome {
            Ok(ControlFlow::Continue) | Ok(ControlFlow::Exit) => Ok(()),
            Ok(ControlFlow::Break) => Err(FlowError::BreakOutsideLoop),
            Ok(ControlFlow::Jump(task_id)) => Err(FlowError::JumpTargetMissing { task_id }),
            Err(e) => Err(e),
        };

        let error_message = final_result.as_ref().err().map(|e| e.to_string());
        self.events.emit(
            FlowEventKind::FlowFinished {
                error: error_message,
            },
            None,
        );
        final_result
    }
}
