//! Run context: cancellation, stop signal, stop-at-task marker, resume flag.
//!
//! A single `tokio_util::sync::CancellationToken` is the sole cancellation
//! mechanism (§5), matching the teacher's stated use of `tokio-util` for
//! workflow abort. `PARALLEL` derives a child token per iteration so
//! `fail_fast` can cancel siblings without affecting the parent flow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{FlowError, Result};
use crate::event::{EventBus, FlowEventKind};
use crate::store::{ResultStore, VariableStore};
use crate::value::Value;

/// Hierarchical cancellation + stop/resume state for one run.
#[derive(Clone)]
pub struct RunContext {
    pub(crate) token: CancellationToken,
    stop: Arc<AtomicBool>,
    stop_at_task: Arc<Mutex<Option<String>>>,
    resume: bool,
    config: Arc<EngineConfig>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            stop: Arc::new(AtomicBool::new(false)),
            stop_at_task: Arc::new(Mutex::new(None)),
            resume: false,
            config: Arc::new(EngineConfig::default()),
        }
    }

    pub fn resumable() -> Self {
        let mut ctx = Self::new();
        ctx.resume = true;
        ctx
    }

    /// Attaches the engine configuration this run (and every child derived
    /// from it) should honor — SLEEP/EVALUATE's sleep ceiling, PARALLEL's
    /// concurrency cap.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fails if `seconds` exceeds the configured sleep ceiling. Shared by
    /// SLEEP and EVALUATE's branch `sleep`, the run's only two places that
    /// pause for caller-supplied durations.
    pub fn enforce_sleep_ceiling(&self, seconds: f64) -> Result<()> {
        if let Some(ceiling) = self.config.max_sleep_seconds {
            if seconds > ceiling {
                return Err(FlowError::SleepCeilingExceeded { seconds, ceiling });
            }
        }
        Ok(())
    }

    /// A child context sharing the stop/resume state and config but with
    /// its own cancellation token linked to the parent's (cancelling the
    /// parent cancels all children; cancelling a child does not affect the
    /// parent).
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            stop: self.stop.clone(),
            stop_at_task: self.stop_at_task.clone(),
            resume: self.resume,
            config: self.config.clone(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn set_stop_at_task(&self, task_id: Option<String>) {
        *self.stop_at_task.lock() = task_id;
    }

    pub fn stop_at_task(&self) -> Option<String> {
        self.stop_at_task.lock().clone()
    }

    pub fn is_resume(&self) -> bool {
        self.resume
    }

    /// Fails with `Cancelled` if the token has fired, else `StopRequested`
    /// if a stop is pending. Checked between tasks (§4.4 step 1).
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        if self.is_stop_requested() {
            return Err(FlowError::StopRequested);
        }
        Ok(())
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Passed by the engine to each action handler. Handlers receive read-only
/// views of prior results and the current variable snapshot; they never
/// see a `&mut` to engine-owned state (§3 "Ownership").
pub struct ExecutionContext<'a> {
    pub task_id: &'a str,
    pub action: &'a str,
    pub results: &'a ResultStore,
    pub variables: &'a VariableStore,
    pub run: RunContext,
    pub events: &'a EventBus,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        task_id: &'a str,
        action: &'a str,
        results: &'a ResultStore,
        variables: &'a VariableStore,
        run: RunContext,
        events: &'a EventBus,
    ) -> Self {
        Self {
            task_id,
            action,
            results,
            variables,
            run,
            events,
        }
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.get(name)
    }

    /// Printf-style logger (§6 "logger"): emits a `task_log` event carrying
    /// `message`, attributed to this task.
    pub fn log(&self, message: impl Into<String>) {
        self.events.emit(
            FlowEventKind::TaskLog {
                message: message.into(),
            },
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_cancellation_does_not_affect_parent() {
        let parent = RunContext::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn parent_cancellation_propagates_to_child() {
        let parent = RunContext::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn stop_signal_is_shared_across_children() {
        let parent = RunContext::new();
        let child = parent.child();
        child.request_stop();
        assert!(parent.is_stop_requested());
    }
}
