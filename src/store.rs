//! Variable and result stores.
//!
//! Mirrors the teacher's `store/datastore.rs`: a lock-free concurrent map
//! keyed by task/variable name. The engine is single-threaded at the top
//! level, but `PARALLEL` children run concurrently and read the same
//! snapshot, so reads must not contend with each other even though writes
//! are serialized through the parent (§5: "the variable store is mutated
//! only by VARIABLES and by the PARALLEL merge step; while children run,
//! the parent's store is a snapshot copy").

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use crate::value::{Control, ResultType, Value, Variable};

/// Outcome tag for a completed task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    Success,
    Failed(String),
}

/// The result of one task's execution, as produced by a handler and stored
/// by the engine under `task.id`.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub value: Value,
    pub result_type: ResultType,
    pub control: Control,
    pub status: TaskStatus,
    pub duration: Duration,
}

impl TaskResult {
    pub fn success(value: Value, result_type: ResultType, duration: Duration) -> Self {
        Self {
            value,
            result_type,
            control: Control::default(),
            status: TaskStatus::Success,
            duration,
        }
    }

    pub fn success_with_control(
        value: Value,
        result_type: ResultType,
        control: Control,
        duration: Duration,
    ) -> Self {
        Self {
            value,
            result_type,
            control,
            status: TaskStatus::Success,
            duration,
        }
    }

    pub fn failed(message: impl Into<String>, duration: Duration) -> Self {
        Self {
            value: Value::Null,
            result_type: ResultType::Json,
            control: Control::default(),
            status: TaskStatus::Failed(message.into()),
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, TaskStatus::Success)
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            TaskStatus::Failed(msg) => Some(msg),
            TaskStatus::Success => None,
        }
    }
}

/// Append-mostly, thread-safe map from task id to its result.
#[derive(Debug, Default)]
pub struct ResultStore {
    results: DashMap<String, TaskResult, FxBuildHasher>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates from a caller-supplied map, used by resume (§4.4).
    pub fn with_prefilled(prefilled: BTreeMap<String, TaskResult>) -> Self {
        let results = DashMap::with_hasher(FxBuildHasher::default());
        for (k, v) in prefilled {
            results.insert(k, v);
        }
        Self { results }
    }

    pub fn insert(&self, task_id: impl Into<String>, result: TaskResult) {
        self.results.insert(task_id.into(), result);
    }

    pub fn get(&self, task_id: &str) -> Option<TaskResult> {
        self.results.get(task_id).map(|r| r.clone())
    }

    pub fn contains_successful(&self, task_id: &str) -> bool {
        self.results
            .get(task_id)
            .map(|r| r.is_success())
            .unwrap_or(false)
    }
}

impl Clone for TaskResult {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            result_type: self.result_type,
            control: self.control.clone(),
            status: self.status.clone(),
            duration: self.duration,
        }
    }
}

/// Flow-scoped variable store, shared via `Arc` so `PARALLEL` children can
/// hold an independent snapshot taken at entry.
#[derive(Debug, Default)]
pub struct VariableStore {
    vars: DashMap<String, Variable, FxBuildHasher>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.vars.get(name).map(|v| v.value.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Declares or overwrites a variable. Caller is responsible for the
    /// `overwrite` guard (§4.6) before calling this.
    pub fn set(&self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.vars.insert(name.clone(), Variable { name, value });
    }

    /// A point-in-time snapshot used as the read-only scope for a
    /// `PARALLEL` child or a sequential expansion pass.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.vars
            .iter()
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect()
    }
}

/// A self-contained clone used as the live store for a `PARALLEL` child:
/// independent of the parent until its writes journal is merged back.
pub fn snapshot_store(vars: &VariableStore) -> Arc<VariableStore> {
    let child = VariableStore::new();
    for (k, v) in vars.snapshot() {
        child.set(k, v);
    }
    Arc::new(child)
}
