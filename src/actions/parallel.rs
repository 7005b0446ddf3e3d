//! PARALLEL (§4.5): runs the carved-out `tasks` list concurrently, each
//! against an independent variable-store snapshot, then merges their
//! writes back into the live store.
//!
//! Concurrency uses `futures::stream::FuturesUnordered` polled locally
//! rather than `tokio::spawn`/`JoinSet`: branches borrow `ctx.results` and
//! `ctx.events` directly, so nothing here needs a `'static` bound, and
//! `fail_fast` can react the instant the first branch fails by cancelling
//! a child `RunContext` shared by every branch, while still awaiting the
//! rest to a clean stop.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use serde_json::Value as Json;

use crate::context::ExecutionContext;
use crate::engine::{run_tasks, ControlFlow};
use crate::error::{FlowError, Result};
use crate::loader::{parse_tasks_array, Task};
use crate::registry::{Action, ActionOutcome};
use crate::store::{snapshot_store, VariableStore};
use crate::value::{ResultType, Value};

#[derive(Debug, Deserialize)]
struct ParallelPayload {
    #[serde(default)]
    fail_fast: bool,
    #[serde(default)]
    merge_order: Vec<String>,
    #[serde(default = "default_merge_strategy")]
    merge_strategy: String,
}

fn default_merge_strategy() -> String {
    "last_write_wins".to_string()
}

pub struct ParallelAction;

#[async_trait]
impl Action for ParallelAction {
    fn name(&self) -> &'static str {
        "PARALLEL"
    }

    async fn execute(&self, ctx: &ExecutionContext<'_>, payload: &Json) -> Result<ActionOutcome> {
        let tasks_json = payload.get("tasks").cloned().unwrap_or(Json::Array(vec![]));
        let body = parse_tasks_array(&tasks_json)?;
        let parsed: ParallelPayload =
            serde_json::from_value(payload.clone()).map_err(|e| FlowError::TypeMismatch {
                name: "<PARALLEL payload>".to_string(),
                detail: e.to_string(),
            })?;

        let entry_snapshot = ctx.variables.snapshot();
        let group_run = ctx.run.child();

        let max_concurrency = ctx.run.config().max_parallel_concurrency;
        let semaphore: Option<Arc<tokio::sync::Semaphore>> =
            (max_concurrency > 0).then(|| Arc::new(tokio::sync::Semaphore::new(max_concurrency)));

        let mut futures = FuturesUnordered::new();
        for task in &body {
            let child_store = snapshot_store(ctx.variables);
            let branch_run = group_run.clone();
            let task = task.clone();
            let semaphore = semaphore.clone();
            futures.push(async move {
                let _permit = match semaphore {
                    Some(sem) => Some(
                        sem.acquire_owned()
                            .await
                            .expect("parallel concurrency semaphore is never closed"),
                    ),
                    None => None,
                };
                let outcome = run_tasks(
                    std::slice::from_ref(&task),
                    &child_store,
                    ctx.results,
                    &branch_run,
                    ctx.events,
                )
                .await;
                (task.id.clone(), child_store, outcome)
            });
        }

        let mut children: Vec<(String, Arc<VariableStore>, Result<ControlFlow>)> = Vec::new();
        let mut first_error: Option<FlowError> = None;
        while let Some((id, store, outcome)) = futures.next().await {
            if outcome.is_err() && first_error.is_none() {
                first_error = Some(match &outcome {
                    Err(e) => clone_error(e),
                    Ok(_) => unreachable!(),
                });
                if parsed.fail_fast {
                    group_run.cancel();
                }
            }
            children.push((id, store, outcome));
        }

        let merge_order: Vec<String> = if parsed.merge_order.is_empty() {
            body.iter().map(|t| t.id.clone()).collect()
        } else {
            parsed.merge_order.clone()
        };
        let fail_on_conflict = parsed.merge_strategy == "fail_on_conflict";

        let mut merged: BTreeMap<String, Value> = BTreeMap::new();
        for id in &merge_order {
            let Some((_, store, outcome)) = children.iter().find(|(cid, _, _)| cid == id) else {
                continue;
            };
            if outcome.is_err() {
                continue;
            }
            let journal = diff_snapshot(&entry_snapshot, &store.snapshot());
            for (k, v) in journal {
                if fail_on_conflict {
                    if let Some(prev) = merged.get(&k) {
                        if *prev != v {
                            return Err(FlowError::MergeConflict { variable: k });
                        }
                    }
                }
                merged.insert(k, v);
            }
        }
        for (k, v) in &merged {
            ctx.variables.set(k.clone(), v.clone());
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        let result_map: serde_json::Map<String, Json> = children
            .iter()
            .map(|(id, _, outcome)| (id.clone(), child_entry(id, outcome, ctx.results)))
            .collect();

        Ok(ActionOutcome::new(
            Value::from_json_raw(Json::Object(result_map)),
            ResultType::Json,
        ))
    }
}

/// Builds this child's `{result?, type?, error?}` entry from the shared
/// result store (success) or the branch's own error (failure).
fn child_entry(id: &str, outcome: &Result<ControlFlow>, results: &crate::store::ResultStore) -> Json {
    let mut entry = serde_json::Map::new();
    match outcome {
        Ok(_) => {
            if let Some(result) = results.get(id) {
                entry.insert("result".to_string(), result.value.to_json_masked());
                entry.insert(
                    "type".to_string(),
                    Json::String(result.result_type.wire_str().to_string()),
                );
            }
        }
        Err(e) => {
            entry.insert("error".to_string(), Json::String(e.to_string()));
        }
    }
    Json::Object(entry)
}

/// `FlowError` doesn't implement `Clone` (it boxes `dyn Error` in one
/// variant); reconstructing it by display string is enough here since we
/// only need to surface the first branch's failure as the action's own.
fn clone_error(e: &FlowError) -> FlowError {
    FlowError::Action {
        task_id: "PARALLEL".to_string(),
        action: "PARALLEL".to_string(),
        source: e.to_string().into(),
    }
}

fn diff_snapshot(
    entry: &BTreeMap<String, Value>,
    child: &BTreeMap<String, Value>,
) -> BTreeMap<String, Value> {
    child
        .iter()
        .filter(|(k, v)| entry.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;
    use crate::event::EventBus;
    use crate::store::ResultStore;
    use serde_json::json;

    fn ensure_builtins() {
        let _ = crate::registry::global_registry();
    }

    fn ctx<'a>(
        results: &'a ResultStore,
        variables: &'a VariableStore,
        events: &'a EventBus,
    ) -> ExecutionContext<'a> {
        ExecutionContext::new("par1", "PARALLEL", results, variables, RunContext::new(), events)
    }

    #[tokio::test]
    async fn merges_independent_writes_last_write_wins() {
        ensure_builtins();
        let variables = VariableStore::new();
        let results = ResultStore::new();
        let events = EventBus::new("f", 16);
        let c = ctx(&results, &variables, &events);
        let payload = json!({
            "fail_fast": false,
            "merge_strategy": "last_write_wins",
            "tasks": [
                {"id": "a", "action": "VARIABLES", "overwrite": false, "variables": [{"name": "x", "type": "number", "value": 1}]},
                {"id": "b", "action": "VARIABLES", "overwrite": false, "variables": [{"name": "y", "type": "number", "value": 2}]}
            ]
        });
        ParallelAction.execute(&c, &payload).await.unwrap();
        assert_eq!(variables.get("x"), Some(Value::Number(1.0)));
        assert_eq!(variables.get("y"), Some(Value::Number(2.0)));
    }

    #[tokio::test]
    async fn fail_on_conflict_detects_same_key_different_value() {
        ensure_builtins();
        let variables = VariableStore::new();
        let results = ResultStore::new();
        let events = EventBus::new("f", 16);
        let c = ctx(&results, &variables, &events);
        let payload = json!({
            "fail_fast": false,
            "merge_strategy": "fail_on_conflict",
            "merge_order": ["a", "b"],
            "tasks": [
                {"id": "a", "action": "VARIABLES", "overwrite": false, "variables": [{"name": "x", "type": "number", "value": 1}]},
                {"id": "b", "action": "VARIABLES", "overwrite": false, "variables": [{"name": "x", "type": "number", "value": 2}]}
            ]
        });
        let err = ParallelAction.execute(&c, &payload).await.unwrap_err();
        assert!(matches!(err, FlowError::MergeConflict { .. }));
    }

    #[tokio::test]
    async fn concurrency_cap_limits_simultaneous_branches() {
        ensure_builtins();
        let variables = VariableStore::new();
        let results = ResultStore::new();
        let events = EventBus::new("f", 16);
        let mut config = crate::config::EngineConfig::default();
        config.max_parallel_concurrency = 1;
        let run = RunContext::new().with_config(config);
        let c = ExecutionContext::new("par1", "PARALLEL", &results, &variables, run, &events);
        let payload = json!({
            "fail_fast": false,
            "tasks": [
                {"id": "a", "action": "SLEEP", "seconds": 0.05},
                {"id": "b", "action": "SLEEP", "seconds": 0.05}
            ]
        });
        let start = std::time::Instant::now();
        ParallelAction.execute(&c, &payload).await.unwrap();
        assert!(start.elapsed() >= std::time::Duration::from_millis(90));
    }

    #[tokio::test]
    async fn fail_fast_cancels_sibling_sleep() {
        ensure_builtins();
        let variables = VariableStore::new();
        let results = ResultStore::new();
        let events = EventBus::new("f", 16);
        let c = ctx(&results, &variables, &events);
        let payload = json!({
            "fail_fast": true,
            "tasks": [
                {"id": "bad", "action": "VARIABLES", "overwrite": false, "variables": [{"name": "x", "type": "number", "value": "not-a-number"}]},
                {"id": "slow", "action": "SLEEP", "seconds": 30}
            ]
        });
        let start = std::time::Instant::now();
        let err = ParallelAction.execute(&c, &payload).await.unwrap_err();
        assert!(matches!(err, FlowError::Action { .. }));
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
    }
}
