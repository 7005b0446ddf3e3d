//! FOR (§4.9): VALUES or NUMERIC iteration over a task-list body.
//!
//! The body `tasks` field and (for NUMERIC mode) `condition` are carved out
//! by the engine so each iteration can expand them against that
//! iteration's own loop-variable binding, instead of expanding once up
//! front against a binding that doesn't exist yet.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value as Json};

use super::evaluate::{evaluate_one, RawCondition};
use crate::context::ExecutionContext;
use crate::engine::{run_tasks, ControlFlow};
use crate::error::{FlowError, Result};
use crate::loader::{parse_tasks_array, Task};
use crate::registry::{Action, ActionOutcome};
use crate::store::{ResultStore, TaskResult};
use crate::value::{is_valid_variable_name, Control, ResultType, Value};

#[derive(Debug, Deserialize)]
struct ForPayload {
    variable: String,
    #[serde(default)]
    values: Option<Vec<Json>>,
    #[serde(default)]
    initial: Option<f64>,
    #[serde(default)]
    condition: Option<RawCondition>,
    #[serde(default)]
    step: Option<f64>,
    #[serde(rename = "require_break", default)]
    require_break: bool,
}

pub struct ForAction;

#[async_trait]
impl Action for ForAction {
    fn name(&self) -> &'static str {
        "FOR"
    }

    async fn execute(&self, ctx: &ExecutionContext<'_>, payload: &Json) -> Result<ActionOutcome> {
        let tasks_json = payload.get("tasks").cloned().unwrap_or(Json::Array(vec![]));
        let body = parse_tasks_array(&tasks_json)?;
        let parsed: ForPayload = serde_json::from_value(strip_carved_out(payload)).map_err(|e| {
            FlowError::TypeMismatch {
                name: "<FOR payload>".to_string(),
                detail: e.to_string(),
            }
        })?;

        if !is_valid_variable_name(&parsed.variable) {
            return Err(FlowError::TypeMismatch {
                name: parsed.variable.clone(),
                detail: "invalid loop variable name".to_string(),
            });
        }

        let mut summaries = Vec::new();
        let mut broke = false;
        let mut bubbled_control = Control::default();

        match (&parsed.values, parsed.initial) {
            (Some(_), Some(_)) => {
                return Err(FlowError::TypeMismatch {
                    name: "<FOR mode>".to_string(),
                    detail: "'values' and 'initial' are mutually exclusive FOR modes".to_string(),
                })
            }
            (Some(values), None) => {
                for (index, raw_value) in values.iter().enumerate() {
                    let value = Value::from_json_raw(raw_value.clone());
                    ctx.variables.set(&parsed.variable, value);

                    let flow = run_tasks(&body, ctx.variables, ctx.results, &ctx.run, ctx.events).await?;
                    summaries.push(iteration_summary(index, None, Some(raw_value.clone()), &body, ctx.results));

                    if handle_flow(flow, &mut broke, &mut bubbled_control) {
                        break;
                    }
                }
            }
            (None, Some(initial)) => {
                let condition = parsed.condition.ok_or_else(|| FlowError::TypeMismatch {
                    name: "condition".to_string(),
                    detail: "NUMERIC mode requires 'condition'".to_string(),
                })?;
                let step = parsed.step.unwrap_or(1.0);
                let mut counter = initial;
                let mut index = 0usize;

                loop {
                    ctx.variables.set(&parsed.variable, Value::Number(counter));

                    let snapshot = ctx.variables.snapshot();
                    if !evaluate_one(&condition, &snapshot, ctx.results)? {
                        break;
                    }

                    let flow = run_tasks(&body, ctx.variables, ctx.results, &ctx.run, ctx.events).await?;
                    summaries.push(iteration_summary(index, Some(counter), None, &body, ctx.results));
                    index += 1;

                    if handle_flow(flow, &mut broke, &mut bubbled_control) {
                        break;
                    }
                    counter += step;
                }
            }
            (None, None) => {
                return Err(FlowError::TypeMismatch {
                    name: "<FOR mode>".to_string(),
                    detail: "FOR requires either 'values' (VALUES mode) or 'initial'/'condition' (NUMERIC mode)"
                        .to_string(),
                })
            }
        }

        if parsed.require_break && !broke {
            return Err(FlowError::RequiredBreakMissing);
        }

        Ok(ActionOutcome::new(Value::from_json_raw(Json::Array(summaries)), ResultType::Json)
            .with_control(bubbled_control))
    }
}

/// Applies one iteration's `ControlFlow` outcome. Returns `true` if the
/// loop should stop (break/exit/unresolved jump), `false` to continue.
fn handle_flow(flow: ControlFlow, broke: &mut bool, bubbled: &mut Control) -> bool {
    match flow {
        ControlFlow::Continue => false,
        ControlFlow::Break => {
            *broke = true;
            true
        }
        ControlFlow::Exit => {
            bubbled.exit = true;
            true
        }
        ControlFlow::Jump(target) => {
            bubbled.jump_to_task_id = Some(target);
            true
        }
    }
}

/// Strips `tasks` (always carved out) and `condition` (carved out for
/// NUMERIC mode) before deserializing the rest of the payload — both were
/// already parsed separately against the correct per-iteration scope.
fn strip_carved_out(payload: &Json) -> Json {
    let mut map = payload.as_object().cloned().unwrap_or_default();
    map.remove("tasks");
    Json::Object(map)
}

/// Captures this iteration's body-task results from the shared result store
/// before the next iteration overwrites them (body task ids repeat across
/// iterations, same as a backward jump).
fn iteration_summary(
    index: usize,
    counter: Option<f64>,
    value: Option<Json>,
    body: &[Task],
    results: &ResultStore,
) -> Json {
    let mut summary = Map::new();
    summary.insert("index".to_string(), Json::Number(index.into()));
    if let Some(c) = counter {
        if let Some(n) = serde_json::Number::from_f64(c) {
            summary.insert("counter".to_string(), Json::Number(n));
        }
    }
    if let Some(v) = value {
        summary.insert("value".to_string(), v);
    }

    let tasks: Vec<Json> = body
        .iter()
        .filter_map(|task| results.get(&task.id).map(|result| task_entry(task, &result)))
        .collect();
    summary.insert("tasks".to_string(), Json::Array(tasks));
    Json::Object(summary)
}

fn task_entry(task: &Task, result: &TaskResult) -> Json {
    let mut entry = Map::new();
    entry.insert("task_id".to_string(), Json::String(task.id.clone()));
    entry.insert("result".to_string(), result.value.to_json_masked());
    entry.insert("result_type".to_string(), Json::String(result.result_type.wire_str().to_string()));
    if !result.control.is_empty() {
        entry.insert("control".to_string(), control_json(&result.control));
    }
    if let Some(err) = result.error() {
        entry.insert("error".to_string(), Json::String(err.to_string()));
    }
    Json::Object(entry)
}

fn control_json(control: &Control) -> Json {
    let mut map = Map::new();
    if let Some(target) = &control.jump_to_task_id {
        map.insert("jump_to_task_id".to_string(), Json::String(target.clone()));
    }
    if control.exit {
        map.insert("exit".to_string(), Json::Bool(true));
    }
    if control.break_loop {
        map.insert("break".to_string(), Json::Bool(true));
    }
    Json::Object(map)
}
