//! PRINT (§4.10): emits masked messages/values, resolved from a variable, a
//! task result field, or a literal.
//!
//! `taskId`+`field` entries are resolved by synthesizing a
//! `${from.task:TID.<field>}` placeholder and reusing the same expansion
//! machinery as ordinary payload expansion (§4.2) — there is no bespoke
//! task-result lookup path here.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value as Json};

use crate::context::ExecutionContext;
use crate::error::{FlowError, Result};
use crate::expansion::expand_string;
use crate::registry::{Action, ActionOutcome};
use crate::value::{ResultType, Value};

#[derive(Debug, Deserialize)]
struct PrintPayload {
    entries: Vec<PrintEntry>,
}

#[derive(Debug, Deserialize)]
struct PrintEntry {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    variable: Option<String>,
    #[serde(rename = "taskId", default)]
    task_id: Option<String>,
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    value: Option<Json>,
}

pub struct PrintAction;

#[async_trait]
impl Action for PrintAction {
    fn name(&self) -> &'static str {
        "PRINT"
    }

    async fn execute(&self, ctx: &ExecutionContext<'_>, payload: &Json) -> Result<ActionOutcome> {
        let parsed: PrintPayload =
            serde_json::from_value(payload.clone()).map_err(|e| FlowError::TypeMismatch {
                name: "<PRINT payload>".to_string(),
                detail: e.to_string(),
            })?;

        let snapshot = ctx.variables.snapshot();
        let mut rendered = Vec::with_capacity(parsed.entries.len());

        for entry in &parsed.entries {
            let resolved_value = resolve_entry_value(entry, ctx, &snapshot)?;
            let masked_value = resolved_value.as_ref().map(Value::to_json_masked);

            let line = match (&entry.message, &masked_value) {
                (Some(m), Some(v)) => format!("{m}: {}", display_json(v)),
                (Some(m), None) => m.clone(),
                (None, Some(v)) => display_json(v),
                (None, None) => String::new(),
            };
            ctx.log(line.clone());

            let mut record = Map::new();
            if entry.message.is_some() {
                record.insert("message".to_string(), Json::String(line));
            }
            if let Some(v) = &masked_value {
                record.insert("value".to_string(), v.clone());
            }

            rendered.push(Json::Object(record));
        }

        Ok(ActionOutcome::new(Value::Array(rendered.into_iter().map(Value::from_json_raw).collect()), ResultType::Json))
    }
}

fn resolve_entry_value(
    entry: &PrintEntry,
    ctx: &ExecutionContext<'_>,
    snapshot: &std::collections::BTreeMap<String, Value>,
) -> Result<Option<Value>> {
    if let Some(name) = &entry.variable {
        let value = snapshot.get(name).cloned().ok_or_else(|| FlowError::Undefined { name: name.clone() })?;
        return Ok(Some(value));
    }
    if let Some(task_id) = &entry.task_id {
        let field = entry.field.as_deref().unwrap_or("result$");
        let placeholder = format!("${{from.task:{task_id}.{field}}}");
        let mut stack = Vec::new();
        let value = expand_string(&placeholder, snapshot, ctx.results, &mut stack)?;
        return Ok(Some(value));
    }
    if let Some(literal) = &entry.value {
        return Ok(Some(Value::from_json_raw(literal.clone())));
    }
    Ok(None)
}

fn display_json(json: &Json) -> String {
    match json {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;
    use crate::event::EventBus;
    use crate::store::{ResultStore, TaskResult, VariableStore};
    use serde_json::json;
    use std::time::Duration;

    fn ctx<'a>(results: &'a ResultStore, variables: &'a VariableStore, events: &'a EventBus) -> ExecutionContext<'a> {
        ExecutionContext::new("p1", "PRINT", results, variables, RunContext::new(), events)
    }

    #[tokio::test]
    async fn prints_literal_and_variable() {
        let variables = VariableStore::new();
        variables.set("name", Value::String("world".into()));
        let results = ResultStore::new();
        let events = EventBus::new("f", 4);
        let c = ctx(&results, &variables, &events);
        let payload = json!({"entries": [
            {"message": "hello", "variable": "name"},
            {"value": 42}
        ]});
        let outcome = PrintAction.execute(&c, &payload).await.unwrap();
        match outcome.value {
            Value::Array(items) => assert_eq!(items.len(), 2),
            _ => panic!("expected array"),
        }
    }

    #[tokio::test]
    async fn message_field_holds_rendered_prefix_and_value() {
        let variables = VariableStore::new();
        variables.set("greeting", Value::String("hi".into()));
        let results = ResultStore::new();
        let events = EventBus::new("f", 4);
        let c = ctx(&results, &variables, &events);
        let payload = json!({"entries": [{"message": "say", "variable": "greeting"}]});
        let outcome = PrintAction.execute(&c, &payload).await.unwrap();
        let json_out = outcome.value.to_json_unmasked();
        assert_eq!(json_out[0]["message"], json!("say: hi"));
        assert_eq!(json_out[0]["value"], json!("hi"));
    }

    #[tokio::test]
    async fn secret_variable_masked_in_output() {
        let variables = VariableStore::new();
        variables.set("token", Value::Secret("s3cr3t".into()));
        let results = ResultStore::new();
        let events = EventBus::new("f", 4);
        let c = ctx(&results, &variables, &events);
        let payload = json!({"entries": [{"message": "token", "variable": "token"}]});
        let outcome = PrintAction.execute(&c, &payload).await.unwrap();
        let json_out = outcome.value.to_json_unmasked();
        assert_eq!(json_out[0]["value"], json!("****"));
    }

    #[tokio::test]
    async fn task_field_resolves_via_synthesized_placeholder() {
        let variables = VariableStore::new();
        let results = ResultStore::new();
        results.insert("t1", TaskResult::success(Value::Bool(true), ResultType::Bool, Duration::ZERO));
        let events = EventBus::new("f", 4);
        let c = ctx(&results, &variables, &events);
        let payload = json!({"entries": [{"taskId": "t1", "field": "status"}]});
        let outcome = PrintAction.execute(&c, &payload).await.unwrap();
        let json_out = outcome.value.to_json_unmasked();
        assert_eq!(json_out[0]["value"], json!("success"));
    }
}
