//! VARIABLES (§4.6).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value as Json};

use crate::context::ExecutionContext;
use crate::error::{FlowError, Result};
use crate::registry::{Action, ActionOutcome};
use crate::value::{is_valid_variable_name, ResultType, Value};

#[derive(Debug, Deserialize)]
struct VariablesPayload {
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    overwrite: bool,
    variables: Vec<VariableSpec>,
}

#[derive(Debug, Deserialize)]
struct VariableSpec {
    name: String,
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    value: Option<Json>,
    #[serde(default)]
    operation: Option<OperationSpec>,
}

#[derive(Debug, Deserialize)]
struct OperationSpec {
    operator: String,
    variable: String,
}

pub struct VariablesAction;

#[async_trait]
impl Action for VariablesAction {
    fn name(&self) -> &'static str {
        "VARIABLES"
    }

    async fn execute(&self, ctx: &ExecutionContext<'_>, payload: &Json) -> Result<ActionOutcome> {
        let parsed: VariablesPayload =
            serde_json::from_value(payload.clone()).map_err(|e| FlowError::TypeMismatch {
                name: "<VARIABLES payload>".to_string(),
                detail: e.to_string(),
            })?;

        if let Some(scope) = &parsed.scope {
            if !scope.is_empty() && scope != "flow" {
                return Err(FlowError::TypeMismatch {
                    name: "scope".to_string(),
                    detail: format!("scope must be empty or 'flow', got '{scope}'"),
                });
            }
        }

        let mut declared_this_payload = std::collections::HashSet::new();
        let mut masked = Map::with_capacity(parsed.variables.len());

        for spec in &parsed.variables {
            if !is_valid_variable_name(&spec.name) {
                return Err(FlowError::TypeMismatch {
                    name: spec.name.clone(),
                    detail: "invalid variable name".to_string(),
                });
            }
            if !declared_this_payload.insert(spec.name.clone()) {
                return Err(FlowError::Redeclare {
                    name: spec.name.clone(),
                });
            }
            if !parsed.overwrite && ctx.variables.contains(&spec.name) {
                return Err(FlowError::Redeclare {
                    name: spec.name.clone(),
                });
            }

            let value = if let Some(op) = &spec.operation {
                if spec.type_ != "number" {
                    return Err(FlowError::NotNumber {
                        name: spec.name.clone(),
                    });
                }
                apply_operation(ctx, &spec.name, op)?
            } else {
                let raw = spec.value.clone().ok_or_else(|| FlowError::TypeMismatch {
                    name: spec.name.clone(),
                    detail: "variable declaration requires 'value' or 'operation'".to_string(),
                })?;
                Value::coerce(raw, &spec.type_)?
            };

            ctx.variables.set(spec.name.clone(), value.clone());
            masked.insert(spec.name.clone(), value.to_json_masked());
        }

        Ok(ActionOutcome::new(
            Value::from_json_raw(Json::Object(masked)),
            ResultType::Json,
        ))
    }
}

fn apply_operation(
    ctx: &ExecutionContext<'_>,
    target_name: &str,
    op: &OperationSpec,
) -> Result<Value> {
    let current = ctx
        .variables
        .get(target_name)
        .ok_or_else(|| FlowError::NotNumber {
            name: target_name.to_string(),
        })?;
    let current_num = current.as_number().ok_or_else(|| FlowError::NotNumber {
        name: target_name.to_string(),
    })?;
    let source = ctx
        .variables
        .get(&op.variable)
        .ok_or_else(|| FlowError::Undefined {
            name: op.variable.clone(),
        })?;
    let source_num = source.as_number().ok_or_else(|| FlowError::NotNumber {
        name: op.variable.clone(),
    })?;

    let result = match op.operator.as_str() {
        "add" => current_num + source_num,
        "subtract" => current_num - source_num,
        "multiply" => current_num * source_num,
        "divide" => current_num / source_num,
        other => {
            return Err(FlowError::TypeMismatch {
                name: "operation.operator".to_string(),
                detail: format!("unknown operator '{other}'"),
            })
        }
    };
    Ok(Value::Number(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;
    use crate::event::EventBus;
    use crate::store::{ResultStore, VariableStore};
    use serde_json::json;

    fn ctx<'a>(
        results: &'a ResultStore,
        variables: &'a VariableStore,
        events: &'a EventBus,
    ) -> ExecutionContext<'a> {
        ExecutionContext::new("v1", "VARIABLES", results, variables, RunContext::new(), events)
    }

    #[tokio::test]
    async fn declares_and_coerces_string() {
        let variables = VariableStore::new();
        let results = ResultStore::new();
        let events = EventBus::new("f", 4);
        let c = ctx(&results, &variables, &events);
        let payload = json!({"overwrite": false, "variables": [{"name":"greeting","type":"string","value":"hi"}]});
        VariablesAction.execute(&c, &payload).await.unwrap();
        assert_eq!(variables.get("greeting"), Some(Value::String("hi".into())));
    }

    #[tokio::test]
    async fn redeclare_without_overwrite_fails() {
        let variables = VariableStore::new();
        variables.set("x", Value::Number(1.0));
        let results = ResultStore::new();
        let events = EventBus::new("f", 4);
        let c = ctx(&results, &variables, &events);
        let payload = json!({"overwrite": false, "variables": [{"name":"x","type":"number","value":2}]});
        let err = VariablesAction.execute(&c, &payload).await.unwrap_err();
        assert!(matches!(err, FlowError::Redeclare { .. }));
    }

    #[tokio::test]
    async fn arithmetic_operation_on_number_variable() {
        let variables = VariableStore::new();
        variables.set("base", Value::Number(10.0));
        variables.set("delta", Value::Number(3.0));
        let results = ResultStore::new();
        let events = EventBus::new("f", 4);
        let c = ctx(&results, &variables, &events);
        let payload = json!({"overwrite": true, "variables": [{"name":"base","type":"number","operation":{"operator":"add","variable":"delta"}}]});
        VariablesAction.execute(&c, &payload).await.unwrap();
        assert_eq!(variables.get("base"), Some(Value::Number(13.0)));
    }

    #[tokio::test]
    async fn secret_masked_in_result() {
        let variables = VariableStore::new();
        let results = ResultStore::new();
        let events = EventBus::new("f", 4);
        let c = ctx(&results, &variables, &events);
        let payload = json!({"overwrite": false, "variables": [{"name":"token","type":"secret","value":"s3cr3t"}]});
        let outcome = VariablesAction.execute(&c, &payload).await.unwrap();
        let json_out = outcome.value.to_json_unmasked();
        assert_eq!(json_out["token"], json!("****"));
        assert_eq!(variables.get("token"), Some(Value::Secret("s3cr3t".into())));
    }
}
