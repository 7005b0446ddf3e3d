//! EVALUATE (§4.7): a list of conditions ANDed together, gating a branch.
//!
//! The `if_conditions` field is carved out by the engine (§4.2) so each
//! condition's `left`/`right` can be expanded against the *current*
//! variable snapshot individually, rather than the whole array being
//! expanded (and potentially failing) before any condition is evaluated.

use std::collections::BTreeMap;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as Json;

use crate::context::ExecutionContext;
use crate::error::{FlowError, Result};
use crate::expansion::expand_json;
use crate::registry::{Action, ActionOutcome};
use crate::store::ResultStore;
use crate::value::{Control, ResultType, Value};

#[derive(Debug, Deserialize)]
struct EvaluatePayload {
    if_conditions: Vec<RawCondition>,
    #[serde(rename = "then")]
    then_branch: Branch,
    #[serde(rename = "else")]
    else_branch: Branch,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawCondition {
    left: Json,
    operation: String,
    right: Json,
}

/// `continue`/`exit`/`break` carry an optional label string that is logged
/// verbatim rather than acting as a flag — presence, not truthiness, is
/// what drives behavior (§4.7: "the optional continue/exit/break strings
/// are logged verbatim").
#[derive(Debug, Default, Deserialize)]
struct Branch {
    #[serde(default)]
    #[serde(rename = "continue")]
    continue_: Option<String>,
    #[serde(default)]
    sleep: Option<f64>,
    #[serde(default)]
    gototask: Option<String>,
    #[serde(default)]
    gototaskid: Option<String>,
    #[serde(default)]
    exit: Option<String>,
    #[serde(rename = "break")]
    #[serde(default)]
    break_: Option<String>,
}

impl Branch {
    /// `exit` excludes `sleep`, `gototask`/`gototaskid`, and a non-empty
    /// `continue`; `break` excludes `gototask`/`gototaskid`, `exit`, and a
    /// non-empty `continue`. `sleep` may otherwise coexist with `break` or
    /// a jump — it pauses before the directive is emitted.
    fn validate(&self) -> Result<()> {
        let continues = self.continue_.as_deref().is_some_and(|s| !s.is_empty());
        let has_jump = self.gototask.is_some() || self.gototaskid.is_some();

        if self.exit.is_some() && (self.sleep.is_some() || has_jump || continues) {
            return Err(FlowError::InvalidBranch {
                detail: "'exit' cannot combine with 'sleep', 'gototask'/'gototaskid', or a non-empty 'continue'".to_string(),
            });
        }
        if self.break_.is_some() && (has_jump || self.exit.is_some() || continues) {
            return Err(FlowError::InvalidBranch {
                detail: "'break' cannot combine with 'gototask'/'gototaskid', 'exit', or a non-empty 'continue'".to_string(),
            });
        }
        Ok(())
    }

    fn jump_target(&self) -> Option<&str> {
        self.gototask.as_deref().or(self.gototaskid.as_deref())
    }

    fn logged_label(&self) -> Option<&str> {
        self.exit
            .as_deref()
            .or(self.break_.as_deref())
            .or(self.continue_.as_deref())
    }
}

pub struct EvaluateAction;

#[async_trait]
impl Action for EvaluateAction {
    fn name(&self) -> &'static str {
        "EVALUATE"
    }

    async fn execute(&self, ctx: &ExecutionContext<'_>, payload: &Json) -> Result<ActionOutcome> {
        let parsed: EvaluatePayload =
            serde_json::from_value(payload.clone()).map_err(|e| FlowError::TypeMismatch {
                name: "<EVALUATE payload>".to_string(),
                detail: e.to_string(),
            })?;

        parsed.then_branch.validate()?;
        parsed.else_branch.validate()?;

        let snapshot = ctx.variables.snapshot();
        let matched = evaluate_all(&parsed.if_conditions, &snapshot, ctx.results)?;
        let branch = if matched { &parsed.then_branch } else { &parsed.else_branch };

        if let Some(label) = branch.logged_label() {
            ctx.log(label.to_string());
        }

        if let Some(seconds) = branch.sleep {
            sleep_cancellable(ctx, seconds).await?;
        }

        let mut control = Control::default();
        if branch.exit.is_some() {
            control.exit = true;
        }
        if branch.break_.is_some() {
            control.break_loop = true;
        }
        if let Some(target) = branch.jump_target() {
            control.jump_to_task_id = Some(target.to_string());
        }

        Ok(ActionOutcome::new(Value::Bool(matched), ResultType::Bool).with_control(control))
    }
}

async fn sleep_cancellable(ctx: &ExecutionContext<'_>, seconds: f64) -> Result<()> {
    if seconds <= 0.0 {
        return Ok(());
    }
    ctx.run.enforce_sleep_ceiling(seconds)?;
    tokio::select! {
        _ = tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)) => Ok(()),
        _ = ctx.run.token.cancelled() => Err(FlowError::Cancelled),
    }
}

fn evaluate_all(
    conditions: &[RawCondition],
    variables: &BTreeMap<String, Value>,
    results: &ResultStore,
) -> Result<bool> {
    for condition in conditions {
        if !evaluate_one(condition, variables, results)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Evaluates a single condition. Exposed for `FOR`'s NUMERIC-mode condition,
/// which reuses the same operator table against a single `{left,operation,
/// right}` shape rather than an array.
pub(crate) fn evaluate_one(
    condition: &RawCondition,
    variables: &BTreeMap<String, Value>,
    results: &ResultStore,
) -> Result<bool> {
    let left = expand_json(&condition.left, variables, results)?;
    let right = expand_json(&condition.right, variables, results)?;
    apply_operator(&condition.operation, &left, &right)
}

fn as_f64(json: &Json) -> Option<f64> {
    match json {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn numeric_compare(left: &Json, right: &Json) -> Option<(f64, f64)> {
    // Permissive string coercion only when the other operand is a genuine
    // JSON number — we no longer have the declared variable type by the
    // time conditions reach here.
    match (left, right) {
        (Json::Number(_), _) | (_, Json::Number(_)) => Some((as_f64(left)?, as_f64(right)?)),
        _ => None,
    }
}

fn apply_operator(operation: &str, left: &Json, right: &Json) -> Result<bool> {
    match operation {
        "=" | "==" => Ok(strict_equal(left, right)),
        "!=" => Ok(!strict_equal(left, right)),
        ">" | ">=" | "<" | "<=" => {
            let (l, r) = numeric_compare(left, right).ok_or_else(|| FlowError::TypeMismatch {
                name: "<EVALUATE operand>".to_string(),
                detail: format!("operator '{operation}' requires numeric operands, got {left} / {right}"),
            })?;
            Ok(match operation {
                ">" => l > r,
                ">=" => l >= r,
                "<" => l < r,
                "<=" => l <= r,
                _ => unreachable!(),
            })
        }
        "STARTS_WITH" => Ok(as_str(left).starts_with(as_str(right).as_str())),
        "ENDS_WITH" => Ok(as_str(left).ends_with(as_str(right).as_str())),
        "MATCHES" => {
            let pattern = as_str(right);
            let re = Regex::new(&pattern).map_err(|e| FlowError::TypeMismatch {
                name: "<EVALUATE MATCHES pattern>".to_string(),
                detail: e.to_string(),
            })?;
            Ok(re.is_match(&as_str(left)))
        }
        "CONTAINS" => Ok(contains(left, right)),
        "NOT_CONTAINS" => Ok(!contains(left, right)),
        "IN" => Ok(contains(right, left)),
        "NOT_IN" => Ok(!contains(right, left)),
        other => Err(FlowError::TypeMismatch {
            name: "<EVALUATE operation>".to_string(),
            detail: format!("unknown operator '{other}'"),
        }),
    }
}

fn as_str(json: &Json) -> String {
    match json {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Strict equality for `=`/`!=`: numeric comparison only when both operands
/// are genuine JSON numbers, so a numeric string never equals a number.
fn strict_equal(left: &Json, right: &Json) -> bool {
    match (left, right) {
        (Json::Number(l), Json::Number(r)) => l.as_f64() == r.as_f64(),
        _ => left == right,
    }
}

/// Permissive equality used for membership checks (`CONTAINS`/`IN`), which
/// still coerce a numeric string against a JSON number.
fn values_equal(left: &Json, right: &Json) -> bool {
    if let Some((l, r)) = numeric_compare(left, right) {
        return l == r;
    }
    left == right
}

/// True if `haystack` (an array) contains `needle`, or `haystack` is a
/// string containing `needle`'s string form.
fn contains(haystack: &Json, needle: &Json) -> bool {
    match haystack {
        Json::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Json::String(s) => s.contains(&as_str(needle)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;
    use crate::event::EventBus;
    use crate::store::VariableStore;
    use serde_json::json;

    fn ctx<'a>(results: &'a ResultStore, variables: &'a VariableStore, events: &'a EventBus) -> ExecutionContext<'a> {
        ExecutionContext::new("e1", "EVALUATE", results, variables, RunContext::new(), events)
    }

    #[tokio::test]
    async fn matches_then_branch_and_emits_jump() {
        let variables = VariableStore::new();
        variables.set("count", Value::Number(5.0));
        let results = ResultStore::new();
        let events = EventBus::new("f", 4);
        let c = ctx(&results, &variables, &events);
        let payload = json!({
            "if_conditions": [{"left": "${count}", "operation": ">", "right": 1}],
            "then": {"gototask": "end"},
            "else": {"continue": "loop"}
        });
        let outcome = EvaluateAction.execute(&c, &payload).await.unwrap();
        assert_eq!(outcome.value, Value::Bool(true));
        assert_eq!(outcome.control.jump_to_task_id.as_deref(), Some("end"));
    }

    #[tokio::test]
    async fn mismatched_takes_else_branch() {
        let variables = VariableStore::new();
        variables.set("count", Value::Number(0.0));
        let results = ResultStore::new();
        let events = EventBus::new("f", 4);
        let c = ctx(&results, &variables, &events);
        let payload = json!({
            "if_conditions": [{"left": "${count}", "operation": ">", "right": 1}],
            "then": {"gototask": "end"},
            "else": {"break": "stop"}
        });
        let outcome = EvaluateAction.execute(&c, &payload).await.unwrap();
        assert_eq!(outcome.value, Value::Bool(false));
        assert!(outcome.control.break_loop);
    }

    #[tokio::test]
    async fn mutually_exclusive_branch_fields_reject() {
        let variables = VariableStore::new();
        let results = ResultStore::new();
        let events = EventBus::new("f", 4);
        let c = ctx(&results, &variables, &events);
        let payload = json!({
            "if_conditions": [{"left": 1, "operation": "=", "right": 1}],
            "then": {"exit": "done", "break": "stop"},
            "else": {"continue": "loop"}
        });
        let err = EvaluateAction.execute(&c, &payload).await.unwrap_err();
        assert!(matches!(err, FlowError::InvalidBranch { .. }));
    }

    #[test]
    fn string_ops_and_collection_ops() {
        assert!(apply_operator("STARTS_WITH", &json!("hello world"), &json!("hello")).unwrap());
        assert!(apply_operator("CONTAINS", &json!([1, 2, 3]), &json!(2)).unwrap());
        assert!(apply_operator("IN", &json!(2), &json!([1, 2, 3])).unwrap());
        assert!(!apply_operator("ENDS_WITH", &json!("hello"), &json!("x")).unwrap());
    }

    #[test]
    fn equality_is_strict_across_number_and_numeric_string() {
        assert!(!apply_operator("=", &json!(1), &json!("1")).unwrap());
        assert!(apply_operator("!=", &json!(1), &json!("1")).unwrap());
        assert!(apply_operator("=", &json!(1), &json!(1)).unwrap());
        assert!(apply_operator("=", &json!("1"), &json!("1")).unwrap());
    }

    #[tokio::test]
    async fn branch_sleep_respects_configured_ceiling() {
        let variables = VariableStore::new();
        let results = ResultStore::new();
        let events = EventBus::new("f", 4);
        let mut config = crate::config::EngineConfig::default();
        config.max_sleep_seconds = Some(1.0);
        let run = RunContext::new().with_config(config);
        let c = ExecutionContext::new("e1", "EVALUATE", &results, &variables, run, &events);
        let payload = json!({
            "if_conditions": [{"left": 1, "operation": "=", "right": 1}],
            "then": {"sleep": 30, "continue": "go"},
            "else": {"continue": "loop"}
        });
        let err = EvaluateAction.execute(&c, &payload).await.unwrap_err();
        assert!(matches!(err, FlowError::SleepCeilingExceeded { .. }));
    }
}
