//! SLEEP (§4.5).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as Json;

use crate::context::ExecutionContext;
use crate::error::{FlowError, Result};
use crate::registry::{Action, ActionOutcome};
use crate::value::{ResultType, Value};

pub struct SleepAction;

#[async_trait]
impl Action for SleepAction {
    fn name(&self) -> &'static str {
        "SLEEP"
    }

    async fn execute(&self, ctx: &ExecutionContext<'_>, payload: &Json) -> Result<ActionOutcome> {
        let seconds = payload
            .get("seconds")
            .and_then(Json::as_f64)
            .ok_or_else(|| FlowError::TypeMismatch {
                name: "seconds".to_string(),
                detail: "SLEEP requires a non-negative 'seconds' number".to_string(),
            })?;

        if seconds < 0.0 {
            return Err(FlowError::TypeMismatch {
                name: "seconds".to_string(),
                detail: "'seconds' must be >= 0".to_string(),
            });
        }

        if seconds == 0.0 {
            return Ok(ActionOutcome::new(Value::Number(0.0), ResultType::Float));
        }

        ctx.run.enforce_sleep_ceiling(seconds)?;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {
                Ok(ActionOutcome::new(Value::Number(seconds), ResultType::Float))
            }
            _ = ctx.run.token.cancelled() => Err(FlowError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;
    use crate::event::EventBus;
    use crate::store::{ResultStore, VariableStore};
    use serde_json::json;

    #[tokio::test]
    async fn zero_seconds_returns_immediately() {
        let variables = VariableStore::new();
        let results = ResultStore::new();
        let events = EventBus::new("f", 4);
        let run = RunContext::new();
        let ctx = ExecutionContext::new("s", "SLEEP", &results, &variables, run, &events);
        let outcome = SleepAction.execute(&ctx, &json!({"seconds": 0})).await.unwrap();
        assert_eq!(outcome.value, Value::Number(0.0));
    }

    #[tokio::test]
    async fn exceeding_configured_ceiling_fails() {
        let variables = VariableStore::new();
        let results = ResultStore::new();
        let events = EventBus::new("f", 4);
        let mut config = crate::config::EngineConfig::default();
        config.max_sleep_seconds = Some(5.0);
        let run = RunContext::new().with_config(config);
        let ctx = ExecutionContext::new("s", "SLEEP", &results, &variables, run, &events);
        let err = SleepAction
            .execute(&ctx, &json!({"seconds": 30}))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::SleepCeilingExceeded { .. }));
    }

    #[tokio::test]
    async fn cancellation_while_sleeping_returns_cancelled() {
        let variables = VariableStore::new();
        let results = ResultStore::new();
        let events = EventBus::new("f", 4);
        let run = RunContext::new();
        let run_clone = run.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            run_clone.cancel();
        });
        let ctx = ExecutionContext::new("s", "SLEEP", &results, &variables, run, &events);
        let err = SleepAction
            .execute(&ctx, &json!({"seconds": 30}))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Cancelled));
    }
}
