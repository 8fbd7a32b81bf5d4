//! Built-in handlers with no external side effects.
//!
//! Hosts register their own handlers for anything that talks to the outside
//! world; these cover the step kinds that only reshape data or wait.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::{ActionHandler, ExecutionContext, HandlerError, StepHandler};

/// `transform` step: returns the `set` object from its config, which the
/// engine then merges into the context.
///
/// ```json
/// { "set": { "approved": true, "tier": "gold" } }
/// ```
pub struct TransformHandler;

#[async_trait]
impl StepHandler for TransformHandler {
    async fn execute(&self, config: &Value, _ctx: &ExecutionContext) -> Result<Value, HandlerError> {
        match config.get("set") {
            Some(Value::Object(map)) => Ok(Value::Object(map.clone())),
            Some(_) => Err(HandlerError::invalid_config("`set` must be an object")),
            None => Ok(json!({})),
        }
    }
}

/// `delay` step: waits `ms` milliseconds and returns `{ "delayedMs": ms }`.
pub struct DelayHandler;

#[async_trait]
impl StepHandler for DelayHandler {
    async fn execute(&self, config: &Value, _ctx: &ExecutionContext) -> Result<Value, HandlerError> {
        let ms = config
            .get("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| HandlerError::invalid_config("`ms` must be a non-negative integer"))?;

        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "delayedMs": ms }))
    }
}

/// `notification` step that only logs `message`.
pub struct LogHandler;

#[async_trait]
impl StepHandler for LogHandler {
    async fn execute(&self, config: &Value, ctx: &ExecutionContext) -> Result<Value, HandlerError> {
        let message = config.get("message").and_then(Value::as_str).unwrap_or("");
        info!(
            execution_id = %ctx.execution_id,
            workflow_id = %ctx.workflow_id,
            "notification: {message}"
        );
        Ok(json!({ "notified": true }))
    }
}

/// Automation action that logs the event it was dispatched for.
pub struct LogAction;

#[async_trait]
impl ActionHandler for LogAction {
    async fn execute(&self, config: &Value, event: &Value) -> Result<(), HandlerError> {
        info!(config = %config, event = %event, "automation action dispatched");
        Ok(())
    }
}
