//! Glue that lets automation rules start workflows.
//!
//! The automation engine knows nothing about workflow execution; a host
//! that wants `workflow` actions registers [`WorkflowAction`] for
//! [`ActionType::Workflow`](crate::automation::ActionType::Workflow).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use handlers::{ActionHandler, HandlerError};

use crate::executor::WorkflowEngine;
use crate::lifecycle::WorkflowManager;
use crate::models::ExecutionStatus;

/// Runs the workflow named by the action config with the event payload as
/// trigger data, then records the outcome in the manager's metrics.
///
/// ```json
/// { "workflowId": "0d6b...", "userId": "optional" }
/// ```
///
/// Disabled workflows and payloads that fail the workflow's trigger
/// pre-conditions are skipped without error.
pub struct WorkflowAction {
    engine: Arc<WorkflowEngine>,
    manager: Arc<WorkflowManager>,
}

impl WorkflowAction {
    pub fn new(engine: Arc<WorkflowEngine>, manager: Arc<WorkflowManager>) -> Self {
        Self { engine, manager }
    }
}

#[async_trait]
impl ActionHandler for WorkflowAction {
    async fn execute(&self, config: &Value, event: &Value) -> Result<(), HandlerError> {
        let id = config
            .get("workflowId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| HandlerError::invalid_config("`workflowId` must be a UUID string"))?;
        let user_id = config.get("userId").and_then(Value::as_str).map(str::to_owned);

        let workflow = self
            .manager
            .get(id)
            .ok_or_else(|| HandlerError::failed(format!("workflow '{id}' not found")))?;

        if !workflow.enabled {
            info!(workflow_id = %id, "workflow disabled, skipping");
            return Ok(());
        }
        if !workflow.trigger.accepts(event) {
            info!(workflow_id = %id, "trigger conditions not met, skipping");
            return Ok(());
        }

        let execution = self.engine.execute(&workflow, event.clone(), user_id).await;
        let success = execution.status == ExecutionStatus::Completed;
        self.manager
            .record_execution(id, success, execution.duration.unwrap_or_default());

        if success {
            Ok(())
        } else {
            Err(HandlerError::failed(format!(
                "execution {} ended {}: {}",
                execution.id,
                execution.status,
                execution.error.as_deref().unwrap_or("no error recorded")
            )))
        }
    }
}
