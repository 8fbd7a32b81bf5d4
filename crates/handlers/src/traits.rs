//! Handler traits and the execution context they receive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::HandlerError;

/// Variable bag threaded through a single execution's steps.
///
/// Defined here (in the handlers crate) so both the engine and individual
/// handler implementations can import it without a circular dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    /// ID of the workflow being executed.
    pub workflow_id: Uuid,
    /// ID of the current execution run.
    pub execution_id: Uuid,
    /// Seeded from the trigger payload; each successful step's output is
    /// shallow-merged in so later steps observe earlier outputs.
    pub variables: Map<String, Value>,
    /// Engine and host bookkeeping that is not part of the data flow.
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionContext {
    /// Build a context seeded from a trigger payload.
    ///
    /// An object payload becomes the variable bag as-is; any other value is
    /// kept under the `triggerData` key.
    pub fn seeded(
        workflow_id: Uuid,
        execution_id: Uuid,
        trigger_data: &Value,
        user_id: Option<String>,
    ) -> Self {
        let variables = match trigger_data {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("triggerData".into(), other.clone());
                map
            }
        };

        Self {
            workflow_id,
            execution_id,
            variables,
            metadata: Map::new(),
            user_id,
            timestamp: Utc::now(),
        }
    }

    /// Shallow-merge a step output into the variables.
    ///
    /// Only object outputs are merged; scalars and arrays are left out of
    /// the context.
    pub fn merge_output(&mut self, output: &Value) {
        if let Value::Object(map) = output {
            for (key, value) in map {
                self.variables.insert(key.clone(), value.clone());
            }
        }
    }

    /// The variables as a JSON object, for condition evaluation.
    pub fn variables_value(&self) -> Value {
        Value::Object(self.variables.clone())
    }
}

/// Executes one kind of workflow step.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Run the step with its `config` against the current context and
    /// return the step output. Object outputs are merged into the context.
    async fn execute(&self, config: &Value, ctx: &ExecutionContext) -> Result<Value, HandlerError>;
}

/// Executes one kind of automation action.
///
/// Actions receive the raw event payload, not an execution context.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, config: &Value, event: &Value) -> Result<(), HandlerError>;
}
