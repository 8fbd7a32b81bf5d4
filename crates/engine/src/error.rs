//! Engine-level error types.

use thiserror::Error;

use crate::models::StepType;

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// The workflow has no steps to start from.
    #[error("workflow has no steps")]
    EmptyWorkflow,

    /// Two or more steps share the same ID.
    #[error("duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    /// An `onSuccess` / `onFailure` edge points at a step that doesn't exist.
    #[error("step '{step_id}' has {edge} edge to unknown step '{target}'")]
    UnknownStepReference {
        step_id: String,
        edge: &'static str,
        target: String,
    },

    // ------ Execution errors ------

    /// No handler is registered for the step's type.
    #[error("no handler registered for step type '{0}'")]
    MissingHandler(StepType),

    /// The step handler returned an error.
    #[error("step '{step_id}' failed: {message}")]
    StepFailed { step_id: String, message: String },

    /// The step handler did not finish within the step timeout.
    #[error("step '{step_id}' timed out after {timeout_ms}ms")]
    StepTimeout { step_id: String, timeout_ms: u64 },

    /// The walk visited more steps than the executor allows.
    #[error("execution exceeded {0} step transitions")]
    TransitionLimit(usize),

    /// The whole execution ran past its deadline.
    #[error("execution timed out after {0}ms")]
    ExecutionTimeout(u64),

    // ------ Lifecycle errors ------

    /// Import / export of a definition failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
