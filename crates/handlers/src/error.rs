//! Handler-level error type.

use thiserror::Error;

/// Errors returned by a handler's `execute` method.
///
/// The engine treats every variant the same way: the step is retried if
/// its retry policy allows, otherwise the failure is final.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler ran and reported a failure.
    #[error("handler failed: {0}")]
    Failed(String),

    /// The step or action config could not be interpreted.
    #[error("invalid handler config: {0}")]
    InvalidConfig(String),

    /// Anything bubbled up from host code.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
