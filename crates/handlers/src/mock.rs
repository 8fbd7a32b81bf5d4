//! `MockStep` and `MockAction` — test doubles for the handler traits.
//!
//! Useful in unit and integration tests where a real handler is either
//! unavailable or irrelevant.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{ActionHandler, ExecutionContext, HandlerError, StepHandler};

/// Call log shared between several mocks, so tests can assert on the
/// interleaving of calls across handlers.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

/// Snapshot of a journal's entries.
pub fn entries(journal: &Journal) -> Vec<String> {
    lock(journal).clone()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Behaviour injected into `MockStep` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Always fail with the given message.
    Fail(String),
    /// Fail the first `n` calls, then return the value.
    FailTimes(usize, Value),
    /// Sleep before returning the value.
    Sleep(Duration, Value),
}

/// A mock step handler that records every context it receives and returns a
/// programmer-specified result.
pub struct MockStep {
    /// Label used in test assertions and journal entries.
    pub name: String,
    pub behaviour: MockBehaviour,
    /// Variables seen by this handler (in call order).
    pub calls: Arc<Mutex<Vec<Value>>>,
    journal: Option<Journal>,
}

impl MockStep {
    fn with(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            journal: None,
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails.
    pub fn failing(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::Fail(msg.into()))
    }

    /// Create a mock that fails `times` times before succeeding.
    pub fn flaky(name: impl Into<String>, times: usize, value: Value) -> Self {
        Self::with(name, MockBehaviour::FailTimes(times, value))
    }

    /// Create a mock that takes `delay` to answer.
    pub fn sleeping(name: impl Into<String>, delay: Duration, value: Value) -> Self {
        Self::with(name, MockBehaviour::Sleep(delay, value))
    }

    /// Also append `name` to `journal` on every call.
    pub fn journaled(mut self, journal: &Journal) -> Self {
        self.journal = Some(Arc::clone(journal));
        self
    }

    /// Number of times this handler has been executed.
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Variables seen on each call.
    pub fn seen(&self) -> Vec<Value> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl StepHandler for MockStep {
    async fn execute(&self, _config: &Value, ctx: &ExecutionContext) -> Result<Value, HandlerError> {
        let call = {
            let mut calls = lock(&self.calls);
            calls.push(ctx.variables_value());
            calls.len()
        };
        if let Some(journal) = &self.journal {
            lock(journal).push(self.name.clone());
        }

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(v.clone()),
            MockBehaviour::Fail(msg) => Err(HandlerError::failed(msg.clone())),
            MockBehaviour::FailTimes(n, v) => {
                if call <= *n {
                    Err(HandlerError::failed(format!("{} failed on call {call}", self.name)))
                } else {
                    Ok(v.clone())
                }
            }
            MockBehaviour::Sleep(delay, v) => {
                tokio::time::sleep(*delay).await;
                Ok(v.clone())
            }
        }
    }
}

/// A mock automation action that records `(config, event)` pairs.
pub struct MockAction {
    pub name: String,
    pub fail: bool,
    pub calls: Arc<Mutex<Vec<Value>>>,
    journal: Option<Journal>,
}

impl MockAction {
    pub fn recording(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail: false,
            calls: Arc::new(Mutex::new(Vec::new())),
            journal: None,
        }
    }

    pub fn failing(name: impl Into<String>) -> Self {
        Self { fail: true, ..Self::recording(name) }
    }

    /// Append `<name>:<config.tag>` to `journal` on every call.
    pub fn journaled(mut self, journal: &Journal) -> Self {
        self.journal = Some(Arc::clone(journal));
        self
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn seen(&self) -> Vec<Value> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ActionHandler for MockAction {
    async fn execute(&self, config: &Value, event: &Value) -> Result<(), HandlerError> {
        lock(&self.calls).push(json!({ "config": config, "event": event }));

        if let Some(journal) = &self.journal {
            let tag = config.get("tag").and_then(Value::as_str).unwrap_or("-");
            lock(journal).push(format!("{}:{tag}", self.name));
        }

        if self.fail {
            return Err(HandlerError::failed(format!("{} always fails", self.name)));
        }
        Ok(())
    }
}
