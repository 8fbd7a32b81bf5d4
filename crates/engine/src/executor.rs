//! Workflow execution engine.
//!
//! `WorkflowEngine` is the central orchestrator:
//! 1. Registers the execution and tells subscribers it is `running`.
//! 2. Walks the step graph from the first declared step, following
//!    `onSuccess` / `onFailure` edges (falling through to the next declared
//!    step when `onSuccess` is unset).
//! 3. Skips steps whose conditions don't hold, races handlers against the
//!    step timeout and retries failures with capped exponential backoff.
//! 4. Merges each step's object output into the execution context.
//! 5. Moves the execution to a terminal status and notifies subscribers a
//!    second (and last) time.
//!
//! The walker owns its execution record and only publishes copies into the
//! shared store. Status lives in a separate atomic cell; every terminal
//! transition is a compare-and-swap from `running`, so a cancellation is
//! never overwritten by a walk that finishes afterwards.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use handlers::{ExecutionContext, StepHandler};

use crate::condition;
use crate::models::{
    ExecutionStatus, StepExecution, StepType, Workflow, WorkflowExecution, WorkflowStep,
    DEFAULT_STEP_TIMEOUT_MS,
};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Timeout for steps that don't set their own.
    pub default_step_timeout: Duration,
    /// Upper bound on steps visited by one walk; stops runaway loops in the
    /// step graph.
    pub max_step_transitions: usize,
    /// Deadline for the whole execution. Exceeding it ends the execution
    /// with status `timeout`.
    pub execution_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: Duration::from_millis(DEFAULT_STEP_TIMEOUT_MS),
            max_step_transitions: 1_000,
            execution_timeout: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

/// Observer told about each execution twice: at start and at its terminal
/// state. Errors are logged and otherwise ignored.
pub trait ExecutionSubscriber: Send + Sync {
    fn notify(&self, execution: &WorkflowExecution) -> anyhow::Result<()>;
}

impl<F> ExecutionSubscriber for F
where
    F: Fn(&WorkflowExecution) -> anyhow::Result<()> + Send + Sync,
{
    fn notify(&self, execution: &WorkflowExecution) -> anyhow::Result<()> {
        self(execution)
    }
}

pub type SubscriptionId = Uuid;

// ---------------------------------------------------------------------------
// Status cell
// ---------------------------------------------------------------------------

/// Atomic holder for an execution's status.
#[derive(Debug)]
struct StatusCell(AtomicU8);

impl StatusCell {
    fn new(status: ExecutionStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    fn load(&self) -> ExecutionStatus {
        ExecutionStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; false if the status was no longer `from`.
    fn transition(&self, from: ExecutionStatus, to: ExecutionStatus) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Published view of one execution.
struct ExecutionEntry {
    status: Arc<StatusCell>,
    record: WorkflowExecution,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Runs workflows against registered step handlers.
///
/// Construct one engine per process (or per tenant) and share it behind an
/// `Arc`. Executions are independent: the same workflow may run many times
/// concurrently, each with its own context.
pub struct WorkflowEngine {
    config: ExecutorConfig,
    handlers: DashMap<StepType, Arc<dyn StepHandler>>,
    subscribers: DashMap<SubscriptionId, Arc<dyn ExecutionSubscriber>>,
    executions: DashMap<Uuid, ExecutionEntry>,
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl WorkflowEngine {
    /// Create a new engine with no handlers registered.
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            handlers: DashMap::new(),
            subscribers: DashMap::new(),
            executions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Bind the handler for a step type, returning the one it replaces.
    pub fn register_handler(
        &self,
        step_type: StepType,
        handler: Arc<dyn StepHandler>,
    ) -> Option<Arc<dyn StepHandler>> {
        self.handlers.insert(step_type, handler)
    }

    pub fn subscribe(&self, subscriber: impl ExecutionSubscriber + 'static) -> SubscriptionId {
        let id = Uuid::new_v4();
        self.subscribers.insert(id, Arc::new(subscriber));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Run `workflow` to completion and return its execution record.
    ///
    /// Never fails: errors end up in the record's `error` field with status
    /// `failed` (or `timeout`).
    #[instrument(skip(self, workflow, trigger_data, user_id), fields(workflow_id = %workflow.id))]
    pub async fn execute(
        &self,
        workflow: &Workflow,
        trigger_data: Value,
        user_id: Option<String>,
    ) -> WorkflowExecution {
        let (record, status) = self.begin(workflow, trigger_data, user_id);
        self.drive(workflow, record, status).await
    }

    /// Start `workflow` on the tokio runtime.
    ///
    /// The execution is registered (and subscribers told it is running)
    /// before this returns, so the id can be used with
    /// [`WorkflowEngine::cancel_execution`] straight away.
    pub fn spawn(
        self: &Arc<Self>,
        workflow: Workflow,
        trigger_data: Value,
        user_id: Option<String>,
    ) -> (Uuid, JoinHandle<WorkflowExecution>) {
        let (record, status) = self.begin(&workflow, trigger_data, user_id);
        let id = record.id;
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move { engine.drive(&workflow, record, status).await });
        (id, handle)
    }

    /// Cancel a running execution.
    ///
    /// The walker notices between steps (and between retries) and stops.
    /// Returns false if the execution is unknown or no longer running.
    pub fn cancel_execution(&self, id: Uuid) -> bool {
        let snapshot = {
            let Some(mut guard) = self.executions.get_mut(&id) else {
                return false;
            };
            let entry = &mut *guard;
            if !entry
                .status
                .transition(ExecutionStatus::Running, ExecutionStatus::Cancelled)
            {
                return false;
            }

            let now = Utc::now();
            entry.record.status = ExecutionStatus::Cancelled;
            entry.record.completed_at = Some(now);
            entry.record.duration = Some(millis_between(entry.record.started_at, now));
            entry.record.clone()
        };

        info!(execution_id = %id, "execution cancelled");
        self.notify(&snapshot);
        true
    }

    /// Snapshot of an execution, live or finished.
    pub fn get_execution(&self, id: Uuid) -> Option<WorkflowExecution> {
        self.executions.get(&id).map(|entry| {
            let mut record = entry.record.clone();
            record.status = entry.status.load();
            record
        })
    }

    /// All known executions of one workflow, oldest first.
    pub fn executions_for(&self, workflow_id: Uuid) -> Vec<WorkflowExecution> {
        let mut found: Vec<WorkflowExecution> = self
            .executions
            .iter()
            .filter(|entry| entry.record.workflow_id == workflow_id)
            .map(|entry| {
                let mut record = entry.record.clone();
                record.status = entry.status.load();
                record
            })
            .collect();
        found.sort_by_key(|r| r.started_at);
        found
    }

    /// Drop finished executions from the store; returns how many were removed.
    pub fn prune_finished(&self) -> usize {
        let before = self.executions.len();
        self.executions.retain(|_, entry| !entry.status.load().is_terminal());
        before - self.executions.len()
    }

    // -----------------------------------------------------------------------
    // Internal: lifecycle of one execution.
    // -----------------------------------------------------------------------

    fn begin(
        &self,
        workflow: &Workflow,
        trigger_data: Value,
        user_id: Option<String>,
    ) -> (WorkflowExecution, Arc<StatusCell>) {
        let id = Uuid::new_v4();
        let context = ExecutionContext::seeded(workflow.id, id, &trigger_data, user_id);
        let record = WorkflowExecution {
            id,
            workflow_id: workflow.id,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration: None,
            trigger_data,
            context,
            steps: Vec::new(),
            error: None,
        };

        let status = Arc::new(StatusCell::new(ExecutionStatus::Running));
        self.executions.insert(
            id,
            ExecutionEntry {
                status: Arc::clone(&status),
                record: record.clone(),
            },
        );

        info!(
            execution_id = %id,
            workflow_id = %workflow.id,
            "execution started with {} steps",
            workflow.steps.len()
        );
        self.notify(&record);

        (record, status)
    }

    async fn drive(
        &self,
        workflow: &Workflow,
        mut record: WorkflowExecution,
        status: Arc<StatusCell>,
    ) -> WorkflowExecution {
        let outcome = match self.config.execution_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.walk(workflow, &mut record, &status)).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::ExecutionTimeout(duration_millis(limit))),
                }
            }
            None => self.walk(workflow, &mut record, &status).await,
        };

        let terminal = match &outcome {
            Ok(()) => ExecutionStatus::Completed,
            Err(EngineError::ExecutionTimeout(_)) => ExecutionStatus::Timeout,
            Err(_) => ExecutionStatus::Failed,
        };

        // A deadline drops the walk mid-step; close out the step it was in.
        if let Err(err @ EngineError::ExecutionTimeout(_)) = &outcome {
            for step in record.steps.iter_mut().filter(|s| s.status == ExecutionStatus::Running) {
                step.error = Some(err.to_string());
                finish_step(step, ExecutionStatus::Timeout);
            }
        }
        let won = status.transition(ExecutionStatus::Running, terminal);

        if won {
            let now = Utc::now();
            record.completed_at = Some(now);
            record.duration = Some(millis_between(record.started_at, now));
            record.error = outcome.err().map(|e| e.to_string());
        }
        self.finalize(&mut record, won, &status);

        if won {
            match record.status {
                ExecutionStatus::Completed => info!(
                    execution_id = %record.id,
                    "execution completed in {}ms",
                    record.duration.unwrap_or_default()
                ),
                _ => error!(
                    execution_id = %record.id,
                    status = %record.status,
                    "execution ended: {}",
                    record.error.as_deref().unwrap_or("unknown error")
                ),
            }
            self.notify(&record);
        } else {
            info!(
                execution_id = %record.id,
                status = %record.status,
                "walk finished after execution was already terminal"
            );
        }

        record
    }

    /// Publish the final record. A walk that lost the race to a
    /// cancellation keeps the cancellation's timestamps.
    fn finalize(&self, record: &mut WorkflowExecution, won: bool, status: &StatusCell) {
        record.status = status.load();
        let Some(mut guard) = self.executions.get_mut(&record.id) else {
            return;
        };
        let entry = &mut *guard;

        if won {
            entry.record = record.clone();
        } else {
            entry.record.steps = record.steps.clone();
            entry.record.context = record.context.clone();
            entry.record.status = record.status;
            record.completed_at = entry.record.completed_at;
            record.duration = entry.record.duration;
            record.error = entry.record.error.clone();
        }
    }

    fn publish_step(&self, record: &WorkflowExecution) {
        if let Some(mut entry) = self.executions.get_mut(&record.id) {
            entry.record.steps = record.steps.clone();
            entry.record.context = record.context.clone();
        }
    }

    fn notify(&self, execution: &WorkflowExecution) {
        let subscribers: Vec<Arc<dyn ExecutionSubscriber>> = self
            .subscribers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for subscriber in subscribers {
            if let Err(e) = subscriber.notify(execution) {
                warn!(execution_id = %execution.id, "execution subscriber failed: {e:#}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internal: walk the step graph.
    // -----------------------------------------------------------------------

    async fn walk(
        &self,
        workflow: &Workflow,
        record: &mut WorkflowExecution,
        status: &StatusCell,
    ) -> Result<(), EngineError> {
        let mut current = workflow.steps.first().map(|s| s.id.clone());
        let mut transitions = 0usize;

        while let Some(step_id) = current.take() {
            if status.load() != ExecutionStatus::Running {
                info!(execution_id = %record.id, "stopping walk before step '{step_id}'");
                return Ok(());
            }

            let Some((index, step)) = workflow.step(&step_id) else {
                debug!(execution_id = %record.id, "step '{step_id}' not found, walk ends");
                break;
            };

            transitions += 1;
            if transitions > self.config.max_step_transitions {
                return Err(EngineError::TransitionLimit(self.config.max_step_transitions));
            }

            record.steps.push(StepExecution::started(&step.id, record.context.variables_value()));
            self.publish_step(record);
            let slot = record.steps.len() - 1;
            let outcome = self
                .run_step(step, &mut record.steps[slot], &mut record.context, status)
                .await;
            self.publish_step(record);

            current = match outcome {
                Ok(()) => step
                    .on_success
                    .clone()
                    .or_else(|| workflow.steps.get(index + 1).map(|s| s.id.clone())),
                Err(err) => match &step.on_failure {
                    Some(next) => {
                        warn!(
                            execution_id = %record.id,
                            "step '{}' failed, continuing at '{next}': {err}",
                            step.id
                        );
                        record.context.metadata.insert(
                            "lastError".into(),
                            json!({ "stepId": step.id, "message": err.to_string() }),
                        );
                        Some(next.clone())
                    }
                    None => return Err(err),
                },
            };
        }

        Ok(())
    }

    /// Run one step, retries included, filling in its already-recorded
    /// `execution` slot.
    async fn run_step(
        &self,
        step: &WorkflowStep,
        execution: &mut StepExecution,
        ctx: &mut ExecutionContext,
        status: &StatusCell,
    ) -> Result<(), EngineError> {
        if !condition::evaluate(&step.conditions, &execution.input) {
            debug!(execution_id = %ctx.execution_id, "step '{}' skipped: conditions not met", step.id);
            execution.output = Some(json!({ "skipped": true }));
            finish_step(execution, ExecutionStatus::Completed);
            return Ok(());
        }

        let result = loop {
            match self.attempt(step, ctx).await {
                Ok(output) => break Ok(output),
                Err(err) => {
                    let retry = step
                        .retry
                        .as_ref()
                        .filter(|r| execution.retry_count.saturating_add(1) < r.max_attempts);
                    let Some(retry) = retry else { break Err(err) };

                    if status.load() != ExecutionStatus::Running {
                        break Err(err);
                    }

                    let delay = retry.delay_for_attempt(execution.retry_count);
                    warn!(
                        execution_id = %ctx.execution_id,
                        "step '{}' failed (attempt {}/{}), retrying in {}ms: {}",
                        step.id,
                        execution.retry_count + 1,
                        retry.max_attempts,
                        delay,
                        err
                    );

                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    if status.load() != ExecutionStatus::Running {
                        info!(
                            execution_id = %ctx.execution_id,
                            "execution no longer running, dropping retry of step '{}'",
                            step.id
                        );
                        break Err(err);
                    }
                    execution.retry_count += 1;
                }
            }
        };

        match result {
            Ok(output) => {
                ctx.merge_output(&output);
                execution.output = Some(output);
                finish_step(execution, ExecutionStatus::Completed);
                Ok(())
            }
            Err(err) => {
                error!(execution_id = %ctx.execution_id, "step '{}' failed: {}", step.id, err);
                execution.error = Some(err.to_string());
                finish_step(execution, ExecutionStatus::Failed);
                Err(err)
            }
        }
    }

    /// One handler invocation raced against the step timeout.
    ///
    /// A missing handler is reported from here, so it is retried like any
    /// other failure when the step has a retry policy.
    async fn attempt(&self, step: &WorkflowStep, ctx: &ExecutionContext) -> Result<Value, EngineError> {
        let handler = self
            .handlers
            .get(&step.step_type)
            .map(|h| Arc::clone(h.value()))
            .ok_or(EngineError::MissingHandler(step.step_type))?;

        let limit = step
            .timeout
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_step_timeout);

        match tokio::time::timeout(limit, handler.execute(&step.config, ctx)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(EngineError::StepFailed {
                step_id: step.id.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(EngineError::StepTimeout {
                step_id: step.id.clone(),
                timeout_ms: duration_millis(limit),
            }),
        }
    }
}

fn finish_step(execution: &mut StepExecution, status: ExecutionStatus) {
    let now = Utc::now();
    execution.status = status;
    execution.completed_at = Some(now);
    execution.duration = Some(millis_between(execution.started_at, now));
}

fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
