//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow and one of its
//! executions look like in memory. They serialise to the camelCase JSON
//! used by `export` / `import` and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use handlers::ExecutionContext;

use crate::condition::{self, Condition};

/// Default per-step timeout when a step does not set one.
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// What kind of external source starts a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Manual,
    Schedule,
    Event,
    Webhook,
    Database,
    Time,
}

/// How a workflow is started.
///
/// The engine never consults the trigger; callers use [`WorkflowTrigger::accepts`]
/// to decide whether to fire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTrigger {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Type-specific settings (cron expression, event name, webhook path...).
    #[serde(default)]
    pub config: Value,
    /// Pre-conditions evaluated against the trigger payload.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl WorkflowTrigger {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn event(name: impl Into<String>) -> Self {
        Self {
            trigger_type: TriggerType::Event,
            config: serde_json::json!({ "eventName": name.into() }),
            conditions: Vec::new(),
        }
    }

    /// Whether the trigger's pre-conditions hold for `payload`.
    pub fn accepts(&self, payload: &Value) -> bool {
        condition::evaluate(&self.conditions, payload)
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// The twelve step kinds. Handlers are registered per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Action,
    Condition,
    Loop,
    Parallel,
    Delay,
    Transform,
    ApiCall,
    Database,
    Notification,
    Email,
    Webhook,
    Script,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Action => "action",
            Self::Condition => "condition",
            Self::Loop => "loop",
            Self::Parallel => "parallel",
            Self::Delay => "delay",
            Self::Transform => "transform",
            Self::ApiCall => "api_call",
            Self::Database => "database",
            Self::Notification => "notification",
            Self::Email => "email",
            Self::Webhook => "webhook",
            Self::Script => "script",
        };
        f.write_str(s)
    }
}

/// Capped exponential backoff between attempts of a failing step.
///
/// All durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total number of handler invocations, the first one included.
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
    pub initial_delay: u64,
    pub max_delay: u64,
}

impl RetryConfig {
    /// Delay before the retry that follows attempt `attempt` (0-indexed):
    /// `min(max_delay, initial_delay * backoff_multiplier^attempt)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay as f64 * self.backoff_multiplier.powi(exponent);
        if !raw.is_finite() || raw >= self.max_delay as f64 {
            self.max_delay
        } else if raw <= 0.0 {
            0
        } else {
            raw as u64
        }
    }
}

/// A single node of the step graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Unique within the workflow; referenced by `on_success` / `on_failure`.
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub config: Value,
    /// When these evaluate false the step is skipped, not failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Milliseconds; the executor default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl WorkflowStep {
    /// Convenience constructor for tests and programmatic definitions.
    pub fn new(id: impl Into<String>, step_type: StepType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type,
            config: Value::Null,
            conditions: Vec::new(),
            on_success: None,
            on_failure: None,
            retry: None,
            timeout: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_conditions(mut self, conditions: Vec<Condition>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn on_success(mut self, next: impl Into<String>) -> Self {
        self.on_success = Some(next.into());
        self
    }

    pub fn on_failure(mut self, next: impl Into<String>) -> Self {
        self.on_failure = Some(next.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, ms: u64) -> Self {
        self.timeout = Some(ms);
        self
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Paused,
    Archived,
}

/// A complete, versioned workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger: WorkflowTrigger,
    pub steps: Vec<WorkflowStep>,
    pub status: WorkflowStatus,
    /// Independent of `status`.
    pub enabled: bool,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_count: u64,
}

impl Workflow {
    /// Convenience constructor for testing; real definitions go through
    /// `WorkflowManager::create`.
    pub fn new(name: impl Into<String>, trigger: WorkflowTrigger, steps: Vec<WorkflowStep>) -> Self {
        WorkflowDraft {
            name: name.into(),
            trigger,
            steps,
            ..WorkflowDraft::default()
        }
        .into_workflow()
    }

    pub fn step(&self, id: &str) -> Option<(usize, &WorkflowStep)> {
        self.steps.iter().enumerate().find(|(_, s)| s.id == id)
    }
}

/// Input to `WorkflowManager::create` and the shape accepted by `import`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowDraft {
    pub name: String,
    pub description: String,
    pub trigger: WorkflowTrigger,
    pub steps: Vec<WorkflowStep>,
    pub status: WorkflowStatus,
    pub enabled: bool,
    pub created_by: Option<String>,
}

impl WorkflowDraft {
    /// Assign identity and timestamps.
    pub fn into_workflow(self) -> Workflow {
        let now = Utc::now();
        Workflow {
            id: Uuid::new_v4(),
            name: self.name,
            description: self.description,
            trigger: self.trigger,
            steps: self.steps,
            status: self.status,
            enabled: self.enabled,
            version: 1,
            created_by: self.created_by,
            created_at: now,
            updated_at: now,
            last_executed_at: None,
            execution_count: 0,
        }
    }
}

impl From<&Workflow> for WorkflowDraft {
    fn from(wf: &Workflow) -> Self {
        Self {
            name: wf.name.clone(),
            description: wf.description.clone(),
            trigger: wf.trigger.clone(),
            steps: wf.steps.clone(),
            status: wf.status,
            enabled: wf.enabled,
            created_by: wf.created_by.clone(),
        }
    }
}

/// Fields `WorkflowManager::update` may change. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub trigger: Option<WorkflowTrigger>,
    pub steps: Option<Vec<WorkflowStep>>,
    pub status: Option<WorkflowStatus>,
    pub enabled: Option<bool>,
    pub created_by: Option<String>,
}

impl WorkflowPatch {
    pub fn name(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Self::default() }
    }

    pub fn status(status: WorkflowStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    pub fn enabled(enabled: bool) -> Self {
        Self { enabled: Some(enabled), ..Self::default() }
    }
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// Lifecycle of one execution (and of each step inside it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ExecutionStatus {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
    Timeout = 5,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Failed,
            4 => Self::Cancelled,
            5 => Self::Timeout,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Record of one step as it actually ran, retries included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    pub step_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Milliseconds.
    pub duration: Option<u64>,
    /// Context variables at entry.
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl StepExecution {
    /// A step entered just now with `input` as its context variables.
    pub fn started(step_id: &str, input: Value) -> Self {
        Self {
            step_id: step_id.to_owned(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration: None,
            input,
            output: None,
            error: None,
            retry_count: 0,
        }
    }
}

/// One runtime instance of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Milliseconds.
    pub duration: Option<u64>,
    pub trigger_data: Value,
    pub context: ExecutionContext,
    /// In the order steps actually ran.
    pub steps: Vec<StepExecution>,
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn step(&self, step_id: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

/// Aggregate counters for one workflow definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetrics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    /// Running mean, milliseconds.
    pub average_duration: f64,
    /// Percentage, 0–100.
    pub success_rate: f64,
    pub last_execution: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_is_capped_exponential() {
        let retry = RetryConfig {
            max_attempts: 10,
            backoff_multiplier: 2.0,
            initial_delay: 100,
            max_delay: 1000,
        };
        let delays: Vec<u64> = (0..7).map(|n| retry.delay_for_attempt(n)).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000, 1000]);
    }

    #[test]
    fn backoff_survives_huge_attempt_numbers() {
        let retry = RetryConfig {
            max_attempts: 1,
            backoff_multiplier: 10.0,
            initial_delay: 1,
            max_delay: 5000,
        };
        assert_eq!(retry.delay_for_attempt(u32::MAX), 5000);
    }

    #[test]
    fn step_json_uses_camel_case_edges_and_snake_case_type() {
        let step: WorkflowStep = serde_json::from_value(json!({
            "id": "call",
            "type": "api_call",
            "onSuccess": "done",
            "retry": { "maxAttempts": 3, "backoffMultiplier": 2.0, "initialDelay": 10, "maxDelay": 100 }
        }))
        .unwrap();

        assert_eq!(step.step_type, StepType::ApiCall);
        assert_eq!(step.on_success.as_deref(), Some("done"));
        assert_eq!(step.retry.map(|r| r.max_attempts), Some(3));
        assert_eq!(step.timeout, None);
    }

    #[test]
    fn draft_becomes_version_one() {
        let wf = Workflow::new("w", WorkflowTrigger::manual(), vec![]);
        assert_eq!(wf.version, 1);
        assert_eq!(wf.status, WorkflowStatus::Draft);
        assert_eq!(wf.created_at, wf.updated_at);
        assert_eq!(wf.execution_count, 0);
    }

    #[test]
    fn trigger_preconditions_gate_payloads() {
        let trigger: WorkflowTrigger = serde_json::from_value(json!({
            "type": "event",
            "config": { "eventName": "order.created" },
            "conditions": [{ "field": "order.total", "operator": "greaterThan", "value": 100 }]
        }))
        .unwrap();

        assert!(trigger.accepts(&json!({ "order": { "total": 150 } })));
        assert!(!trigger.accepts(&json!({ "order": { "total": 50 } })));
    }

    #[test]
    fn status_round_trips_through_u8() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::Timeout,
        ] {
            assert_eq!(ExecutionStatus::from_u8(status as u8), status);
        }
    }
}
