//! `engine` crate — workflow model, condition evaluation, execution engine,
//! lifecycle manager and automation rules.

pub mod automation;
pub mod bridge;
pub mod condition;
pub mod dag;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod models;

pub use automation::{
    ActionType, AutomationAction, AutomationEngine, AutomationRule, RuleDraft, RuleOutcome,
    RulePatch, RuleTrigger,
};
pub use bridge::WorkflowAction;
pub use condition::{Condition, ConditionOperator, LogicalOperator};
pub use dag::validate_workflow;
pub use error::EngineError;
pub use executor::{ExecutionSubscriber, ExecutorConfig, SubscriptionId, WorkflowEngine};
pub use lifecycle::WorkflowManager;
pub use models::{
    ExecutionStatus, RetryConfig, StepExecution, StepType, TriggerType, Workflow, WorkflowDraft,
    WorkflowExecution, WorkflowMetrics, WorkflowPatch, WorkflowStatus, WorkflowStep, WorkflowTrigger,
};

#[cfg(test)]
mod executor_tests;
