//! Tests for the workflow execution engine.
//!
//! Step handlers are `MockStep`s from the handlers crate, so every test runs
//! in-process. Tests that involve backoff or timeouts run on a paused tokio
//! clock, which auto-advances through sleeps.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use handlers::mock::{entries, journal, MockStep};
use handlers::StepHandler;

use crate::condition::{Condition, ConditionOperator};
use crate::executor::{ExecutorConfig, WorkflowEngine};
use crate::models::{
    ExecutionStatus, RetryConfig, StepType, Workflow, WorkflowExecution, WorkflowStep,
    WorkflowTrigger,
};

fn workflow(steps: Vec<WorkflowStep>) -> Workflow {
    Workflow::new("test", WorkflowTrigger::manual(), steps)
}

fn action(id: &str) -> WorkflowStep {
    WorkflowStep::new(id, StepType::Action)
}

fn retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        backoff_multiplier: 2.0,
        initial_delay: 100,
        max_delay: 1000,
    }
}

/// Engine where each step type maps to one handler.
fn engine_with(handlers: Vec<(StepType, Arc<dyn StepHandler>)>) -> WorkflowEngine {
    let engine = WorkflowEngine::default();
    for (step_type, handler) in handlers {
        engine.register_handler(step_type, handler);
    }
    engine
}

/// Records the status of every notification.
fn status_recorder(engine: &WorkflowEngine) -> Arc<Mutex<Vec<ExecutionStatus>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine.subscribe(move |execution: &WorkflowExecution| -> anyhow::Result<()> {
        sink.lock().unwrap().push(execution.status);
        Ok(())
    });
    seen
}

// ============================================================
// Graph walking
// ============================================================

#[tokio::test]
async fn unset_on_success_falls_through_in_declaration_order() {
    let log = journal();
    let engine = engine_with(vec![
        (StepType::Action, Arc::new(MockStep::returning("action", json!({ "a": 1 })).journaled(&log))),
        (StepType::Transform, Arc::new(MockStep::returning("transform", json!({ "b": 2 })).journaled(&log))),
    ]);
    let wf = workflow(vec![action("one"), WorkflowStep::new("two", StepType::Transform)]);

    let execution = engine.execute(&wf, json!({ "origin": "trigger" }), Some("u-1".into())).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(entries(&log), vec!["action", "transform"]);
    let order: Vec<&str> = execution.steps.iter().map(|s| s.step_id.as_str()).collect();
    assert_eq!(order, vec!["one", "two"]);

    // Later steps see earlier outputs.
    assert_eq!(execution.step("two").unwrap().input, json!({ "origin": "trigger", "a": 1 }));
    assert_eq!(
        Value::Object(execution.context.variables.clone()),
        json!({ "origin": "trigger", "a": 1, "b": 2 })
    );
    assert_eq!(execution.context.user_id.as_deref(), Some("u-1"));
    assert!(execution.error.is_none());
    assert!(execution.completed_at.is_some());
}

#[tokio::test]
async fn on_success_edges_override_declaration_order() {
    let step = Arc::new(MockStep::returning("step", json!({})));
    let engine = engine_with(vec![(StepType::Action, step.clone())]);
    // a jumps over b; c is last so the walk ends there.
    let wf = workflow(vec![action("a").on_success("c"), action("b"), action("c")]);

    let execution = engine.execute(&wf, json!({}), None).await;

    let order: Vec<&str> = execution.steps.iter().map(|s| s.step_id.as_str()).collect();
    assert_eq!(order, vec!["a", "c"]);
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(step.call_count(), 2);
}

#[tokio::test]
async fn cyclic_graph_is_bounded_by_transition_limit() {
    let step = Arc::new(MockStep::returning("step", json!({})));
    let engine = WorkflowEngine::new(ExecutorConfig {
        max_step_transitions: 5,
        ..ExecutorConfig::default()
    });
    engine.register_handler(StepType::Loop, step.clone());
    let wf = workflow(vec![WorkflowStep::new("spin", StepType::Loop).on_success("spin")]);

    let execution = engine.execute(&wf, json!({}), None).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.steps.len(), 5);
    assert_eq!(step.call_count(), 5);
    assert_eq!(execution.error.as_deref(), Some("execution exceeded 5 step transitions"));
}

#[tokio::test]
async fn jump_to_unknown_step_ends_the_walk_quietly() {
    let step = Arc::new(MockStep::returning("step", json!({})));
    let engine = engine_with(vec![(StepType::Action, step.clone())]);
    let wf = workflow(vec![action("a").on_success("ghost"), action("b")]);

    let execution = engine.execute(&wf, json!({}), None).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.steps.len(), 1);
    assert_eq!(step.call_count(), 1);
}

#[tokio::test]
async fn empty_workflow_completes_without_steps() {
    let engine = WorkflowEngine::default();
    let execution = engine.execute(&workflow(vec![]), json!({}), None).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.steps.is_empty());
}

#[tokio::test]
async fn unmet_condition_skips_step_without_touching_context() {
    let a = Arc::new(MockStep::returning("a", json!({ "fromA": true })));
    let b = Arc::new(MockStep::returning("b", json!({ "fromB": true })));
    let engine = engine_with(vec![(StepType::Action, a.clone()), (StepType::Email, b.clone())]);

    let wf = workflow(vec![
        action("A").on_success("B"),
        WorkflowStep::new("B", StepType::Email).with_conditions(vec![Condition::new(
            "vip",
            ConditionOperator::Equals,
            json!(true),
        )]),
    ]);

    let execution = engine.execute(&wf, json!({ "vip": false }), None).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let b_exec = execution.step("B").unwrap();
    assert_eq!(b_exec.status, ExecutionStatus::Completed);
    assert_eq!(b_exec.output, Some(json!({ "skipped": true })));
    assert_eq!(b.call_count(), 0);
    assert_eq!(
        Value::Object(execution.context.variables.clone()),
        json!({ "vip": false, "fromA": true })
    );
}

#[tokio::test]
async fn non_object_output_is_recorded_but_not_merged() {
    let engine = engine_with(vec![(StepType::Script, Arc::new(MockStep::returning("s", json!([1, 2]))))]);
    let wf = workflow(vec![WorkflowStep::new("s", StepType::Script)]);

    let execution = engine.execute(&wf, json!({ "k": "v" }), None).await;

    assert_eq!(execution.step("s").unwrap().output, Some(json!([1, 2])));
    assert_eq!(Value::Object(execution.context.variables), json!({ "k": "v" }));
}

// ============================================================
// Failure handling
// ============================================================

#[tokio::test(start_paused = true)]
async fn always_failing_step_is_attempted_max_attempts_times() {
    let step = Arc::new(MockStep::failing("flaky", "upstream 503"));
    let engine = engine_with(vec![(StepType::ApiCall, step.clone())]);
    let wf = workflow(vec![WorkflowStep::new("call", StepType::ApiCall).with_retry(retry(3))]);

    let started = tokio::time::Instant::now();
    let execution = engine.execute(&wf, json!({}), None).await;

    assert_eq!(step.call_count(), 3);
    assert_eq!(execution.status, ExecutionStatus::Failed);
    // Retried in place: one record, last retry count is 2.
    assert_eq!(execution.steps.len(), 1);
    assert_eq!(execution.steps[0].retry_count, 2);
    assert_eq!(execution.steps[0].status, ExecutionStatus::Failed);
    assert!(execution.error.as_deref().unwrap().contains("upstream 503"));
    // Backoff slept 100ms then 200ms.
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn flaky_step_recovers_within_retry_budget() {
    let step = Arc::new(MockStep::flaky("flaky", 2, json!({ "ok": true })));
    let engine = engine_with(vec![(StepType::Webhook, step.clone())]);
    let wf = workflow(vec![WorkflowStep::new("hook", StepType::Webhook).with_retry(retry(3))]);

    let execution = engine.execute(&wf, json!({}), None).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.steps[0].retry_count, 2);
    assert_eq!(execution.context.variables.get("ok"), Some(&json!(true)));
}

#[tokio::test]
async fn exhausted_step_without_on_failure_aborts_the_walk() {
    let ok = Arc::new(MockStep::returning("ok", json!({})));
    let boom = Arc::new(MockStep::failing("boom", "something broke irreparably"));
    let engine = engine_with(vec![(StepType::Action, ok.clone()), (StepType::Script, boom.clone())]);
    let wf = workflow(vec![action("first"), WorkflowStep::new("boom", StepType::Script), action("never")]);

    let execution = engine.execute(&wf, json!({}), None).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(ok.call_count(), 1);
    assert!(execution.step("never").is_none());
    assert_eq!(
        execution.error.as_deref(),
        Some("step 'boom' failed: handler failed: something broke irreparably")
    );
}

#[tokio::test]
async fn on_failure_edge_routes_around_a_failed_step() {
    let ok = Arc::new(MockStep::returning("ok", json!({ "recovered": true })));
    let boom = Arc::new(MockStep::failing("boom", "nope"));
    let engine = engine_with(vec![(StepType::Action, ok.clone()), (StepType::Script, boom)]);
    let wf = workflow(vec![
        WorkflowStep::new("risky", StepType::Script).on_failure("fallback"),
        action("skipped-on-failure"),
        action("fallback"),
    ]);

    let execution = engine.execute(&wf, json!({}), None).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let order: Vec<&str> = execution.steps.iter().map(|s| s.step_id.as_str()).collect();
    assert_eq!(order, vec!["risky", "fallback"]);
    assert_eq!(execution.steps[0].status, ExecutionStatus::Failed);
    assert_eq!(execution.context.metadata["lastError"]["stepId"], json!("risky"));
}

#[tokio::test(start_paused = true)]
async fn slow_handler_hits_step_timeout() {
    let slow = Arc::new(MockStep::sleeping("slow", Duration::from_secs(5), json!({})));
    let engine = engine_with(vec![(StepType::Database, slow)]);
    let wf = workflow(vec![WorkflowStep::new("query", StepType::Database).with_timeout(100)]);

    let execution = engine.execute(&wf, json!({}), None).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_deref(), Some("step 'query' timed out after 100ms"));
}

#[tokio::test(start_paused = true)]
async fn missing_handler_still_consumes_retries() {
    let engine = WorkflowEngine::default();
    let wf = workflow(vec![WorkflowStep::new("mail", StepType::Email).with_retry(retry(3))]);

    let execution = engine.execute(&wf, json!({}), None).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.steps[0].retry_count, 2);
    assert_eq!(
        execution.error.as_deref(),
        Some("no handler registered for step type 'email'")
    );
}

#[tokio::test(start_paused = true)]
async fn execution_deadline_ends_with_timeout_status() {
    let engine = WorkflowEngine::new(ExecutorConfig {
        execution_timeout: Some(Duration::from_secs(1)),
        ..ExecutorConfig::default()
    });
    engine.register_handler(
        StepType::Delay,
        Arc::new(MockStep::sleeping("wait", Duration::from_secs(10), json!({}))),
    );
    let seen = status_recorder(&engine);
    let wf = workflow(vec![WorkflowStep::new("wait", StepType::Delay).with_timeout(60_000)]);

    let execution = engine.execute(&wf, json!({}), None).await;

    assert_eq!(execution.status, ExecutionStatus::Timeout);
    assert_eq!(execution.error.as_deref(), Some("execution timed out after 1000ms"));
    assert_eq!(*seen.lock().unwrap(), vec![ExecutionStatus::Running, ExecutionStatus::Timeout]);

    // The interrupted step is still on the record.
    assert_eq!(execution.steps.len(), 1);
    let wait = execution.step("wait").unwrap();
    assert_eq!(wait.status, ExecutionStatus::Timeout);
    assert!(wait.completed_at.is_some());
    assert_eq!(wait.error.as_deref(), Some("execution timed out after 1000ms"));
    assert_eq!(engine.get_execution(execution.id).unwrap().steps, execution.steps);
}

// ============================================================
// Subscribers, cancellation, concurrency
// ============================================================

#[tokio::test]
async fn subscribers_hear_start_and_end_only() {
    let engine = engine_with(vec![(StepType::Action, Arc::new(MockStep::returning("s", json!({}))))]);
    let seen = status_recorder(&engine);
    engine.subscribe(|_: &WorkflowExecution| -> anyhow::Result<()> { anyhow::bail!("subscriber down") });

    let execution = engine.execute(&workflow(vec![action("a"), action("b"), action("c")]), json!({}), None).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(*seen.lock().unwrap(), vec![ExecutionStatus::Running, ExecutionStatus::Completed]);
}

#[tokio::test]
async fn unsubscribed_observer_is_not_called() {
    let engine = engine_with(vec![(StepType::Action, Arc::new(MockStep::returning("s", json!({}))))]);
    let seen = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&seen);
    let id = engine.subscribe(move |_: &WorkflowExecution| -> anyhow::Result<()> {
        *sink.lock().unwrap() += 1;
        Ok(())
    });

    assert!(engine.unsubscribe(id));
    engine.execute(&workflow(vec![action("a")]), json!({}), None).await;
    assert_eq!(*seen.lock().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_the_walk_and_is_not_overwritten() {
    let slow = Arc::new(MockStep::sleeping("slow", Duration::from_secs(1), json!({ "slow": true })));
    let after = Arc::new(MockStep::returning("after", json!({})));
    let engine = Arc::new(engine_with(vec![(StepType::Delay, slow), (StepType::Action, after.clone())]));
    let seen = status_recorder(&engine);
    let wf = workflow(vec![WorkflowStep::new("wait", StepType::Delay), action("after")]);

    let (id, handle) = engine.spawn(wf.clone(), json!({}), None);
    assert!(engine.cancel_execution(id));
    assert!(!engine.cancel_execution(id));

    let execution = handle.await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(after.call_count(), 0);
    assert_eq!(*seen.lock().unwrap(), vec![ExecutionStatus::Running, ExecutionStatus::Cancelled]);

    let stored = engine.get_execution(id).unwrap();
    assert_eq!(stored.status, ExecutionStatus::Cancelled);
    assert_eq!(stored.completed_at, execution.completed_at);
    assert_eq!(engine.executions_for(wf.id).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelling_mid_step_lets_the_step_finish_but_runs_nothing_after() {
    let slow = Arc::new(MockStep::sleeping("slow", Duration::from_secs(1), json!({ "slow": true })));
    let after = Arc::new(MockStep::returning("after", json!({})));
    let engine = Arc::new(engine_with(vec![(StepType::Delay, slow.clone()), (StepType::Action, after.clone())]));
    let seen = status_recorder(&engine);
    let wf = workflow(vec![WorkflowStep::new("wait", StepType::Delay), action("after")]);

    let (id, handle) = engine.spawn(wf, json!({}), None);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(slow.call_count(), 1);
    assert_eq!(engine.get_execution(id).unwrap().steps[0].status, ExecutionStatus::Running);
    assert!(engine.cancel_execution(id));

    let execution = handle.await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(after.call_count(), 0);
    assert_eq!(execution.steps.len(), 1);
    assert_eq!(execution.steps[0].status, ExecutionStatus::Completed);
    assert_eq!(*seen.lock().unwrap(), vec![ExecutionStatus::Running, ExecutionStatus::Cancelled]);

    let stored = engine.get_execution(id).unwrap();
    assert_eq!(stored.status, ExecutionStatus::Cancelled);
    assert_eq!(stored.steps, execution.steps);
}

#[tokio::test(start_paused = true)]
async fn cancelling_during_backoff_drops_the_pending_retry() {
    let failing = Arc::new(MockStep::failing("flaky-api", "upstream unavailable"));
    let engine = Arc::new(engine_with(vec![(StepType::Action, failing.clone())]));
    let wf = workflow(vec![action("call").with_retry(RetryConfig {
        max_attempts: 3,
        backoff_multiplier: 2.0,
        initial_delay: 10_000,
        max_delay: 60_000,
    })]);

    let (id, handle) = engine.spawn(wf, json!({}), None);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(failing.call_count(), 1);
    assert!(engine.cancel_execution(id));

    let execution = handle.await.unwrap();

    assert_eq!(failing.call_count(), 1);
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    let call = execution.step("call").unwrap();
    assert_eq!(call.status, ExecutionStatus::Failed);
    assert_eq!(call.retry_count, 0);
}

#[tokio::test]
async fn finished_execution_cannot_be_cancelled() {
    let engine = engine_with(vec![(StepType::Action, Arc::new(MockStep::returning("s", json!({}))))]);
    let execution = engine.execute(&workflow(vec![action("a")]), json!({}), None).await;

    assert!(!engine.cancel_execution(execution.id));
    assert!(!engine.cancel_execution(uuid::Uuid::new_v4()));
    assert_eq!(engine.get_execution(execution.id).unwrap().status, ExecutionStatus::Completed);

    assert_eq!(engine.prune_finished(), 1);
    assert!(engine.get_execution(execution.id).is_none());
}

#[tokio::test]
async fn concurrent_executions_have_isolated_contexts() {
    let engine = engine_with(vec![(StepType::Action, Arc::new(MockStep::returning("s", json!({ "seen": true }))))]);
    let wf = workflow(vec![action("a")]);

    let (first, second) = tokio::join!(
        engine.execute(&wf, json!({ "n": 1 }), None),
        engine.execute(&wf, json!({ "n": 2 }), None),
    );

    assert_ne!(first.id, second.id);
    assert_eq!(first.context.variables["n"], json!(1));
    assert_eq!(second.context.variables["n"], json!(2));
    assert_eq!(engine.executions_for(wf.id).len(), 2);
}
