//! Step-graph validation — run this before importing or executing a
//! workflow from an untrusted source.
//!
//! Rules enforced:
//! 1. The workflow has at least one step.
//! 2. Step IDs must be unique within the workflow.
//! 3. Every `onSuccess` / `onFailure` edge must reference an existing step.
//!
//! Cycles are allowed: a step may loop back to an earlier one. The executor
//! bounds such walks with `ExecutorConfig::max_step_transitions`.

use std::collections::HashSet;

use crate::{models::Workflow, EngineError};

/// Validate the workflow's step graph.
///
/// # Errors
/// - [`EngineError::EmptyWorkflow`] if there are no steps.
/// - [`EngineError::DuplicateStepId`] if two steps share an ID.
/// - [`EngineError::UnknownStepReference`] if an edge references a missing step.
pub fn validate_workflow(workflow: &Workflow) -> Result<(), EngineError> {
    if workflow.steps.is_empty() {
        return Err(EngineError::EmptyWorkflow);
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if !seen_ids.insert(step.id.as_str()) {
            return Err(EngineError::DuplicateStepId(step.id.clone()));
        }
    }

    for step in &workflow.steps {
        let edges = [("onSuccess", &step.on_success), ("onFailure", &step.on_failure)];
        for (edge, target) in edges {
            if let Some(target) = target {
                if !seen_ids.contains(target.as_str()) {
                    return Err(EngineError::UnknownStepReference {
                        step_id: step.id.clone(),
                        edge,
                        target: target.clone(),
                    });
                }
            }
        }
    }

    Ok(())
}

/// Step IDs in the order a fully successful walk would visit them, stopping
/// at the first revisit. Useful for previews; branching on failure is not
/// followed.
pub fn success_path(workflow: &Workflow) -> Vec<String> {
    let mut path = Vec::new();
    let mut seen = HashSet::new();
    let mut current = workflow.steps.first().map(|s| s.id.clone());

    while let Some(id) = current {
        let Some((index, step)) = workflow.step(&id) else { break };
        if !seen.insert(id.clone()) {
            break;
        }
        path.push(id);
        current = step
            .on_success
            .clone()
            .or_else(|| workflow.steps.get(index + 1).map(|s| s.id.clone()));
    }

    path
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StepType, WorkflowStep, WorkflowTrigger};

    fn make_step(id: &str) -> WorkflowStep {
        WorkflowStep::new(id, StepType::Action)
    }

    fn make_workflow(steps: Vec<WorkflowStep>) -> Workflow {
        Workflow::new("test", WorkflowTrigger::manual(), steps)
    }

    #[test]
    fn linear_workflow_is_valid() {
        let workflow = make_workflow(vec![make_step("a"), make_step("b"), make_step("c")]);
        assert!(validate_workflow(&workflow).is_ok());
        assert_eq!(success_path(&workflow), vec!["a", "b", "c"]);
    }

    #[test]
    fn explicit_edges_reorder_the_success_path() {
        // a → c, then c falls through to nothing, b is never reached.
        let workflow = make_workflow(vec![
            make_step("a").on_success("c"),
            make_step("b"),
            make_step("c"),
        ]);
        assert_eq!(success_path(&workflow), vec!["a", "c"]);
    }

    #[test]
    fn empty_workflow_is_rejected() {
        assert!(matches!(
            validate_workflow(&make_workflow(vec![])),
            Err(EngineError::EmptyWorkflow)
        ));
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        let workflow = make_workflow(vec![make_step("a"), make_step("a")]);
        assert!(matches!(
            validate_workflow(&workflow),
            Err(EngineError::DuplicateStepId(id)) if id == "a"
        ));
    }

    #[test]
    fn edge_referencing_missing_step_is_rejected() {
        let workflow = make_workflow(vec![make_step("a").on_failure("ghost")]);
        assert!(matches!(
            validate_workflow(&workflow),
            Err(EngineError::UnknownStepReference { target, edge: "onFailure", .. }) if target == "ghost"
        ));
    }

    #[test]
    fn loops_are_allowed_and_preview_stops_at_revisit() {
        // a → b → a
        let workflow = make_workflow(vec![make_step("a"), make_step("b").on_success("a")]);
        assert!(validate_workflow(&workflow).is_ok());
        assert_eq!(success_path(&workflow), vec!["a", "b"]);
    }
}
