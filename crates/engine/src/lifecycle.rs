//! Workflow definition registry: CRUD, versioning, status changes and
//! per-workflow execution metrics.
//!
//! Definitions and their metrics share one map entry, so creating or
//! deleting a workflow always creates or deletes its metrics with it.
//! Unknown ids yield `None` / `false`; nothing here fails on lookup.

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::dag::validate_workflow;
use crate::models::{Workflow, WorkflowDraft, WorkflowMetrics, WorkflowPatch, WorkflowStatus};
use crate::EngineError;

struct ManagedWorkflow {
    workflow: Workflow,
    metrics: WorkflowMetrics,
}

/// In-memory registry of workflow definitions.
#[derive(Default)]
pub struct WorkflowManager {
    workflows: DashMap<Uuid, ManagedWorkflow>,
}

impl WorkflowManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new definition with fresh id, timestamps and zeroed metrics.
    pub fn create(&self, draft: WorkflowDraft) -> Workflow {
        let workflow = draft.into_workflow();
        info!(workflow_id = %workflow.id, "workflow '{}' created", workflow.name);
        self.workflows.insert(
            workflow.id,
            ManagedWorkflow {
                workflow: workflow.clone(),
                metrics: WorkflowMetrics::default(),
            },
        );
        workflow
    }

    pub fn get(&self, id: Uuid) -> Option<Workflow> {
        self.workflows.get(&id).map(|entry| entry.workflow.clone())
    }

    /// All definitions, oldest first.
    pub fn list(&self) -> Vec<Workflow> {
        let mut all: Vec<Workflow> = self.workflows.iter().map(|e| e.workflow.clone()).collect();
        all.sort_by_key(|w| w.created_at);
        all
    }

    pub fn by_status(&self, status: WorkflowStatus) -> Vec<Workflow> {
        self.list().into_iter().filter(|w| w.status == status).collect()
    }

    /// Apply `patch`, bump the version and refresh `updated_at`.
    ///
    /// `id` and `created_at` are never touched.
    pub fn update(&self, id: Uuid, patch: WorkflowPatch) -> Option<Workflow> {
        let mut entry = self.workflows.get_mut(&id)?;
        let wf = &mut entry.workflow;

        if let Some(name) = patch.name {
            wf.name = name;
        }
        if let Some(description) = patch.description {
            wf.description = description;
        }
        if let Some(trigger) = patch.trigger {
            wf.trigger = trigger;
        }
        if let Some(steps) = patch.steps {
            wf.steps = steps;
        }
        if let Some(status) = patch.status {
            wf.status = status;
        }
        if let Some(enabled) = patch.enabled {
            wf.enabled = enabled;
        }
        if let Some(created_by) = patch.created_by {
            wf.created_by = Some(created_by);
        }

        wf.updated_at = Utc::now();
        wf.version += 1;
        debug!(workflow_id = %id, version = wf.version, "workflow updated");
        Some(wf.clone())
    }

    /// Remove the definition and its metrics together.
    pub fn delete(&self, id: Uuid) -> bool {
        let removed = self.workflows.remove(&id).is_some();
        if removed {
            info!(workflow_id = %id, "workflow deleted");
        }
        removed
    }

    pub fn enable(&self, id: Uuid) -> Option<Workflow> {
        self.update(id, WorkflowPatch::enabled(true))
    }

    pub fn disable(&self, id: Uuid) -> Option<Workflow> {
        self.update(id, WorkflowPatch::enabled(false))
    }

    pub fn activate(&self, id: Uuid) -> Option<Workflow> {
        self.update(id, WorkflowPatch::status(WorkflowStatus::Active))
    }

    pub fn pause(&self, id: Uuid) -> Option<Workflow> {
        self.update(id, WorkflowPatch::status(WorkflowStatus::Paused))
    }

    pub fn archive(&self, id: Uuid) -> Option<Workflow> {
        self.update(id, WorkflowPatch::status(WorkflowStatus::Archived))
    }

    /// Fold one execution outcome into the workflow's counters.
    ///
    /// The average duration is a running mean over all executions.
    pub fn record_execution(&self, id: Uuid, success: bool, duration_ms: u64) -> Option<WorkflowMetrics> {
        let mut entry = self.workflows.get_mut(&id)?;
        let entry = &mut *entry;
        let now = Utc::now();

        entry.workflow.execution_count += 1;
        entry.workflow.last_executed_at = Some(now);

        let m = &mut entry.metrics;
        m.total_executions += 1;
        if success {
            m.successful_executions += 1;
        } else {
            m.failed_executions += 1;
        }
        let n = m.total_executions as f64;
        m.average_duration = (m.average_duration * (n - 1.0) + duration_ms as f64) / n;
        m.success_rate = m.successful_executions as f64 / n * 100.0;
        m.last_execution = Some(now);

        Some(m.clone())
    }

    pub fn metrics(&self, id: Uuid) -> Option<WorkflowMetrics> {
        self.workflows.get(&id).map(|entry| entry.metrics.clone())
    }

    /// Copy a definition into a new draft, disabled, version 1 workflow.
    pub fn duplicate(&self, id: Uuid, name: Option<String>) -> Option<Workflow> {
        let source = self.get(id)?;
        let mut draft = WorkflowDraft::from(&source);
        draft.name = name.unwrap_or_else(|| format!("{} (Copy)", source.name));
        draft.status = WorkflowStatus::Draft;
        draft.enabled = false;
        Some(self.create(draft))
    }

    /// Pretty JSON of a definition, `None` if the id is unknown.
    ///
    /// # Errors
    /// Only if serialisation itself fails.
    pub fn export(&self, id: Uuid) -> Result<Option<String>, EngineError> {
        match self.get(id) {
            Some(workflow) => Ok(Some(serde_json::to_string_pretty(&workflow)?)),
            None => Ok(None),
        }
    }

    /// Create a workflow from exported JSON.
    ///
    /// The import always lands as a disabled draft with a new id, whatever
    /// the source record said.
    ///
    /// Unlike [`create`](Self::create), the step graph is validated here, so
    /// exporting a workflow that is still being assembled (no steps yet, or
    /// an edge to a step not added yet) does not import back.
    ///
    /// # Errors
    /// [`EngineError::Serialization`] for malformed JSON and the
    /// [`validate_workflow`] errors for a broken step graph.
    pub fn import(&self, json: &str) -> Result<Workflow, EngineError> {
        let mut draft: WorkflowDraft = serde_json::from_str(json)?;
        draft.status = WorkflowStatus::Draft;
        draft.enabled = false;

        validate_workflow(&draft.clone().into_workflow())?;
        Ok(self.create(draft))
    }

    /// Case-insensitive substring search over name and description.
    pub fn search(&self, query: &str) -> Vec<Workflow> {
        let needle = query.to_lowercase();
        self.list()
            .into_iter()
            .filter(|w| {
                w.name.to_lowercase().contains(&needle)
                    || w.description.to_lowercase().contains(&needle)
            })
            .collect()
    }
}
