//! Event-driven automation rules.
//!
//! A rule listens for a named event, checks its conditions against the raw
//! event payload and runs its actions one after another. Rules are
//! independent of workflow execution: running a workflow is just another
//! action type, wired up by the host (see [`crate::bridge::WorkflowAction`]).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use handlers::ActionHandler;

use crate::condition::{self, Condition};

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// What makes a rule fire. Only `event` rules are reachable through
/// [`AutomationEngine::process_event`]; the others are driven by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleTrigger {
    Event {
        #[serde(rename = "eventName")]
        event_name: String,
    },
    Schedule {
        expression: String,
    },
    Condition {
        #[serde(default)]
        field: String,
    },
}

impl RuleTrigger {
    pub fn event(name: impl Into<String>) -> Self {
        Self::Event { event_name: name.into() }
    }

    fn event_name(&self) -> Option<&str> {
        match self {
            Self::Event { event_name } => Some(event_name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Workflow,
    Notification,
    Email,
    Webhook,
    Database,
    Script,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub config: Value,
}

impl AutomationAction {
    pub fn new(action_type: ActionType, config: Value) -> Self {
        Self { action_type, config }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRule {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger: RuleTrigger,
    pub conditions: Vec<Condition>,
    pub actions: Vec<AutomationAction>,
    pub enabled: bool,
    /// Higher runs first.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub execution_count: u64,
}

fn enabled_by_default() -> bool {
    true
}

/// Input to [`AutomationEngine::create_rule`]; also the format of rule files
/// read by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger: RuleTrigger,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<AutomationAction>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
}

impl RuleDraft {
    pub fn on_event(name: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            trigger: RuleTrigger::event(event),
            conditions: Vec::new(),
            actions: Vec::new(),
            enabled: true,
            priority: 0,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn action(mut self, action: AutomationAction) -> Self {
        self.actions.push(action);
        self
    }
}

/// Fields [`AutomationEngine::update_rule`] may change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RulePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub trigger: Option<RuleTrigger>,
    pub conditions: Option<Vec<Condition>>,
    pub actions: Option<Vec<AutomationAction>>,
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
}

/// What happened to one matching rule during `process_event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleOutcome {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub actions_succeeded: usize,
    pub actions_failed: usize,
    /// Actions whose type has no registered handler.
    pub actions_skipped: usize,
}

// ---------------------------------------------------------------------------
// Event index
// ---------------------------------------------------------------------------

/// `event name → rule ids` in insertion order, with the reverse mapping so a
/// rule can be de-indexed without knowing its old event.
#[derive(Debug, Default)]
struct EventIndex {
    by_event: HashMap<String, Vec<Uuid>>,
    by_rule: HashMap<Uuid, String>,
}

impl EventIndex {
    fn insert(&mut self, rule_id: Uuid, event: &str) {
        self.remove(rule_id);
        self.by_event.entry(event.to_owned()).or_default().push(rule_id);
        self.by_rule.insert(rule_id, event.to_owned());
    }

    fn remove(&mut self, rule_id: Uuid) {
        let Some(event) = self.by_rule.remove(&rule_id) else {
            return;
        };
        if let Some(ids) = self.by_event.get_mut(&event) {
            ids.retain(|id| *id != rule_id);
            if ids.is_empty() {
                self.by_event.remove(&event);
            }
        }
    }

    fn ids(&self, event: &str) -> &[Uuid] {
        self.by_event.get(event).map(Vec::as_slice).unwrap_or_default()
    }

    /// Index `rule` under its event, or drop it from the index if it no
    /// longer has one.
    fn sync(&mut self, rule: &AutomationRule) {
        match rule.trigger.event_name() {
            Some(event) => self.insert(rule.id, event),
            None => self.remove(rule.id),
        }
    }
}

#[derive(Debug, Default)]
struct RuleStore {
    rules: HashMap<Uuid, AutomationRule>,
    index: EventIndex,
}

// ---------------------------------------------------------------------------
// AutomationEngine
// ---------------------------------------------------------------------------

/// Rule registry plus action dispatch.
#[derive(Default)]
pub struct AutomationEngine {
    store: RwLock<RuleStore>,
    actions: DashMap<ActionType, Arc<dyn ActionHandler>>,
}

impl AutomationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the handler for an action type, returning the one it replaces.
    pub fn register_action_handler(
        &self,
        action_type: ActionType,
        handler: Arc<dyn ActionHandler>,
    ) -> Option<Arc<dyn ActionHandler>> {
        self.actions.insert(action_type, handler)
    }

    pub async fn create_rule(&self, draft: RuleDraft) -> AutomationRule {
        let now = Utc::now();
        let rule = AutomationRule {
            id: Uuid::new_v4(),
            name: draft.name,
            description: draft.description,
            trigger: draft.trigger,
            conditions: draft.conditions,
            actions: draft.actions,
            enabled: draft.enabled,
            priority: draft.priority,
            created_at: now,
            updated_at: now,
            execution_count: 0,
        };

        let mut store = self.store.write().await;
        store.index.sync(&rule);
        store.rules.insert(rule.id, rule.clone());
        info!(rule_id = %rule.id, "automation rule '{}' created", rule.name);
        rule
    }

    pub async fn get_rule(&self, id: Uuid) -> Option<AutomationRule> {
        self.store.read().await.rules.get(&id).cloned()
    }

    /// All rules, highest priority first.
    pub async fn list_rules(&self) -> Vec<AutomationRule> {
        let mut rules: Vec<AutomationRule> = self.store.read().await.rules.values().cloned().collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        rules
    }

    /// Rules indexed under `event`, in index order.
    pub async fn rules_for_event(&self, event: &str) -> Vec<AutomationRule> {
        let store = self.store.read().await;
        store
            .index
            .ids(event)
            .iter()
            .filter_map(|id| store.rules.get(id).cloned())
            .collect()
    }

    /// Apply `patch` and re-index the rule; a changed event name moves the
    /// rule rather than adding a second entry.
    pub async fn update_rule(&self, id: Uuid, patch: RulePatch) -> Option<AutomationRule> {
        let mut guard = self.store.write().await;
        let store = &mut *guard;
        let rule = store.rules.get_mut(&id)?;

        if let Some(name) = patch.name {
            rule.name = name;
        }
        if let Some(description) = patch.description {
            rule.description = description;
        }
        if let Some(trigger) = patch.trigger {
            rule.trigger = trigger;
        }
        if let Some(conditions) = patch.conditions {
            rule.conditions = conditions;
        }
        if let Some(actions) = patch.actions {
            rule.actions = actions;
        }
        if let Some(enabled) = patch.enabled {
            rule.enabled = enabled;
        }
        if let Some(priority) = patch.priority {
            rule.priority = priority;
        }
        rule.updated_at = Utc::now();

        store.index.sync(rule);
        Some(rule.clone())
    }

    pub async fn delete_rule(&self, id: Uuid) -> bool {
        let mut store = self.store.write().await;
        store.index.remove(id);
        store.rules.remove(&id).is_some()
    }

    pub async fn enable_rule(&self, id: Uuid) -> Option<AutomationRule> {
        self.update_rule(id, RulePatch { enabled: Some(true), ..RulePatch::default() }).await
    }

    pub async fn disable_rule(&self, id: Uuid) -> Option<AutomationRule> {
        self.update_rule(id, RulePatch { enabled: Some(false), ..RulePatch::default() }).await
    }

    /// Dispatch `event` to every enabled rule listening for it.
    ///
    /// Rules run highest priority first (ties keep registration order).
    /// Actions run sequentially; a failing action is logged and does not
    /// stop its siblings or later rules.
    #[instrument(skip(self, data))]
    pub async fn process_event(&self, event: &str, data: &Value) -> Vec<RuleOutcome> {
        let mut candidates: Vec<AutomationRule> = {
            let store = self.store.read().await;
            store
                .index
                .ids(event)
                .iter()
                .filter_map(|id| store.rules.get(id))
                .filter(|rule| rule.enabled)
                .cloned()
                .collect()
        };
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut outcomes = Vec::new();
        for rule in candidates {
            if !condition::evaluate(&rule.conditions, data) {
                debug!(rule_id = %rule.id, "rule '{}' conditions not met", rule.name);
                continue;
            }
            debug!(rule_id = %rule.id, priority = rule.priority, "rule '{}' matched", rule.name);

            let outcome = self.run_actions(&rule, data).await;

            if let Some(stored) = self.store.write().await.rules.get_mut(&rule.id) {
                stored.execution_count += 1;
                stored.updated_at = Utc::now();
            }
            outcomes.push(outcome);
        }

        outcomes
    }

    async fn run_actions(&self, rule: &AutomationRule, data: &Value) -> RuleOutcome {
        let mut outcome = RuleOutcome {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            actions_succeeded: 0,
            actions_failed: 0,
            actions_skipped: 0,
        };

        for action in &rule.actions {
            let handler = self
                .actions
                .get(&action.action_type)
                .map(|h| Arc::clone(h.value()));
            let Some(handler) = handler else {
                debug!(rule_id = %rule.id, "no handler for {:?} action, skipping", action.action_type);
                outcome.actions_skipped += 1;
                continue;
            };

            match handler.execute(&action.config, data).await {
                Ok(()) => outcome.actions_succeeded += 1,
                Err(e) => {
                    error!(
                        rule_id = %rule.id,
                        "{:?} action of rule '{}' failed: {}",
                        action.action_type,
                        rule.name,
                        e
                    );
                    outcome.actions_failed += 1;
                }
            }
        }

        outcome
    }
}
