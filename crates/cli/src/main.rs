//! `workflow-core` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — check a workflow JSON file's step graph.
//! - `run`      — execute a workflow JSON file with the built-in handlers.
//! - `emit`     — fire an event at a JSON file of automation rules.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use engine::{
    ActionType, AutomationEngine, ExecutionStatus, ExecutorConfig, RuleDraft, StepType, Workflow,
    WorkflowDraft, WorkflowEngine,
};
use handlers::builtin::{DelayHandler, LogAction, LogHandler, TransformHandler};

#[derive(Parser)]
#[command(
    name = "workflow-core",
    about = "In-process workflow and automation engine",
    version
)]
struct Cli {
    /// Log filter used when RUST_LOG is not set.
    #[arg(long, env = "WORKFLOW_LOG", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Execute a workflow definition JSON file and print the execution record.
    Run {
        path: PathBuf,
        /// Trigger payload as inline JSON.
        #[arg(long, default_value = "{}")]
        data: String,
        #[arg(long)]
        user: Option<String>,
        #[command(flatten)]
        limits: Limits,
    },
    /// Fire an event at a JSON array of automation rules.
    Emit {
        /// Path to the rules JSON file.
        rules: PathBuf,
        #[arg(long)]
        event: String,
        /// Event payload as inline JSON.
        #[arg(long, default_value = "{}")]
        data: String,
    },
}

#[derive(clap::Args)]
struct Limits {
    /// Timeout for steps that don't set one.
    #[arg(long, env = "WORKFLOW_STEP_TIMEOUT_MS", default_value_t = 30_000)]
    step_timeout_ms: u64,
    /// Maximum steps one execution may visit.
    #[arg(long, env = "WORKFLOW_MAX_TRANSITIONS", default_value_t = 1_000)]
    max_transitions: usize,
    /// Deadline for the whole execution.
    #[arg(long, env = "WORKFLOW_EXECUTION_TIMEOUT_MS")]
    execution_timeout_ms: Option<u64>,
}

impl From<&Limits> for ExecutorConfig {
    fn from(limits: &Limits) -> Self {
        Self {
            default_step_timeout: Duration::from_millis(limits.step_timeout_ms),
            max_step_transitions: limits.max_transitions,
            execution_timeout: limits.execution_timeout_ms.map(Duration::from_millis),
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}

/// Workflow files hold a definition without identity; one is assigned on load.
fn load_workflow(path: &Path) -> Result<Workflow> {
    let draft: WorkflowDraft = read_json(path)?;
    Ok(draft.into_workflow())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Command::Validate { path } => {
            let workflow = load_workflow(&path)?;
            engine::validate_workflow(&workflow)
                .with_context(|| format!("{} is not a valid workflow", path.display()))?;
            let preview = engine::dag::success_path(&workflow);
            println!("Workflow is valid. Success path: {preview:?}");
        }
        Command::Run { path, data, user, limits } => {
            let workflow = load_workflow(&path)?;
            engine::validate_workflow(&workflow)?;
            let trigger: Value = serde_json::from_str(&data).context("--data is not valid JSON")?;

            let engine = WorkflowEngine::new(ExecutorConfig::from(&limits));
            engine.register_handler(StepType::Transform, Arc::new(TransformHandler));
            engine.register_handler(StepType::Delay, Arc::new(DelayHandler));
            engine.register_handler(StepType::Notification, Arc::new(LogHandler));

            info!("Running workflow '{}' ({} steps)", workflow.name, workflow.steps.len());
            let execution = engine.execute(&workflow, trigger, user).await;
            println!("{}", serde_json::to_string_pretty(&execution)?);

            if execution.status != ExecutionStatus::Completed {
                bail!("execution ended with status {}", execution.status);
            }
        }
        Command::Emit { rules, event, data } => {
            let drafts: Vec<RuleDraft> = read_json(&rules)?;
            let payload: Value = serde_json::from_str(&data).context("--data is not valid JSON")?;

            let automation = AutomationEngine::new();
            for action_type in [
                ActionType::Notification,
                ActionType::Email,
                ActionType::Webhook,
                ActionType::Database,
                ActionType::Script,
            ] {
                automation.register_action_handler(action_type, Arc::new(LogAction));
            }
            for draft in drafts {
                automation.create_rule(draft).await;
            }

            let outcomes = automation.process_event(&event, &payload).await;
            info!("{} rule(s) matched '{event}'", outcomes.len());
            println!("{}", serde_json::to_string_pretty(&outcomes)?);
        }
    }

    Ok(())
}
