//! `agentflow run`: execute a workflow file and report the outcome.
//!
//! Ctrl+C cancels the run: no further steps are dispatched and the engine
//! settles in-flight calls according to `abort_in_flight_on_cancel`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use agentflow_core::event::EventBus;
use agentflow_core::state::WorkflowStateManager;
use agentflow_core::workflow::{DagExecutor, Workflow, WorkflowExecutor};
use agentflow_infra::config::{load_engine_config, resolve_concurrency};
use agentflow_infra::filesystem::resolve_data_dir;
use agentflow_infra::snapshot::export_workflow;
use agentflow_types::event::WorkflowEvent;
use agentflow_types::status::{StepStatus, WorkflowStatus};
use agentflow_types::workflow::{ContextMap, RunResult};

use super::{Output, load_workflow};

/// Arguments of one `agentflow run` invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub file: PathBuf,
    pub input: Option<String>,
    pub input_file: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub state_out: Option<PathBuf>,
}

pub async fn handle_run(options: RunOptions, output: Output) -> Result<()> {
    let data_dir = resolve_data_dir();
    let config = load_engine_config(&data_dir).await;

    let workflow = load_workflow(&options.file)?;
    let mut def = workflow.into_definition();
    def.concurrency = Some(resolve_concurrency(
        &config,
        def.concurrency,
        options.concurrency,
    ));
    if let Some(secs) = options.timeout_secs {
        def.timeout_secs = Some(secs);
    }
    let workflow = Workflow::new(def).context("Invalid command-line override")?;

    let input = read_input(options.input.as_deref(), options.input_file.as_deref()).await?;

    let store = Arc::new(WorkflowStateManager::new());
    let event_bus = EventBus::new(config.event_capacity);
    let progress = (output.verbose > 0 && !output.json && !output.quiet)
        .then(|| tokio::spawn(print_progress(event_bus.subscribe())));
    let executor = DagExecutor::new(Arc::clone(&store), event_bus).with_config(config);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let result = executor
        .execute_with_cancellation(&workflow, input, cancel)
        .await;

    // Closing the last sender ends the progress printer
    drop(executor);
    if let Some(handle) = progress {
        let _ = handle.await;
    }

    if let Some(path) = &options.state_out {
        if store.contains(workflow.id()) {
            export_workflow(&store, workflow.id(), path)
                .await
                .with_context(|| format!("Failed to write state snapshot to {}", path.display()))?;
        }
    }

    let result = result.with_context(|| format!("Workflow '{}' failed to run", workflow.id()))?;

    if output.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if !output.quiet {
        print_result(&workflow, &result);
    }

    if result.status != WorkflowStatus::Completed {
        bail!("workflow '{}' finished with status {}", result.workflow_id, result.status);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

async fn read_input(inline: Option<&str>, file: Option<&Path>) -> Result<ContextMap> {
    match (inline, file) {
        (Some(raw), _) => parse_input(raw),
        (None, Some(path)) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read input file {}", path.display()))?;
            parse_input(&raw)
        }
        (None, None) => Ok(ContextMap::new()),
    }
}

/// Parse the initial context; it must be a JSON object.
fn parse_input(raw: &str) -> Result<ContextMap> {
    match serde_json::from_str(raw).context("Input is not valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("Input must be a JSON object, got {}", json_kind(&other)),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

async fn print_progress(mut events: broadcast::Receiver<WorkflowEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => eprintln!("{}", describe_event(&event)),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "progress output fell behind, events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn describe_event(event: &WorkflowEvent) -> String {
    match event {
        WorkflowEvent::RunStarted {
            workflow_id,
            total_steps,
            ..
        } => format!(
            "  {} run of '{}' started ({} steps)",
            style(">").cyan(),
            workflow_id,
            total_steps
        ),
        WorkflowEvent::StepStarted {
            step_id, agent_id, ..
        } => format!("  {} {step_id} on {agent_id}", style("~").blue()),
        WorkflowEvent::StepCompleted {
            step_id,
            duration_ms,
            ..
        } => format!("  {} {step_id} ({duration_ms} ms)", style("✓").green()),
        WorkflowEvent::StepFailed { step_id, error, .. } => {
            format!("  {} {step_id}: {}", style("✗").red(), style(error).red())
        }
        WorkflowEvent::StepSkipped {
            step_id, reason, ..
        } => format!("  {} {step_id}: {}", style("-").yellow(), style(reason).dim()),
        WorkflowEvent::RunFinished { status, .. } => {
            format!("  {} run finished: {status}", style("<").cyan())
        }
    }
}

fn print_result(workflow: &Workflow, result: &RunResult) {
    let duration_ms = (result.finished_at - result.started_at).num_milliseconds();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Agent"),
            Cell::new("Detail"),
        ]);

    // Declaration order reads better than id order
    for step in &workflow.definition().steps {
        let Some(outcome) = result.steps.get(&step.id) else {
            continue;
        };
        let detail = match (&outcome.error, &outcome.result) {
            (Some(error), _) => error.clone(),
            (None, Some(map)) if !map.is_empty() => {
                map.keys().cloned().collect::<Vec<_>>().join(", ")
            }
            _ => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(step.display_name()),
            format_step_status(outcome.status),
            Cell::new(outcome.agent_id.as_deref().unwrap_or("-")),
            Cell::new(detail),
        ]);
    }

    println!();
    println!(
        "  {} Workflow '{}' {} in {} ms",
        status_marker(result.status),
        style(workflow.name()).cyan(),
        result.status,
        duration_ms
    );
    if let Some(error) = &result.error {
        println!("  Error: {}", style(error).red());
    }
    println!("  Run: {}", style(result.run_id).dim());
    println!();
    if !result.steps.is_empty() {
        println!("{table}");
        println!();
    }
}

fn status_marker(status: WorkflowStatus) -> console::StyledObject<&'static str> {
    match status {
        WorkflowStatus::Completed => style("*").green().bold(),
        WorkflowStatus::Cancelled => style("*").yellow().bold(),
        _ => style("*").red().bold(),
    }
}

fn format_step_status(status: StepStatus) -> Cell {
    match status {
        StepStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        StepStatus::Running => Cell::new("running").fg(Color::Blue),
        StepStatus::Completed => Cell::new("completed").fg(Color::Green),
        StepStatus::Failed => Cell::new("failed").fg(Color::Red),
        StepStatus::Skipped => Cell::new("skipped").fg(Color::DarkYellow),
    }
}
