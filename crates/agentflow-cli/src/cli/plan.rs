//! `agentflow plan`: show the dependency levels of a workflow.
//!
//! Levels are static: every step in level N depends only on steps in earlier
//! levels. At run time a step starts as soon as its own dependencies finish,
//! so steps from different levels can overlap.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;

use agentflow_core::workflow::Workflow;
use agentflow_types::workflow::StepDefinition;

use super::{Output, load_workflow};

pub fn handle_plan(file: &Path, output: Output) -> Result<()> {
    let workflow = load_workflow(file)?;

    if output.json {
        println!("{}", serde_json::to_string_pretty(&plan_json(&workflow))?);
        return Ok(());
    }
    if output.quiet {
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Level").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Agents"),
            Cell::new("Depends on"),
        ]);

    let steps = step_lookup(&workflow);
    for (level, wave) in workflow.graph().execution_waves().iter().enumerate() {
        for step_id in wave {
            let agents = steps
                .get(step_id)
                .map(|s| s.agents.join(", "))
                .unwrap_or_default();
            table.add_row(vec![
                Cell::new(level + 1),
                Cell::new(step_id),
                Cell::new(if agents.is_empty() { "-".to_string() } else { agents }),
                Cell::new(workflow.graph().dependencies(step_id).join(", ")),
            ]);
        }
    }

    println!();
    println!("  Plan for workflow '{}'", style(workflow.name()).cyan());
    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn step_lookup(workflow: &Workflow) -> HashMap<&str, &StepDefinition> {
    workflow
        .definition()
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s))
        .collect()
}

/// Machine-readable plan: one entry per level, in order.
pub fn plan_json(workflow: &Workflow) -> Value {
    let levels: Vec<Value> = workflow
        .graph()
        .execution_waves()
        .iter()
        .enumerate()
        .map(|(i, wave)| serde_json::json!({ "level": i + 1, "steps": wave }))
        .collect();
    serde_json::json!({
        "workflow_id": workflow.id(),
        "levels": levels,
    })
}
