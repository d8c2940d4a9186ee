//! `agentflow validate`: parse a workflow file and check its step graph.

use std::path::Path;

use anyhow::Result;
use console::style;

use super::{Output, load_workflow};

pub fn handle_validate(file: &Path, output: Output) -> Result<()> {
    let workflow = load_workflow(file)?;
    let def = workflow.definition();

    if output.json {
        let out = serde_json::json!({
            "valid": true,
            "id": def.id,
            "name": def.name,
            "steps": def.steps.len(),
            "agents": def.agents.len(),
            "order": workflow.graph().topological_order(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    if output.quiet {
        return Ok(());
    }

    println!();
    println!(
        "  {} Workflow '{}' is valid",
        style("*").green().bold(),
        style(&def.name).cyan()
    );
    println!("  ID: {}", def.id);
    println!("  Steps: {}", def.steps.len());
    println!("  Agents: {}", def.agents.len());
    println!();
    Ok(())
}
