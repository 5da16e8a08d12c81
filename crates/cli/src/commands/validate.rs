// Manifest validation command

use std::path::Path;

use anyhow::Result;
use serde_json::json;

use crate::manifest::Manifest;
use crate::output::{print_field, OutputFormat};

pub fn run(path: &Path, output: OutputFormat, quiet: bool) -> Result<()> {
    let manifest = Manifest::load(path)?;
    manifest.validate()?;

    if output.is_text() {
        if !quiet {
            print_field("Workflow", &manifest.workflow.id);
            print_field("Steps", &manifest.workflow.steps.len().to_string());
            print_field("Agents", &manifest.agents.len().to_string());
        }
        println!("Manifest is valid");
        return Ok(());
    }
    output.print_value(&json!({
        "valid": true,
        "workflow_id": manifest.workflow.id,
        "steps": manifest.workflow.steps.len(),
        "agents": manifest
            .agents
            .iter()
            .map(|a| a.config.id.as_str())
            .collect::<Vec<_>>(),
    }))
}
