// Output formatting for CLI

use anyhow::Result;
use fleetflow_core::WorkflowExecution;
use serde::Serialize;

#[derive(Clone, Copy)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }

    /// Pretty JSON in json mode; text is handled by each command
    pub fn print_value<T: Serialize>(&self, value: &T) -> Result<()> {
        if let OutputFormat::Json = self {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        Ok(())
    }

    pub fn is_text(&self) -> bool {
        matches!(self, OutputFormat::Text)
    }
}

/// Print a simple key-value pair for text output
pub fn print_field(label: &str, value: &str) {
    println!("{:<14} {}", format!("{}:", label), value);
}

fn joined(steps: &[String]) -> String {
    if steps.is_empty() {
        "-".to_string()
    } else {
        steps.join(", ")
    }
}

pub fn print_execution(execution: &WorkflowExecution) {
    print_field("Execution", &execution.id.to_string());
    print_field("Workflow", &execution.workflow_id);
    print_field("Status", &execution.status.to_string());
    print_field("Completed", &joined(&execution.completed_steps));
    print_field("Failed", &joined(&execution.failed_steps));
    print_field("Skipped", &joined(&execution.skipped_steps));
    print_field("Retries", &execution.retry_count.to_string());
    if let Some(error) = &execution.last_error {
        print_field("Error", &format!("[{}] {}", error.code, error.message));
    }
    for (step, result) in &execution.step_results {
        print_field(&format!("  {step}"), &result.to_string());
    }
}
