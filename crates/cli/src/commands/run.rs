// Workflow run command
//
// Builds a one-shot orchestrator around the manifest: demo agents are
// registered and started, the workflow executes once, and everything is torn
// down before the process exits. Ctrl-C cancels the execution.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fleetflow_core::{BroadcastEventBus, ExecutionStatus};
use fleetflow_engine::{AgentRegistry, OrchestratorConfig, WorkflowEngine, Worker};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::agents;
use crate::manifest::Manifest;
use crate::output::{print_execution, OutputFormat};

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    let Some(path) = path else {
        let config = OrchestratorConfig::from_env();
        config.validate()?;
        return Ok(config);
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    OrchestratorConfig::from_yaml_str(&text)
        .with_context(|| format!("Invalid config {}", path.display()))
}

fn parse_input(raw: &str) -> Result<Value> {
    let input: Value = serde_json::from_str(raw).context("--input is not valid JSON")?;
    if !input.is_object() {
        bail!("--input must be a JSON object");
    }
    Ok(input)
}

pub async fn run(
    path: &Path,
    config_path: Option<&Path>,
    raw_input: &str,
    timeout_secs: u64,
    output: OutputFormat,
    quiet: bool,
) -> Result<()> {
    let manifest = Manifest::load(path)?;
    manifest.validate()?;
    let input = parse_input(raw_input)?;
    let config = load_config(config_path)?;

    let events = BroadcastEventBus::shared();
    let registry = AgentRegistry::new(config.registry.clone(), events.clone());
    for spec in &manifest.agents {
        let worker = Worker::new(
            spec.config.clone(),
            config.worker.clone(),
            agents::build(spec.kind, &spec.options),
            events.clone(),
        );
        registry.register(worker, Map::new()).await?;
    }
    let report = registry.start_all().await;
    if let Some((id, err)) = report.failures.first() {
        registry.cleanup().await;
        bail!("Failed to start agent {id}: {err}");
    }
    registry.start_heartbeat_monitor();

    let engine = WorkflowEngine::builder(registry.clone())
        .config(config.engine.clone())
        .build();
    engine.start().await?;
    engine.register_workflow(manifest.workflow.clone()).await?;

    let id = engine.execute_workflow(&manifest.workflow.id, input).await?;
    info!(execution_id = %id, workflow_id = %manifest.workflow.id, "Workflow started");

    let timeout = Duration::from_secs(timeout_secs);
    let finished = tokio::select! {
        result = engine.wait_for_execution(id, timeout) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!(execution_id = %id, "Interrupted, cancelling execution");
            engine.cancel_workflow(id).await?;
            engine.wait_for_execution(id, Duration::from_secs(5)).await
        }
    };

    let execution = match finished {
        Ok(execution) => Some(execution),
        Err(err) => {
            warn!(execution_id = %id, error = %err, "Execution did not finish");
            engine.cancel_workflow(id).await.ok();
            engine.get_execution(id)
        }
    };

    engine.shutdown().await;
    let cleanup = registry.cleanup().await;
    for (agent_id, err) in &cleanup.failures {
        warn!(agent_id = %agent_id, error = %err, "Agent shutdown failed");
    }

    let Some(execution) = execution else {
        bail!("Execution {id} disappeared");
    };
    if output.is_text() {
        if quiet {
            println!("{}", execution.status);
        } else {
            print_execution(&execution);
        }
    } else {
        output.print_value(&execution)?;
    }

    if execution.status != ExecutionStatus::Completed {
        bail!("Execution {id} ended {}", execution.status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_must_be_an_object() {
        assert_eq!(parse_input(r#"{"topic": "rust"}"#).unwrap()["topic"], "rust");
        assert!(parse_input("[1, 2]").is_err());
        assert!(parse_input("{not json").is_err());
    }
}
