// Workflow manifests
//
// One file declares the demo agents a run needs and the workflow to execute.
// YAML is the primary format; JSON parses through the same path.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use fleetflow_core::{AgentConfig, StepType, WorkflowDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agents::DemoKind;

/// One agent of a manifest: its runtime config plus which demo behavior backs it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    #[serde(flatten)]
    pub config: AgentConfig,

    pub kind: DemoKind,

    /// Behavior knobs read by the demo agent (e.g. `failures`, `duration_ms`)
    #[serde(default)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    pub workflow: WorkflowDefinition,
}

impl Manifest {
    pub fn from_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("Failed to parse manifest")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Self::from_str(&text).with_context(|| format!("Invalid manifest {}", path.display()))
    }

    /// Agent configs, the workflow graph, and every agent step's target
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for agent in &self.agents {
            agent.config.validate()?;
            if !ids.insert(agent.config.id.as_str()) {
                bail!("agent {} is declared twice", agent.config.id);
            }
        }

        self.workflow.validate()?;

        for step in &self.workflow.steps {
            if step.step_type != StepType::Agent {
                continue;
            }
            if let Some(agent_id) = step.agent_id.as_deref() {
                if !ids.contains(agent_id) {
                    bail!(
                        "step {} uses agent {agent_id}, which the manifest does not declare",
                        step.id
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBLISH: &str = r#"
agents:
  - id: writer
    name: Writer
    kind: echo
    max_concurrency: 2
  - id: publisher
    name: Publisher
    kind: flaky
    options:
      failures: 1
workflow:
  id: publish
  name: Publish a post
  steps:
    - id: draft
      type: agent
      agent_id: writer
      on_success: [publish]
    - id: publish
      type: agent
      agent_id: publisher
      retry_policy:
        max_attempts: 2
        initial_delay: 10
"#;

    #[test]
    fn test_parses_and_validates() {
        let manifest = Manifest::from_str(PUBLISH).unwrap();
        manifest.validate().unwrap();

        assert_eq!(manifest.agents.len(), 2);
        assert_eq!(manifest.agents[0].kind, DemoKind::Echo);
        assert_eq!(manifest.agents[0].config.max_concurrency, 2);
        assert_eq!(manifest.agents[1].options["failures"], 1);
        assert_eq!(manifest.workflow.steps.len(), 2);
    }

    #[test]
    fn test_bundled_manifest_is_valid() {
        let manifest = Manifest::from_str(include_str!("../manifests/publish.yaml")).unwrap();
        manifest.validate().unwrap();
        assert_eq!(manifest.agents[2].kind, DemoKind::Flaky);
    }

    #[test]
    fn test_json_manifest() {
        let manifest = Manifest::from_str(
            r#"{"agents": [{"id": "a", "name": "A", "kind": "sleep"}],
                "workflow": {"id": "w", "steps": [{"id": "s", "type": "agent", "agent_id": "a"}]}}"#,
        )
        .unwrap();
        manifest.validate().unwrap();
        assert_eq!(manifest.agents[0].kind, DemoKind::Sleep);
    }

    #[test]
    fn test_undeclared_agent_is_rejected() {
        let manifest = Manifest::from_str(
            "workflow:\n  id: w\n  steps:\n    - id: s\n      type: agent\n      agent_id: ghost\n",
        )
        .unwrap();
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_duplicate_agent_is_rejected() {
        let manifest = Manifest::from_str(
            r#"
agents:
  - {id: a, name: A, kind: echo}
  - {id: a, name: Again, kind: fail}
workflow:
  id: w
  steps:
    - {id: s, type: agent, agent_id: a}
"#,
        )
        .unwrap();
        assert!(manifest.validate().is_err());
    }
}
