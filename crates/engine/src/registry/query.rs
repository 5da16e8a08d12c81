//! Agent lookup criteria

use fleetflow_core::AgentStatus;
use serde::{Deserialize, Serialize};

use crate::worker::Worker;

/// Criteria for [`super::AgentRegistry::find_agents`]; all set criteria must match
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentQuery {
    /// Case-insensitive substring of the agent name
    pub name_contains: Option<String>,
    pub status: Option<AgentStatus>,
    /// Every tag must be present
    pub tags: Vec<String>,
    /// Every capability must be declared
    pub capabilities: Vec<String>,
    pub enabled: Option<bool>,
}

impl AgentQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name_contains(mut self, needle: impl Into<String>) -> Self {
        self.name_contains = Some(needle.into());
        self
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Criteria not served by the tag/capability indexes
    pub(crate) fn matches(&self, worker: &Worker) -> bool {
        let config = worker.config();

        if let Some(needle) = &self.name_contains {
            if !config.name.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if worker.status() != status {
                return false;
            }
        }
        if let Some(enabled) = self.enabled {
            if config.enabled != enabled {
                return false;
            }
        }
        self.tags.iter().all(|t| config.has_tag(t))
            && self.capabilities.iter().all(|c| config.has_capability(c))
    }
}
