// Agent configuration, status and metrics

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::retry::RetryPolicy;
use crate::serde_util::duration_millis;
use crate::task::TaskPriority;

/// A named, versioned unit of functionality an agent supports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Declared input contract (JSON Schema or free-form)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub input_schema: serde_json::Value,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub output_schema: serde_json::Value,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: None,
            input_schema: serde_json::Value::Null,
            output_schema: serde_json::Value::Null,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Identity and runtime limits of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Simultaneously executing tasks
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Retries for a failed, retryable task
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_delay", with = "duration_millis")]
    pub retry_delay: Duration,

    /// Per-task execution timeout
    #[serde(default = "default_timeout", with = "duration_millis")]
    pub timeout: Duration,

    #[serde(default)]
    pub priority: TaskPriority,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub capabilities: Vec<Capability>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_max_concurrency() -> usize {
    1
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_enabled() -> bool {
    true
}

impl AgentConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            description: None,
            max_concurrency: default_max_concurrency(),
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
            timeout: default_timeout(),
            priority: TaskPriority::Normal,
            tags: vec![],
            capabilities: vec![],
            enabled: true,
        }
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }

    /// Backoff used by the agent's task queue between attempts
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential()
            .with_max_attempts(self.retry_attempts)
            .with_initial_delay(self.retry_delay)
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.id.trim().is_empty() {
            return Err(OrchestratorError::validation("agent id is empty"));
        }
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::validation(format!(
                "agent {} has an empty name",
                self.id
            )));
        }
        if self.max_concurrency == 0 {
            return Err(OrchestratorError::validation(format!(
                "agent {} max_concurrency must be at least 1",
                self.id
            )));
        }
        if self.timeout.is_zero() {
            return Err(OrchestratorError::validation(format!(
                "agent {} timeout must be positive",
                self.id
            )));
        }
        Ok(())
    }
}

/// Lifecycle state of an agent runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
    Error,
}

impl AgentStatus {
    /// Whether the agent is started and emitting heartbeats
    pub fn is_active(&self) -> bool {
        matches!(self, AgentStatus::Running | AgentStatus::Paused)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Running => write!(f, "running"),
            AgentStatus::Paused => write!(f, "paused"),
            AgentStatus::Stopped => write!(f, "stopped"),
            AgentStatus::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of an agent's task counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_id: String,
    pub status: AgentStatus,
    pub tasks_processed: u64,
    pub tasks_successful: u64,
    pub tasks_failed: u64,
    pub total_duration_ms: u64,
    pub average_duration_ms: f64,
    pub queue_waiting: usize,
    pub queue_active: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Values reported by the concrete agent
    #[serde(default)]
    pub custom: HashMap<String, f64>,
}

impl AgentMetrics {
    /// Fraction of processed tasks that succeeded (1.0 when nothing ran)
    pub fn success_rate(&self) -> f64 {
        if self.tasks_processed == 0 {
            1.0
        } else {
            self.tasks_successful as f64 / self.tasks_processed as f64
        }
    }
}
