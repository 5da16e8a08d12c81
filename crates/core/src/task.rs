// Agent tasks
//
// A task is one unit of work for exactly one agent. The task kind is a
// closed set of well-known kinds plus a `Custom` escape hatch; each kind
// declares the payload fields it requires so malformed tasks are rejected
// at the boundary instead of deep inside an agent.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{AgentError, OrchestratorError, OrchestratorResult};

/// Opaque task payload
pub type Payload = Map<String, Value>;

// ============================================================================
// TaskKind
// ============================================================================

/// Discriminator for task payloads
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskKind {
    /// Content generation (requires `prompt`)
    Generate,
    /// Publishing to an external channel (requires `content` and `channel`)
    Publish,
    /// Read-only lookup (requires `query`)
    Lookup,
    /// Third-party integration call (requires `operation`)
    Integration,
    /// Any other kind; payload is not inspected
    Custom(String),
}

impl TaskKind {
    pub fn as_str(&self) -> &str {
        match self {
            TaskKind::Generate => "generate",
            TaskKind::Publish => "publish",
            TaskKind::Lookup => "lookup",
            TaskKind::Integration => "integration",
            TaskKind::Custom(name) => name.as_str(),
        }
    }

    /// Payload fields this kind requires
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            TaskKind::Generate => &["prompt"],
            TaskKind::Publish => &["content", "channel"],
            TaskKind::Lookup => &["query"],
            TaskKind::Integration => &["operation"],
            TaskKind::Custom(_) => &[],
        }
    }

    /// Check the payload against this kind's requirements
    pub fn validate_payload(&self, payload: &Payload) -> OrchestratorResult<()> {
        let missing: Vec<&str> = self
            .required_fields()
            .iter()
            .copied()
            .filter(|field| payload.get(*field).map_or(true, Value::is_null))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::validation(format!(
                "task type {} is missing payload fields: {}",
                self,
                missing.join(", ")
            )))
        }
    }
}

impl From<String> for TaskKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "generate" => TaskKind::Generate,
            "publish" => TaskKind::Publish,
            "lookup" => TaskKind::Lookup,
            "integration" => TaskKind::Integration,
            _ => TaskKind::Custom(value),
        }
    }
}

impl From<&str> for TaskKind {
    fn from(value: &str) -> Self {
        TaskKind::from(value.to_string())
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl FromStr for TaskKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TaskKind::from(s))
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Status and priority
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Failed, waiting for a backoff delay before the next attempt
    Retry,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Completed) | (Running, Failed) | (Running, Retry) | (Running, Cancelled) => {
                true
            }
            (Retry, Running) | (Retry, Cancelled) | (Retry, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::Retry => write!(f, "retry"),
        }
    }
}

/// Scheduling priority; higher runs first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Normal => write!(f, "normal"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// Correlation data carried with a task
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Where the task came from ("api", "workflow", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, Value>,
}

impl TaskContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: Value) -> Self {
        self.custom.insert(key.into(), value);
        self
    }
}

// ============================================================================
// AgentTask
// ============================================================================

/// One unit of work owned by exactly one agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentTask {
    pub id: Uuid,

    /// Owning agent
    pub agent_id: String,

    #[serde(rename = "type")]
    pub kind: TaskKind,

    pub status: TaskStatus,

    #[serde(default)]
    pub priority: TaskPriority,

    #[serde(default)]
    pub payload: Payload,

    #[serde(default)]
    pub context: TaskContext,

    /// Attempts started so far
    #[serde(default)]
    pub attempts: u32,

    /// Total attempts allowed (set by the queue when the task is enqueued)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AgentError>,
}

fn default_max_attempts() -> u32 {
    1
}

impl AgentTask {
    pub fn new(agent_id: impl Into<String>, kind: impl Into<TaskKind>, payload: Payload) -> Self {
        Self {
            id: Uuid::now_v7(),
            agent_id: agent_id.into(),
            kind: kind.into(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            payload,
            context: TaskContext::default(),
            attempts: 0,
            max_attempts: default_max_attempts(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = context;
        self
    }

    /// Structural checks: owner present, payload satisfies the kind
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.agent_id.trim().is_empty() {
            return Err(OrchestratorError::validation("task agent_id is empty"));
        }
        if let TaskKind::Custom(name) = &self.kind {
            if name.trim().is_empty() {
                return Err(OrchestratorError::validation("task type is empty"));
            }
        }
        self.kind.validate_payload(&self.payload)
    }

    /// Move to `next` if the transition is legal; returns whether it happened
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        match next {
            TaskStatus::Running => {
                self.started_at = Some(now);
            }
            s if s.is_terminal() => {
                self.completed_at = Some(now);
            }
            _ => {}
        }
        self.status = next;
        true
    }

    /// Duration between start and completion, if both are known
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_kind_round_trip_through_strings() {
        assert_eq!(TaskKind::from("generate"), TaskKind::Generate);
        assert_eq!(TaskKind::from("echo"), TaskKind::Custom("echo".into()));
        assert_eq!(String::from(TaskKind::Publish), "publish");

        let json = serde_json::to_value(TaskKind::Lookup).unwrap();
        assert_eq!(json, json!("lookup"));
    }

    #[test]
    fn test_kind_requires_payload_fields() {
        let err = TaskKind::Publish
            .validate_payload(&payload(json!({"content": "hi"})))
            .unwrap_err();
        assert!(err.to_string().contains("channel"));

        assert!(TaskKind::Publish
            .validate_payload(&payload(json!({"content": "hi", "channel": "blog"})))
            .is_ok());
        assert!(TaskKind::Custom("anything".into())
            .validate_payload(&Payload::new())
            .is_ok());
    }

    #[test]
    fn test_null_field_counts_as_missing() {
        let err = TaskKind::Generate
            .validate_payload(&payload(json!({"prompt": null})))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn test_task_validate_rejects_empty_agent() {
        let task = AgentTask::new("", "echo", Payload::new());
        assert!(task.validate().is_err());
    }

    #[test]
    fn test_status_transitions() {
        let mut task = AgentTask::new("writer", "echo", Payload::new());
        assert!(!task.transition(TaskStatus::Completed));
        assert!(task.transition(TaskStatus::Running));
        assert!(task.started_at.is_some());
        assert!(task.transition(TaskStatus::Retry));
        assert!(task.transition(TaskStatus::Running));
        assert!(task.transition(TaskStatus::Completed));
        assert!(task.completed_at.is_some());
        assert!(!task.transition(TaskStatus::Running));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }
}
