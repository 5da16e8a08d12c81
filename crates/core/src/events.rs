// Event Protocol
//
// Every lifecycle and task transition in the orchestrator emits an Event.
// Events follow a consistent structure: id, type, ts, severity, correlation
// fields and a free-form data payload.
//
// Events are published through an EventBus that is injected at construction
// time. Emission order matches the causal order of the transitions; delivery
// to slow subscribers is not guaranteed (lagging receivers drop events).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// Event Type Constants
// ============================================================================

pub mod types {
    // Agent lifecycle
    pub const AGENT_REGISTERED: &str = "agent.registered";
    pub const AGENT_UNREGISTERED: &str = "agent.unregistered";
    pub const AGENT_INITIALIZED: &str = "agent.initialized";
    pub const AGENT_STARTED: &str = "agent.started";
    pub const AGENT_PAUSED: &str = "agent.paused";
    pub const AGENT_RESUMED: &str = "agent.resumed";
    pub const AGENT_STOPPED: &str = "agent.stopped";
    pub const AGENT_SHUTDOWN: &str = "agent.shutdown";
    pub const AGENT_ERROR: &str = "agent.error";
    pub const AGENT_HEARTBEAT: &str = "agent.heartbeat";
    pub const AGENT_HEARTBEAT_TIMEOUT: &str = "agent.heartbeat_timeout";
    pub const AGENT_RECOVERED: &str = "agent.recovered";
    pub const AGENT_CONFIG_UPDATED: &str = "agent.config_updated";

    // Task lifecycle
    pub const TASK_QUEUED: &str = "task.queued";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_RETRYING: &str = "task.retrying";
    pub const TASK_DEAD: &str = "task.dead";

    // Workflow catalogue
    pub const WORKFLOW_REGISTERED: &str = "workflow.registered";

    // Execution lifecycle
    pub const EXECUTION_QUEUED: &str = "execution.queued";
    pub const EXECUTION_STARTED: &str = "execution.started";
    pub const EXECUTION_PAUSED: &str = "execution.paused";
    pub const EXECUTION_RESUMED: &str = "execution.resumed";
    pub const EXECUTION_CANCELLED: &str = "execution.cancelled";
    pub const EXECUTION_COMPLETED: &str = "execution.completed";
    pub const EXECUTION_FAILED: &str = "execution.failed";

    // Step lifecycle
    pub const STEP_STARTED: &str = "step.started";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const STEP_FAILED: &str = "step.failed";
    pub const STEP_SKIPPED: &str = "step.skipped";
    pub const STEP_RETRY_SCHEDULED: &str = "step.retry_scheduled";
}

// ============================================================================
// Severity
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Info
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Debug => write!(f, "debug"),
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

// ============================================================================
// Standard Event Schema
// ============================================================================

/// Structured orchestration event.
///
/// - `id`: UUID v7, monotonically increasing within a process
/// - `type`: dot notation (see [`types`])
/// - `agent_id` / `execution_id`: the emitting entity, when applicable
/// - `correlation_id`: request or execution correlation, propagated from task context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: Uuid,

    #[serde(rename = "type")]
    pub event_type: String,

    pub ts: DateTime<Utc>,

    #[serde(default)]
    pub severity: Severity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: event_type.into(),
            ts: Utc::now(),
            severity: Severity::Info,
            agent_id: None,
            execution_id: None,
            correlation_id: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_execution(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// Sink for orchestration events, shared by every component of one process
pub trait EventBus: Send + Sync {
    /// Publish an event. Never blocks and never fails the caller.
    fn publish(&self, event: Event);

    /// Subscribe to all events published after this call
    fn subscribe(&self) -> broadcast::Receiver<Event>;
}

/// Shared event bus handle
pub type SharedEventBus = Arc<dyn EventBus>;

/// True when both handles point at the same bus instance
pub fn same_bus(a: &SharedEventBus, b: &SharedEventBus) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Event bus backed by a tokio broadcast channel
pub struct BroadcastEventBus {
    sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Convenience constructor returning a shared handle
    pub fn shared() -> SharedEventBus {
        Arc::new(Self::default())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) {
        tracing::trace!(event_type = %event.event_type, event_id = %event.id, "Publishing event");
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

/// Event bus that drops everything
pub struct NoopEventBus {
    // Held so subscribe() can hand out receivers that never yield
    sender: broadcast::Sender<Event>,
}

impl NoopEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }
}

impl Default for NoopEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for NoopEventBus {
    fn publish(&self, _event: Event) {}

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_uses_type_key() {
        let event = Event::new(types::TASK_STARTED)
            .with_agent("writer")
            .with_correlation(Some("req-1".into()));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task.started");
        assert_eq!(json["agent_id"], "writer");
        assert_eq!(json["correlation_id"], "req-1");
        assert_eq!(json["severity"], "info");
        assert!(json.get("execution_id").is_none());
    }

    #[tokio::test]
    async fn test_broadcast_preserves_publish_order() {
        let bus = BroadcastEventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(Event::new(types::TASK_QUEUED));
        bus.publish(Event::new(types::TASK_STARTED));
        bus.publish(Event::new(types::TASK_COMPLETED));

        assert_eq!(rx.recv().await.unwrap().event_type, types::TASK_QUEUED);
        assert_eq!(rx.recv().await.unwrap().event_type, types::TASK_STARTED);
        assert_eq!(rx.recv().await.unwrap().event_type, types::TASK_COMPLETED);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = BroadcastEventBus::new(4);
        bus.publish(Event::new(types::AGENT_STARTED));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_same_bus() {
        let a = BroadcastEventBus::shared();
        let b = a.clone();
        let c = BroadcastEventBus::shared();
        assert!(same_bus(&a, &b));
        assert!(!same_bus(&a, &c));
    }
}
