// FleetFlow Core
//
// Value types and contracts shared by the orchestration runtime.
//
// Key design decisions:
// - No behavior beyond validation and bookkeeping; loops live in fleetflow-engine
// - Task kinds are a closed enum plus Custom, each kind declaring required payload fields
// - Execution records enforce monotonic status and write-once-per-attempt results
// - One EventBus trait object is injected into every component that emits events
// - Durations serialize as milliseconds

pub mod agent;
pub mod error;
pub mod events;
pub mod execution;
pub mod health;
pub mod retry;
pub mod serde_util;
pub mod task;
pub mod telemetry;
pub mod workflow;

// Re-exports for convenience
pub use agent::{AgentConfig, AgentMetrics, AgentStatus, Capability};
pub use error::{codes, AgentError, OrchestratorError, OrchestratorResult};
pub use events::{
    BroadcastEventBus, Event, EventBus, NoopEventBus, Severity, SharedEventBus,
};
pub use execution::{ExecutionStatus, ScheduledExecution, StepExecution, WorkflowExecution};
pub use health::{CheckStatus, HealthCheck, HealthReport, HealthStatus, SystemHealth};
pub use retry::{BackoffType, RetryPolicy};
pub use task::{AgentTask, Payload, TaskContext, TaskKind, TaskPriority, TaskStatus};
pub use workflow::{
    ConditionOperator, LogicalOperator, StepCondition, StepType, TriggerConfig, TriggerType,
    WorkflowDefinition, WorkflowSettings, WorkflowStep,
};
