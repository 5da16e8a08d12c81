//! # FleetFlow Engine
//!
//! In-process orchestration runtime for long-lived agents and the workflows
//! that drive them.
//!
//! ## Features
//!
//! - **Agent registry**: one explicit instance per process, tag and capability
//!   indexes, heartbeat monitoring with recovery
//! - **Per-agent workers**: lifecycle state machine, bounded drain on stop,
//!   health reports with dependency and memory checks
//! - **Task queue**: priority heap, hard concurrency ceiling, retries with
//!   fixed/linear/exponential backoff, dead-letter set
//! - **Workflow engine**: step graphs with conditions, parallel fan-out,
//!   delays, webhooks, failure edges and retries under an admission ceiling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                          │
//! │  (admission control, step walking, pause/resume/cancel)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ agent steps
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      AgentRegistry                           │
//! │  (lookup by id/tag/capability, heartbeat monitor)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Worker ──▶ TaskQueue ──▶ Agent                 │
//! │  (lifecycle, heartbeat, retries, concurrency ceiling)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use fleetflow_engine::prelude::*;
//!
//! let events = BroadcastEventBus::shared();
//! let registry = AgentRegistry::new(RegistryConfig::default(), events.clone());
//!
//! let echo = FnAgent::new(|task| async move { Ok(Value::Object(task.payload)) }).shared();
//! let worker = Worker::new(AgentConfig::new("echo", "Echo"), WorkerConfig::default(), echo, events);
//! registry.register(worker, Map::new()).await?;
//! registry.start_all().await;
//!
//! let engine = WorkflowEngine::builder(registry.clone()).build();
//! engine.start().await?;
//! engine.register_workflow(definition).await?;
//! let id = engine.execute_workflow("greet", json!({"name": "ada"})).await?;
//! ```

pub mod config;
pub mod engine;
pub mod persistence;
pub mod queue;
pub mod registry;
pub mod submission;
pub mod ticker;
pub mod webhook;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::OrchestratorConfig;
    pub use crate::engine::{EngineConfig, EngineStats, WorkflowEngine, WorkflowEngineBuilder};
    pub use crate::persistence::{ExecutionStore, InMemoryExecutionStore, NoopStore, StoreError};
    pub use crate::queue::{JobHandle, JobOptions, QueueStats, TaskQueue, TaskQueueConfig};
    pub use crate::registry::{AgentQuery, AgentRegistry, BulkReport, RegistryConfig};
    pub use crate::submission::TaskSubmitter;
    pub use crate::ticker::Ticker;
    pub use crate::webhook::{HttpWebhookClient, WebhookClient, WebhookRequest};
    pub use crate::worker::{
        Agent, AgentContext, FnAgent, HealthReporter, Lifecycle, SharedAgent, TaskExecutor,
        Worker, WorkerConfig,
    };
    pub use fleetflow_core::{
        AgentConfig, AgentError, AgentStatus, AgentTask, BroadcastEventBus, Capability, Event,
        EventBus, ExecutionStatus, OrchestratorError, OrchestratorResult, RetryPolicy,
        SharedEventBus, StepCondition, TaskContext, TaskKind, TaskPriority, WorkflowDefinition,
        WorkflowExecution, WorkflowStep,
    };
}

// Re-export key types at crate root
pub use config::OrchestratorConfig;
pub use engine::{EngineConfig, EngineStats, WorkflowEngine};
pub use persistence::{ExecutionStore, InMemoryExecutionStore, NoopStore, StoreError};
pub use queue::{JobHandle, JobOptions, TaskQueue, TaskQueueConfig};
pub use registry::{AgentQuery, AgentRegistry, RegistryConfig};
pub use submission::TaskSubmitter;
pub use ticker::Ticker;
pub use webhook::{HttpWebhookClient, WebhookClient, WebhookRequest};
pub use worker::{FnAgent, SharedAgent, Worker, WorkerConfig};
