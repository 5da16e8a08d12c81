//! Contracts a concrete agent implements
//!
//! An agent is composed from three small interfaces rather than a base class:
//! [`Lifecycle`] hooks, the [`TaskExecutor`] capability contract and a
//! [`HealthReporter`]. Anything implementing all three is an [`Agent`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use fleetflow_core::{
    AgentError, AgentTask, HealthCheck, OrchestratorResult, SharedEventBus, TaskKind,
};
use serde_json::Value;

/// What an agent receives when it is initialized
#[derive(Clone)]
pub struct AgentContext {
    pub agent_id: String,
    pub events: SharedEventBus,
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("agent_id", &self.agent_id)
            .finish()
    }
}

/// Lifecycle hooks, all optional
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Wire dependencies; a failure leaves the worker in `Error`
    async fn on_initialize(&self, _ctx: &AgentContext) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_start(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Capability contract
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Whether this agent handles the task's kind
    fn can_handle(&self, task: &AgentTask) -> bool;

    /// Payload check beyond the kind's required fields
    fn validate_payload(&self, task: &AgentTask) -> OrchestratorResult<()> {
        task.kind.validate_payload(&task.payload)
    }

    /// Type-specific work. The queue or engine retries failures under its
    /// policy; the `retryable` flag is advisory for callers.
    async fn execute(&self, task: &AgentTask) -> Result<Value, AgentError>;

    /// Extra numeric metrics merged into [`fleetflow_core::AgentMetrics::custom`]
    fn custom_metrics(&self) -> HashMap<String, f64> {
        HashMap::new()
    }
}

#[async_trait]
pub trait HealthReporter: Send + Sync {
    /// Checks of external dependencies (APIs, credentials, ...)
    async fn dependency_checks(&self) -> Vec<HealthCheck> {
        Vec::new()
    }
}

/// A concrete agent
pub trait Agent: Lifecycle + TaskExecutor + HealthReporter {}

impl<T> Agent for T where T: Lifecycle + TaskExecutor + HealthReporter {}

pub type SharedAgent = Arc<dyn Agent>;

// ============================================================================
// Closure-backed agent
// ============================================================================

/// Agent whose `execute` is a closure
///
/// # Example
///
/// ```ignore
/// let echo = FnAgent::new(|task| async move { Ok(Value::Object(task.payload)) })
///     .handling("echo");
/// ```
pub struct FnAgent<F> {
    kinds: Vec<TaskKind>,
    handler: F,
}

impl<F, Fut> FnAgent<F>
where
    F: Fn(AgentTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, AgentError>> + Send + 'static,
{
    /// Handles every kind until [`FnAgent::handling`] narrows it
    pub fn new(handler: F) -> Self {
        Self {
            kinds: Vec::new(),
            handler,
        }
    }

    pub fn handling(mut self, kind: impl Into<TaskKind>) -> Self {
        self.kinds.push(kind.into());
        self
    }

    pub fn shared(self) -> SharedAgent {
        Arc::new(self)
    }
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnAgent<F>
where
    F: Fn(AgentTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, AgentError>> + Send + 'static,
{
    fn can_handle(&self, task: &AgentTask) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&task.kind)
    }

    async fn execute(&self, task: &AgentTask) -> Result<Value, AgentError> {
        (self.handler)(task.clone()).await
    }
}

impl<F: Send + Sync> Lifecycle for FnAgent<F> {}

impl<F: Send + Sync> HealthReporter for FnAgent<F> {}
