//! ExecutionStore trait definition

use async_trait::async_trait;
use fleetflow_core::{
    OrchestratorError, ScheduledExecution, WorkflowDefinition, WorkflowExecution,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend unavailable or rejected the write
    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        OrchestratorError::Store(err.to_string())
    }
}

/// Persistence collaborator called at execution lifecycle points
///
/// The engine keeps all state in memory and works unchanged with [`NoopStore`];
/// write failures are logged, never fatal to an execution.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Called when a workflow definition is registered
    async fn save_workflow_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), StoreError>;

    /// Called when an execution is created, changes status or finishes
    async fn save_execution_state(&self, execution: &WorkflowExecution) -> Result<(), StoreError>;

    /// Called once on engine start
    async fn load_scheduled_executions(&self) -> Result<Vec<ScheduledExecution>, StoreError>;
}

/// Store that persists nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

#[async_trait]
impl ExecutionStore for NoopStore {
    async fn save_workflow_definition(
        &self,
        _definition: &WorkflowDefinition,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn save_execution_state(
        &self,
        _execution: &WorkflowExecution,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load_scheduled_executions(&self) -> Result<Vec<ScheduledExecution>, StoreError> {
        Ok(Vec::new())
    }
}
