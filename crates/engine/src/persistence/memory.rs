//! In-memory implementation of ExecutionStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use fleetflow_core::{ExecutionStatus, ScheduledExecution, WorkflowDefinition, WorkflowExecution};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::{ExecutionStore, StoreError};

/// In-memory implementation of ExecutionStore
///
/// Keeps the latest snapshot of every definition and execution, plus a list of
/// scheduled executions handed out once by `load_scheduled_executions`.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
    executions: RwLock<HashMap<Uuid, WorkflowExecution>>,
    history: RwLock<HashMap<Uuid, Vec<ExecutionStatus>>>,
    scheduled: RwLock<Vec<ScheduledExecution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an execution for the next `load_scheduled_executions` call
    pub fn schedule(&self, scheduled: ScheduledExecution) {
        self.scheduled.write().push(scheduled);
    }

    pub fn workflow(&self, id: &str) -> Option<WorkflowDefinition> {
        self.workflows.read().get(id).cloned()
    }

    pub fn execution(&self, id: &Uuid) -> Option<WorkflowExecution> {
        self.executions.read().get(id).cloned()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.read().len()
    }

    /// Statuses of every saved snapshot of an execution, in save order
    pub fn status_history(&self, id: &Uuid) -> Vec<ExecutionStatus> {
        self.history.read().get(id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn save_workflow_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), StoreError> {
        self.workflows
            .write()
            .insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn save_execution_state(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        self.history
            .write()
            .entry(execution.id)
            .or_default()
            .push(execution.status);
        self.executions
            .write()
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn load_scheduled_executions(&self) -> Result<Vec<ScheduledExecution>, StoreError> {
        Ok(std::mem::take(&mut *self.scheduled.write()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Map};

    #[tokio::test]
    async fn test_execution_snapshots_and_history() {
        let store = InMemoryExecutionStore::new();
        let mut execution = WorkflowExecution::new("wf", json!({}), &Map::new());

        store.save_execution_state(&execution).await.unwrap();
        execution.transition(ExecutionStatus::Running);
        store.save_execution_state(&execution).await.unwrap();

        assert_eq!(store.execution_count(), 1);
        assert_eq!(
            store.execution(&execution.id).unwrap().status,
            ExecutionStatus::Running
        );
        assert_eq!(
            store.status_history(&execution.id),
            vec![ExecutionStatus::Pending, ExecutionStatus::Running]
        );
    }

    #[tokio::test]
    async fn test_scheduled_executions_are_handed_out_once() {
        let store = InMemoryExecutionStore::new();
        store.schedule(ScheduledExecution {
            workflow_id: "wf".into(),
            input: json!({"x": 1}),
            scheduled_for: Utc::now(),
        });

        assert_eq!(store.load_scheduled_executions().await.unwrap().len(), 1);
        assert!(store.load_scheduled_executions().await.unwrap().is_empty());
    }
}
