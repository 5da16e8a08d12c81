//! Inbound task submission
//!
//! Entry point for callers outside the workflow engine (an HTTP layer, a CLI,
//! another service). Tasks are routed to the named agent's queue and retried
//! according to that agent's retry settings. Synchronous callers await the
//! result with [`TaskSubmitter::submit_and_wait`]; everyone else polls
//! [`TaskSubmitter::get_task_status`].
//!
//! Routes live only as long as the queue keeps the task's record. A lookup
//! that misses drops its route, and submissions sweep the route table once it
//! doubles past the last sweep.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use fleetflow_core::{
    AgentError, AgentTask, OrchestratorError, Payload, TaskContext, TaskKind, TaskPriority,
};
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::queue::JobHandle;
use crate::registry::AgentRegistry;

pub struct TaskSubmitter {
    registry: Arc<AgentRegistry>,
    /// task id -> agent id, for status lookups
    routes: DashMap<Uuid, String>,
    /// Route count that triggers the next sweep
    sweep_at: AtomicUsize,
}

const MIN_SWEEP_AT: usize = 1_024;

impl TaskSubmitter {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            routes: DashMap::new(),
            sweep_at: AtomicUsize::new(MIN_SWEEP_AT),
        }
    }

    /// Number of task ids currently routable
    pub fn tracked_tasks(&self) -> usize {
        self.routes.len()
    }

    fn record(&self, task_id: &Uuid, agent_id: &str) -> Option<AgentTask> {
        self.registry.get(agent_id)?.task(task_id)
    }

    /// Drop routes whose task record is gone
    fn sweep(&self) {
        let before = self.routes.len();
        self.routes
            .retain(|task_id, agent_id| self.record(task_id, agent_id.as_str()).is_some());
        let after = self.routes.len();
        self.sweep_at
            .store(after.saturating_mul(2).max(MIN_SWEEP_AT), Ordering::Relaxed);
        debug!(before, after, "Swept task routes");
    }

    fn enqueue(
        &self,
        agent_id: &str,
        kind: TaskKind,
        payload: Payload,
        priority: TaskPriority,
        context: TaskContext,
    ) -> Result<JobHandle, AgentError> {
        let worker = self
            .registry
            .require(agent_id)
            .map_err(OrchestratorError::into_agent_error)?;
        let task = AgentTask::new(agent_id, kind, payload)
            .with_priority(priority)
            .with_context(context);
        let task_id = task.id;

        let handle = worker
            .submit(task)
            .map_err(|e| e.into_agent_error().with_source(task_id.to_string()))?;
        self.routes.insert(task_id, agent_id.to_string());
        if self.routes.len() >= self.sweep_at.load(Ordering::Relaxed) {
            self.sweep();
        }
        debug!(agent_id, task_id = %task_id, "Task submitted");
        Ok(handle)
    }

    /// Queue a task on `agent_id` and return its id
    #[instrument(skip(self, kind, payload, context))]
    pub fn submit_task(
        &self,
        agent_id: &str,
        kind: impl Into<TaskKind>,
        payload: Payload,
        priority: TaskPriority,
        context: TaskContext,
    ) -> Result<Uuid, AgentError> {
        self.enqueue(agent_id, kind.into(), payload, priority, context)
            .map(|handle| handle.task_id())
    }

    /// Queue a task and wait for its final result, retries included
    #[instrument(skip(self, kind, payload, context))]
    pub async fn submit_and_wait(
        &self,
        agent_id: &str,
        kind: impl Into<TaskKind>,
        payload: Payload,
        priority: TaskPriority,
        context: TaskContext,
    ) -> Result<Value, AgentError> {
        self.enqueue(agent_id, kind.into(), payload, priority, context)?
            .wait()
            .await
    }

    /// Latest record of a submitted task
    ///
    /// `None` for unknown ids, and for tasks whose agent has since been
    /// unregistered or whose record aged out of the queue.
    pub fn get_task_status(&self, task_id: Uuid) -> Option<AgentTask> {
        let agent_id = self.routes.get(&task_id)?.value().clone();
        let record = self.record(&task_id, &agent_id);
        if record.is_none() {
            self.routes.remove(&task_id);
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;
    use crate::worker::{FnAgent, Worker, WorkerConfig};
    use fleetflow_core::{codes, AgentConfig, BroadcastEventBus, TaskStatus};
    use serde_json::{json, Map};

    async fn registry_with_echo() -> Arc<AgentRegistry> {
        registry_keeping(1_000).await
    }

    async fn registry_keeping(keep_finished: usize) -> Arc<AgentRegistry> {
        let events = BroadcastEventBus::shared();
        let registry = AgentRegistry::new(RegistryConfig::default(), events.clone());
        let worker = Worker::new(
            AgentConfig::new("echo", "Echo"),
            WorkerConfig::default()
                .with_memory_threshold_mb(None)
                .with_keep_finished(keep_finished),
            FnAgent::new(|task: AgentTask| async move { Ok(Value::Object(task.payload)) }).shared(),
            events,
        );
        registry.register(worker, Map::new()).await.unwrap();
        registry.start_agent("echo").await.unwrap();
        registry
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let submitter = TaskSubmitter::new(registry_with_echo().await);
        let result = submitter
            .submit_and_wait(
                "echo",
                "echo",
                payload(json!({"n": 1})),
                TaskPriority::High,
                TaskContext::new().with_request_id("req-1"),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_status_polling() {
        let submitter = TaskSubmitter::new(registry_with_echo().await);
        let id = submitter
            .submit_task(
                "echo",
                "echo",
                payload(json!({"n": 2})),
                TaskPriority::Normal,
                TaskContext::new(),
            )
            .unwrap();

        let mut status = None;
        for _ in 0..100 {
            status = submitter.get_task_status(id).map(|t| t.status);
            if status == Some(TaskStatus::Completed) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(status, Some(TaskStatus::Completed));
        assert!(submitter.get_task_status(Uuid::now_v7()).is_none());
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let submitter = TaskSubmitter::new(registry_with_echo().await);
        let err = submitter
            .submit_task(
                "ghost",
                "echo",
                Payload::new(),
                TaskPriority::Normal,
                TaskContext::new(),
            )
            .unwrap_err();
        assert_eq!(err.code, codes::AGENT_NOT_FOUND);
        assert!(!err.retryable);
    }

    async fn submit_and_settle(submitter: &TaskSubmitter, n: u64) -> Uuid {
        let id = submitter
            .submit_task(
                "echo",
                "echo",
                payload(json!({"n": n})),
                TaskPriority::Normal,
                TaskContext::new(),
            )
            .unwrap();
        for _ in 0..100 {
            if submitter.get_task_status(id).map(|t| t.status) == Some(TaskStatus::Completed) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        id
    }

    #[tokio::test]
    async fn test_routes_follow_evicted_records() {
        let submitter = TaskSubmitter::new(registry_keeping(2).await);
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(submit_and_settle(&submitter, n).await);
        }

        assert!(submitter.get_task_status(ids[0]).is_none());
        assert!(submitter.get_task_status(ids[4]).is_some());

        submitter.sweep();
        assert_eq!(submitter.tracked_tasks(), 2);
    }

    #[tokio::test]
    async fn test_unregistered_agent_drops_routes() {
        let registry = registry_with_echo().await;
        let submitter = TaskSubmitter::new(registry.clone());
        let id = submit_and_settle(&submitter, 1).await;
        assert_eq!(submitter.tracked_tasks(), 1);

        registry.unregister("echo").await.unwrap();
        assert!(submitter.get_task_status(id).is_none());
        assert_eq!(submitter.tracked_tasks(), 0);
    }
}
