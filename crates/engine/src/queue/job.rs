//! Job options, handles and heap ordering

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use fleetflow_core::{AgentError, AgentTask, RetryPolicy, TaskPriority};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Result delivered to a job's handle
pub type JobResult = Result<Value, AgentError>;

/// Per-job overrides of the queue defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Overrides the task's own priority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,

    /// Total attempts, including the first (>= 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<RetryPolicy>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Total attempts including the first one
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts.max(1));
        self
    }

    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Run once, never retry
    pub fn single_attempt() -> Self {
        Self::default().with_attempts(1)
    }
}

/// Handle returned by `add_job`; resolves when the job completes or is dead-lettered
#[derive(Debug)]
pub struct JobHandle {
    task_id: Uuid,
    rx: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    pub(crate) fn new(task_id: Uuid, rx: oneshot::Receiver<JobResult>) -> Self {
        Self { task_id, rx }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Wait for the final outcome
    pub async fn wait(self) -> JobResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(AgentError::cancelled(format!(
                "task {} was dropped before completing",
                self.task_id
            ))),
        }
    }
}

/// A job that exhausted its attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    pub task: AgentTask,
    pub error: AgentError,
    pub failed_at: DateTime<Utc>,
}

/// Entry in the waiting heap
pub(crate) struct QueuedJob {
    pub priority: TaskPriority,
    pub seq: u64,
    pub task: AgentTask,
    pub max_attempts: u32,
    pub backoff: RetryPolicy,
    pub reply: oneshot::Sender<JobResult>,
}

// Max-heap: higher priority first, then lower sequence (FIFO within a priority)
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetflow_core::Payload;
    use std::collections::BinaryHeap;

    fn job(priority: TaskPriority, seq: u64) -> QueuedJob {
        let (tx, _rx) = oneshot::channel();
        QueuedJob {
            priority,
            seq,
            task: AgentTask::new("a", "echo", Payload::new()),
            max_attempts: 1,
            backoff: RetryPolicy::no_retry(),
            reply: tx,
        }
    }

    #[test]
    fn test_heap_orders_by_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        heap.push(job(TaskPriority::Normal, 1));
        heap.push(job(TaskPriority::Low, 2));
        heap.push(job(TaskPriority::Critical, 3));
        heap.push(job(TaskPriority::Normal, 4));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|j| j.seq)).collect();
        assert_eq!(order, vec![3, 1, 4, 2]);
    }

    #[tokio::test]
    async fn test_dropped_reply_resolves_as_cancelled() {
        let (tx, rx) = oneshot::channel::<JobResult>();
        let handle = JobHandle::new(Uuid::now_v7(), rx);
        drop(tx);
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.code, fleetflow_core::codes::CANCELLED);
    }
}
