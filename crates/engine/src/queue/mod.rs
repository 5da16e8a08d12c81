//! Bounded, prioritized task queue
//!
//! One queue feeds one worker. Jobs wait in a priority heap, are pulled by a
//! single processing loop and run on spawned tasks, at most `max_concurrency`
//! at a time (semaphore permits). Failures are re-queued after the job's
//! backoff delay until attempts are exhausted, then land in the failed set.
//! Permanent failures ([`AgentError::is_permanent`]) skip straight there.
//!
//! ```text
//!  add_job ──▶ waiting (heap) ──▶ active (≤ max_concurrency) ──▶ completed
//!                  ▲                     │
//!                  └──── delayed ◀───────┤ attempts left
//!                                        └──▶ failed set
//! ```

mod job;

pub use job::{FailedJob, JobHandle, JobOptions, JobResult};

use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetflow_core::events::{types, Event, Severity, SharedEventBus};
use fleetflow_core::{
    AgentError, AgentTask, OrchestratorError, OrchestratorResult, RetryPolicy, TaskStatus,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use fleetflow_core::serde_util::duration_millis;
use job::QueuedJob;

/// Function the processing loop runs for every job attempt
pub type JobProcessor = Arc<dyn Fn(AgentTask) -> BoxFuture<'static, JobResult> + Send + Sync>;

/// Task queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueConfig {
    /// Queue name (the owning agent id)
    pub name: String,

    /// Maximum waiting + delayed jobs
    pub max_size: usize,

    /// Hard ceiling on simultaneously executing jobs
    pub max_concurrency: usize,

    /// Total attempts per job unless overridden
    pub default_attempts: u32,

    /// Backoff between attempts unless overridden
    pub backoff: RetryPolicy,

    /// Finished task records kept for status queries
    pub keep_finished: usize,

    /// Grace period for in-flight jobs when the queue shuts down
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_size: 10_000,
            max_concurrency: 1,
            default_attempts: 1,
            backoff: RetryPolicy::exponential(),
            keep_finished: 1_000,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl TaskQueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_max_size(mut self, max: usize) -> Self {
        self.max_size = max.max(1);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_default_attempts(mut self, attempts: u32) -> Self {
        self.default_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_keep_finished(mut self, keep: usize) -> Self {
        self.keep_finished = keep;
        self
    }
}

/// Point-in-time counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub name: String,
    pub waiting: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub delayed: usize,
    pub paused: bool,
}

/// Bounded, prioritized job queue with retry
///
/// # Example
///
/// ```ignore
/// let queue = TaskQueue::new(TaskQueueConfig::new("writer").with_max_concurrency(4), bus);
/// queue.start(Arc::new(|task| Box::pin(async move { Ok(json!({"echo": task.payload})) })));
///
/// let handle = queue.add_job(task, JobOptions::default())?;
/// let result = handle.wait().await?;
/// ```
pub struct TaskQueue {
    config: TaskQueueConfig,
    events: SharedEventBus,
    waiting: Mutex<BinaryHeap<QueuedJob>>,
    records: dashmap::DashMap<Uuid, AgentTask>,
    finished: Mutex<VecDeque<Uuid>>,
    failed_jobs: Mutex<VecDeque<FailedJob>>,
    active: AtomicUsize,
    delayed: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    seq: AtomicU64,
    paused: AtomicBool,
    permits: Arc<Semaphore>,
    concurrency: AtomicUsize,
    wake: Notify,
    settled: Notify,
    shutdown: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(config: TaskQueueConfig, events: SharedEventBus) -> Arc<Self> {
        let max_concurrency = config.max_concurrency.max(1);
        Arc::new(Self {
            config,
            events,
            waiting: Mutex::new(BinaryHeap::new()),
            records: dashmap::DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            failed_jobs: Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
            delayed: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            permits: Arc::new(Semaphore::new(max_concurrency)),
            concurrency: AtomicUsize::new(max_concurrency),
            wake: Notify::new(),
            settled: Notify::new(),
            shutdown: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    /// Enqueue a task; the handle resolves with the final outcome
    #[instrument(skip(self, task, options), fields(queue = %self.config.name, task_id = %task.id))]
    pub fn add_job(&self, mut task: AgentTask, options: JobOptions) -> OrchestratorResult<JobHandle> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::invalid_state(format!(
                "queue {} is shut down",
                self.config.name
            )));
        }

        let pending = self.waiting.lock().len() + self.delayed.load(Ordering::SeqCst);
        if pending >= self.config.max_size {
            return Err(OrchestratorError::QueueFull {
                queue: self.config.name.clone(),
                max_size: self.config.max_size,
            });
        }

        let priority = options.priority.unwrap_or(task.priority);
        let max_attempts = options
            .attempts
            .unwrap_or(self.config.default_attempts)
            .max(1);
        let backoff = options.backoff.unwrap_or_else(|| self.config.backoff.clone());

        task.priority = priority;
        task.max_attempts = max_attempts;
        task.status = TaskStatus::Pending;

        let (tx, rx) = oneshot::channel();
        let task_id = task.id;
        let correlation = task.context.correlation_id.clone();
        self.records.insert(task_id, task.clone());

        {
            let mut heap = self.waiting.lock();
            heap.push(QueuedJob {
                priority,
                seq: self.seq.fetch_add(1, Ordering::SeqCst),
                task,
                max_attempts,
                backoff,
                reply: tx,
            });
        }

        debug!(priority = %priority, max_attempts, "Job queued");
        self.events.publish(
            Event::new(types::TASK_QUEUED)
                .with_agent(self.config.name.clone())
                .with_correlation(correlation)
                .with_severity(Severity::Debug)
                .with_data(serde_json::json!({"task_id": task_id, "priority": priority})),
        );
        self.wake.notify_one();

        Ok(JobHandle::new(task_id, rx))
    }

    /// Start the processing loop; a second call is ignored
    pub fn start(self: &Arc<Self>, processor: JobProcessor) {
        let mut slot = self.loop_handle.lock();
        if slot.is_some() {
            warn!(queue = %self.config.name, "Queue processing loop already started");
            return;
        }
        info!(
            queue = %self.config.name,
            max_concurrency = self.concurrency.load(Ordering::SeqCst),
            "Starting queue processing loop"
        );
        let queue = Arc::clone(self);
        *slot = Some(tokio::spawn(queue.process_loop(processor)));
    }

    pub fn is_started(&self) -> bool {
        self.loop_handle.lock().is_some()
    }

    /// Stop pulling new jobs; in-flight jobs keep running
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            debug!(queue = %self.config.name, "Queue paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            debug!(queue = %self.config.name, "Queue resumed");
        }
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Change the concurrency ceiling; reductions apply as permits come back
    pub fn set_max_concurrency(&self, max: usize) {
        let max = max.max(1);
        let old = self.concurrency.swap(max, Ordering::SeqCst);
        if max > old {
            self.permits.add_permits(max - old);
            self.wake.notify_one();
        } else if max < old {
            let forgotten = self.permits.forget_permits(old - max);
            if forgotten < old - max {
                debug!(
                    queue = %self.config.name,
                    pending_reduction = old - max - forgotten,
                    "Concurrency reduction waits for in-flight jobs"
                );
                let permits = Arc::clone(&self.permits);
                let remaining = (old - max - forgotten) as u32;
                tokio::spawn(async move {
                    if let Ok(permit) = permits.acquire_many_owned(remaining).await {
                        permit.forget();
                    }
                });
            }
        }
    }

    fn is_idle(&self) -> bool {
        let heap = self.waiting.lock();
        heap.is_empty()
            && self.active.load(Ordering::SeqCst) == 0
            && self.delayed.load(Ordering::SeqCst) == 0
    }

    /// Wait until nothing is waiting, delayed or active
    ///
    /// Does not return while the queue is paused with jobs waiting.
    pub async fn drain(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Wait for in-flight jobs to finish; false if `timeout` elapsed first
    pub async fn wait_for_active(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.settled.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.active.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            name: self.config.name.clone(),
            waiting: self.waiting.lock().len(),
            active: self.active.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            delayed: self.delayed.load(Ordering::SeqCst),
            paused: self.is_paused(),
        }
    }

    /// Latest record of a task still known to the queue
    pub fn task(&self, task_id: &Uuid) -> Option<AgentTask> {
        self.records.get(task_id).map(|r| r.value().clone())
    }

    /// Jobs that exhausted their attempts, oldest first
    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        self.failed_jobs.lock().iter().cloned().collect()
    }

    /// Stop the loop and cancel waiting and delayed jobs
    ///
    /// In-flight jobs get `shutdown_timeout` to finish.
    #[instrument(skip(self), fields(queue = %self.config.name))]
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let drained: Vec<QueuedJob> = {
            let mut heap = self.waiting.lock();
            heap.drain().collect()
        };
        let cancelled = drained.len();
        for job in drained {
            self.cancel_job(job, "queue shut down");
        }

        if !self.wait_for_active(self.config.shutdown_timeout).await {
            warn!(
                remaining = self.active.load(Ordering::SeqCst),
                "Queue shutdown timeout reached with jobs still running"
            );
        }

        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.settled.notify_waiters();
        info!(cancelled, "Queue shut down");
    }

    fn cancel_job(&self, mut job: QueuedJob, reason: &str) {
        job.task.transition(TaskStatus::Cancelled);
        let error = AgentError::cancelled(format!("task {} cancelled: {reason}", job.task.id))
            .with_source(job.task.id.to_string());
        job.task.error = Some(error.clone());
        let task_id = job.task.id;
        self.records.insert(task_id, job.task);
        self.mark_finished(task_id);
        let _ = job.reply.send(Err(error));
    }

    fn mark_finished(&self, task_id: Uuid) {
        let mut finished = self.finished.lock();
        finished.push_back(task_id);
        while finished.len() > self.config.keep_finished {
            if let Some(old) = finished.pop_front() {
                self.records.remove(&old);
            }
        }
    }

    async fn process_loop(self: Arc<Self>, processor: JobProcessor) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let notified = self.wake.notified();
            let idle = self.is_paused() || self.waiting.lock().is_empty();
            if idle {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = notified => continue,
                }
            }

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Pop and count as active under one lock so drain() never sees a gap
            let job = if self.is_paused() {
                None
            } else {
                let mut heap = self.waiting.lock();
                let job = heap.pop();
                if job.is_some() {
                    self.active.fetch_add(1, Ordering::SeqCst);
                }
                job
            };

            let Some(job) = job else {
                drop(permit);
                continue;
            };

            let queue = Arc::clone(&self);
            let processor = Arc::clone(&processor);
            tokio::spawn(async move {
                queue.run_job(job, processor).await;
                drop(permit);
            });
        }
        debug!(queue = %self.config.name, "Queue processing loop exited");
    }

    async fn run_job(self: Arc<Self>, mut job: QueuedJob, processor: JobProcessor) {
        job.task.transition(TaskStatus::Running);
        job.task.attempts += 1;
        let task_id = job.task.id;
        self.records.insert(task_id, job.task.clone());

        let outcome = processor(job.task.clone()).await;

        match outcome {
            Ok(value) => {
                job.task.transition(TaskStatus::Completed);
                job.task.result = Some(value.clone());
                job.task.error = None;
                self.records.insert(task_id, job.task);
                self.completed.fetch_add(1, Ordering::SeqCst);
                self.mark_finished(task_id);
                let _ = job.reply.send(Ok(value));
            }
            Err(error)
                if !error.is_permanent()
                    && job.task.attempts < job.max_attempts
                    && !self.shutdown.is_cancelled() =>
            {
                let delay = job.backoff.delay_for_attempt(job.task.attempts - 1);
                job.task.transition(TaskStatus::Retry);
                job.task.error = Some(error.clone());
                self.records.insert(task_id, job.task.clone());

                debug!(
                    queue = %self.config.name,
                    task_id = %task_id,
                    attempt = job.task.attempts,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Job failed, retry scheduled"
                );
                self.events.publish(
                    Event::new(types::TASK_RETRYING)
                        .with_agent(self.config.name.clone())
                        .with_correlation(job.task.context.correlation_id.clone())
                        .with_severity(Severity::Warning)
                        .with_data(serde_json::json!({
                            "task_id": task_id,
                            "attempt": job.task.attempts,
                            "delay_ms": delay.as_millis() as u64,
                            "error": error,
                        })),
                );

                // Counted as delayed before leaving active so drain() never sees a gap
                self.delayed.fetch_add(1, Ordering::SeqCst);
                let queue = Arc::clone(&self);
                tokio::spawn(queue.requeue_after(job, delay));
            }
            Err(error) => {
                job.task.transition(TaskStatus::Failed);
                job.task.error = Some(error.clone());
                self.records.insert(task_id, job.task.clone());
                self.failed.fetch_add(1, Ordering::SeqCst);

                warn!(
                    queue = %self.config.name,
                    task_id = %task_id,
                    attempts = job.task.attempts,
                    error = %error,
                    "Job failed permanently"
                );
                self.events.publish(
                    Event::new(types::TASK_DEAD)
                        .with_agent(self.config.name.clone())
                        .with_correlation(job.task.context.correlation_id.clone())
                        .with_severity(Severity::Error)
                        .with_data(serde_json::json!({
                            "task_id": task_id,
                            "attempts": job.task.attempts,
                            "error": error,
                        })),
                );

                {
                    let mut failed = self.failed_jobs.lock();
                    failed.push_back(FailedJob {
                        task: job.task.clone(),
                        error: error.clone(),
                        failed_at: Utc::now(),
                    });
                    while failed.len() > self.config.keep_finished.max(1) {
                        failed.pop_front();
                    }
                }
                self.mark_finished(task_id);
                let _ = job.reply.send(Err(error));
            }
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.settled.notify_waiters();
        self.wake.notify_one();
    }

    async fn requeue_after(self: Arc<Self>, mut job: QueuedJob, delay: Duration) {
        let cancelled = tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        };

        if cancelled {
            self.cancel_job(job, "queue shut down during backoff");
        } else {
            job.task.transition(TaskStatus::Pending);
            self.records.insert(job.task.id, job.task.clone());
            job.seq = self.seq.fetch_add(1, Ordering::SeqCst);
            self.waiting.lock().push(job);
        }

        self.delayed.fetch_sub(1, Ordering::SeqCst);
        self.settled.notify_waiters();
        self.wake.notify_one();
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.config.name)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetflow_core::{codes, BroadcastEventBus, Payload, TaskPriority};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn task(kind: &str) -> AgentTask {
        AgentTask::new("worker", kind, Payload::new())
    }

    fn echo_processor() -> JobProcessor {
        Arc::new(|task: AgentTask| -> BoxFuture<'static, JobResult> {
            Box::pin(async move { Ok(json!({"kind": task.kind.to_string()})) })
        })
    }

    fn queue(config: TaskQueueConfig) -> Arc<TaskQueue> {
        TaskQueue::new(config, BroadcastEventBus::shared())
    }

    #[tokio::test]
    async fn test_job_completes_and_record_is_kept() {
        let q = queue(TaskQueueConfig::new("echo"));
        q.start(echo_processor());

        let handle = q.add_job(task("echo"), JobOptions::default()).unwrap();
        let id = handle.task_id();
        let value = handle.wait().await.unwrap();

        assert_eq!(value, json!({"kind": "echo"}));
        let record = q.task(&id).unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.attempts, 1);
        assert_eq!(q.stats().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_is_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let processor: JobProcessor = Arc::new(move |_task| {
            let counter = counter.clone();
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AgentError::retryable("flaky"))
                } else {
                    Ok(json!("ok"))
                }
            })
        });

        let q = queue(
            TaskQueueConfig::new("flaky")
                .with_default_attempts(5)
                .with_backoff(RetryPolicy::fixed(Duration::from_millis(100), 5)),
        );
        q.start(processor);

        let value = q
            .add_job(task("flaky"), JobOptions::default())
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(value, json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(q.failed_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_job_lands_in_failed_set() {
        let bus = BroadcastEventBus::shared();
        let mut events = bus.subscribe();
        let processor: JobProcessor =
            Arc::new(|_task| Box::pin(async { Err(AgentError::non_retryable("always")) }));
        let q = TaskQueue::new(
            TaskQueueConfig::new("doomed")
                .with_backoff(RetryPolicy::fixed(Duration::from_millis(10), 2)),
            bus,
        );
        q.start(processor);

        let err = q
            .add_job(task("x"), JobOptions::new().with_attempts(3))
            .unwrap()
            .wait()
            .await
            .unwrap_err();

        assert_eq!(err.message, "always");
        let failed = q.failed_jobs();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].task.attempts, 3);
        assert_eq!(q.stats().failed, 1);

        let mut kinds = vec![];
        while let Ok(event) = events.try_recv() {
            kinds.push(event.event_type);
        }
        assert_eq!(
            kinds,
            vec![
                types::TASK_QUEUED,
                types::TASK_RETRYING,
                types::TASK_RETRYING,
                types::TASK_DEAD
            ]
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let processor: JobProcessor = Arc::new(move |_task| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(AgentError::new(codes::VALIDATION_ERROR, "bad input")) })
        });
        let q = queue(TaskQueueConfig::new("strict").with_default_attempts(5));
        q.start(processor);

        let result = q.add_job(task("x"), JobOptions::default()).unwrap().wait().await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrency_ceiling() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        let processor: JobProcessor = Arc::new(move |_task| {
            let (r, p) = (r.clone(), p.clone());
            Box::pin(async move {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            })
        });

        let q = queue(TaskQueueConfig::new("bounded").with_max_concurrency(2));
        q.start(processor);

        let handles: Vec<JobHandle> = (0..8)
            .map(|_| q.add_job(task("x"), JobOptions::default()).unwrap())
            .collect();
        for handle in handles {
            handle.wait().await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(q.stats().completed, 8);
    }

    #[tokio::test]
    async fn test_priority_order_while_paused() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let processor: JobProcessor = Arc::new(move |task| {
            seen.lock().push(task.priority);
            Box::pin(async { Ok(json!(null)) })
        });

        let q = queue(TaskQueueConfig::new("prio"));
        q.pause();
        q.start(processor);

        let low = q
            .add_job(task("x"), JobOptions::new().with_priority(TaskPriority::Low))
            .unwrap();
        let critical = q
            .add_job(task("x"), JobOptions::new().with_priority(TaskPriority::Critical))
            .unwrap();
        let normal = q.add_job(task("x"), JobOptions::default()).unwrap();
        assert_eq!(q.stats().waiting, 3);

        q.resume();
        for handle in [low, critical, normal] {
            handle.wait().await.unwrap();
        }

        assert_eq!(
            *order.lock(),
            vec![TaskPriority::Critical, TaskPriority::Normal, TaskPriority::Low]
        );
    }

    #[tokio::test]
    async fn test_queue_full() {
        let q = queue(TaskQueueConfig::new("tiny").with_max_size(1));
        let _first = q.add_job(task("x"), JobOptions::default()).unwrap();
        let err = q.add_job(task("x"), JobOptions::default()).unwrap_err();
        assert!(matches!(err, OrchestratorError::QueueFull { .. }));
    }

    #[tokio::test]
    async fn test_drain_waits_for_everything() {
        let q = queue(TaskQueueConfig::new("drain").with_max_concurrency(3));
        q.start(Arc::new(|_task| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(json!(null))
            })
        }));
        for _ in 0..5 {
            q.add_job(task("x"), JobOptions::default()).unwrap();
        }
        q.drain().await;
        let stats = q.stats();
        assert_eq!((stats.waiting, stats.active, stats.delayed), (0, 0, 0));
        assert_eq!(stats.completed, 5);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waiting_jobs() {
        let q = queue(TaskQueueConfig::new("closing"));
        let handle = q.add_job(task("x"), JobOptions::default()).unwrap();
        let id = handle.task_id();

        q.shutdown().await;

        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.code, codes::CANCELLED);
        assert_eq!(q.task(&id).unwrap().status, TaskStatus::Cancelled);
        assert!(q.add_job(task("x"), JobOptions::default()).is_err());
    }
}
