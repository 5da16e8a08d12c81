//! Per-agent runtime
//!
//! Owns one agent's lifecycle state machine, its task queue, heartbeat and
//! counters.
//!
//! ```text
//! Idle ──start──▶ Running ◀──pause/resume──▶ Paused
//!                    │                          │
//!                    └──────────stop────────────┴──▶ Stopped
//!
//! Error: reachable from any state (failed hook, heartbeat timeout)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetflow_core::events::{types, Event, Severity};
use fleetflow_core::{
    codes, AgentConfig, AgentError, AgentMetrics, AgentStatus, AgentTask, HealthCheck,
    HealthReport, HealthStatus, OrchestratorError, OrchestratorResult, SharedEventBus,
};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::agent::{AgentContext, SharedAgent};
use super::config::WorkerConfig;
use super::resources::MemoryProbe;
use crate::queue::{
    JobHandle, JobOptions, JobProcessor, JobResult, QueueStats, TaskQueue, TaskQueueConfig,
};
use crate::ticker::Ticker;

pub const LIVENESS_CHECK: &str = "liveness";

/// Result of a bounded drain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainOutcome {
    /// All in-flight tasks finished before the timeout
    pub drained: bool,

    /// Tasks still running when the worker proceeded
    pub abandoned: usize,
}

impl DrainOutcome {
    fn clean() -> Self {
        Self {
            drained: true,
            abandoned: 0,
        }
    }
}

#[derive(Debug, Default)]
struct LifecycleState {
    status: AgentStatus,
    initialized: bool,
    shut_down: bool,
    /// Status before a heartbeat timeout flagged the worker
    flagged_from: Option<AgentStatus>,
    last_heartbeat: Option<DateTime<Utc>>,
    last_beat: Option<Instant>,
    last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counters {
    processed: u64,
    successful: u64,
    failed: u64,
    total_duration_ms: u64,
}

/// Runtime for one agent
pub struct Worker {
    id: String,
    config: RwLock<AgentConfig>,
    worker_config: WorkerConfig,
    agent: SharedAgent,
    events: SharedEventBus,
    queue: Arc<TaskQueue>,
    state: Mutex<LifecycleState>,
    running: AtomicBool,
    counters: Mutex<Counters>,
    heartbeat: Mutex<Option<Ticker>>,
    memory: MemoryProbe,
    this: Weak<Worker>,
}

impl Worker {
    pub fn new(
        config: AgentConfig,
        worker_config: WorkerConfig,
        agent: SharedAgent,
        events: SharedEventBus,
    ) -> Arc<Self> {
        let mut queue_config = TaskQueueConfig::new(config.id.clone())
            .with_max_concurrency(config.max_concurrency)
            .with_max_size(worker_config.queue_max_size)
            .with_default_attempts(config.retry_attempts.saturating_add(1))
            .with_backoff(config.retry_policy())
            .with_keep_finished(worker_config.keep_finished);
        queue_config.shutdown_timeout = worker_config.drain_timeout;

        let queue = TaskQueue::new(queue_config, Arc::clone(&events));

        Arc::new_cyclic(|this| Self {
            id: config.id.clone(),
            config: RwLock::new(config),
            worker_config,
            agent,
            events,
            queue,
            state: Mutex::new(LifecycleState::default()),
            running: AtomicBool::new(false),
            counters: Mutex::new(Counters::default()),
            heartbeat: Mutex::new(None),
            memory: MemoryProbe::new(),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> AgentConfig {
        self.config.read().clone()
    }

    pub fn worker_config(&self) -> &WorkerConfig {
        &self.worker_config
    }

    pub fn status(&self) -> AgentStatus {
        self.state.lock().status
    }

    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Whether the worker accepts tasks (running or paused)
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    fn emit(&self, event_type: &str, severity: Severity, data: Value) {
        self.events.publish(
            Event::new(event_type)
                .with_agent(self.id.clone())
                .with_severity(severity)
                .with_data(data),
        );
    }

    fn enter_error(&self, stage: &str, err: &AgentError) {
        self.state.lock().status = AgentStatus::Error;
        error!(agent_id = %self.id, stage, error = %err, "Agent entered error state");
        self.emit(
            types::AGENT_ERROR,
            Severity::Error,
            json!({"stage": stage, "error": err}),
        );
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Validate the config and run the agent's initialize hook
    #[instrument(skip(self), fields(agent_id = %self.id))]
    pub async fn initialize(&self) -> OrchestratorResult<()> {
        if self.is_initialized() {
            return Ok(());
        }
        self.config.read().validate()?;

        let ctx = AgentContext {
            agent_id: self.id.clone(),
            events: Arc::clone(&self.events),
        };
        if let Err(err) = self.agent.on_initialize(&ctx).await {
            self.enter_error("initialize", &err);
            return Err(OrchestratorError::Agent(err));
        }

        self.state.lock().initialized = true;
        debug!(agent_id = %self.id, "Agent initialized");
        self.emit(types::AGENT_INITIALIZED, Severity::Info, Value::Null);
        Ok(())
    }

    /// Start the queue and heartbeat; a no-op if already running
    #[instrument(skip(self), fields(agent_id = %self.id))]
    pub async fn start(&self) -> OrchestratorResult<()> {
        if self.is_running() {
            warn!(agent_id = %self.id, "Agent already running");
            return Ok(());
        }
        if self.state.lock().shut_down {
            return Err(OrchestratorError::invalid_state(format!(
                "agent {} is shut down",
                self.id
            )));
        }
        self.initialize().await?;

        if let Err(err) = self.agent.on_start().await {
            self.enter_error("start", &err);
            return Err(OrchestratorError::Agent(err));
        }

        {
            let mut state = self.state.lock();
            state.status = AgentStatus::Running;
            state.flagged_from = None;
            state.last_beat = Some(Instant::now());
        }
        self.running.store(true, Ordering::SeqCst);

        self.queue.resume();
        if !self.queue.is_started() {
            self.queue.start(self.processor());
        }
        self.start_heartbeat();

        info!(
            agent_id = %self.id,
            max_concurrency = self.config.read().max_concurrency,
            "Agent started"
        );
        self.emit(types::AGENT_STARTED, Severity::Info, Value::Null);
        Ok(())
    }

    /// Stop pulling new tasks; in-flight tasks continue
    pub fn pause(&self) -> OrchestratorResult<()> {
        {
            let mut state = self.state.lock();
            if state.status != AgentStatus::Running {
                return Err(OrchestratorError::invalid_state(format!(
                    "cannot pause agent {} in status {}",
                    self.id, state.status
                )));
            }
            state.status = AgentStatus::Paused;
        }
        self.queue.pause();
        self.emit(types::AGENT_PAUSED, Severity::Info, Value::Null);
        Ok(())
    }

    pub fn resume(&self) -> OrchestratorResult<()> {
        {
            let mut state = self.state.lock();
            if state.status != AgentStatus::Paused {
                return Err(OrchestratorError::invalid_state(format!(
                    "cannot resume agent {} in status {}",
                    self.id, state.status
                )));
            }
            state.status = AgentStatus::Running;
        }
        self.queue.resume();
        self.emit(types::AGENT_RESUMED, Severity::Info, Value::Null);
        Ok(())
    }

    /// Stop accepting tasks and wait for in-flight ones, bounded by `drain_timeout`
    ///
    /// After the timeout the worker proceeds regardless; outstanding tasks keep
    /// running on their own and are reported in [`DrainOutcome::abandoned`].
    #[instrument(skip(self), fields(agent_id = %self.id))]
    pub async fn stop(&self) -> OrchestratorResult<DrainOutcome> {
        if !self.running.swap(false, Ordering::SeqCst) {
            let mut state = self.state.lock();
            if state.status != AgentStatus::Idle {
                state.status = AgentStatus::Stopped;
            }
            return Ok(DrainOutcome::clean());
        }

        info!(agent_id = %self.id, "Stopping agent");
        self.queue.pause();

        let ticker = self.heartbeat.lock().take();
        if let Some(ticker) = ticker {
            ticker.stop().await;
        }

        let drained = self
            .queue
            .wait_for_active(self.worker_config.drain_timeout)
            .await;
        let abandoned = self.queue.stats().active;
        if !drained {
            warn!(
                agent_id = %self.id,
                abandoned,
                timeout_ms = self.worker_config.drain_timeout.as_millis() as u64,
                "Drain timeout reached, proceeding with tasks in flight"
            );
        }

        if let Err(err) = self.agent.on_stop().await {
            warn!(agent_id = %self.id, error = %err, "Agent stop hook failed");
        }

        {
            let mut state = self.state.lock();
            state.status = AgentStatus::Stopped;
            state.flagged_from = None;
        }
        self.emit(
            types::AGENT_STOPPED,
            Severity::Info,
            json!({"drained": drained, "abandoned": abandoned}),
        );
        Ok(DrainOutcome { drained, abandoned })
    }

    /// Stop, cancel waiting jobs and release the agent; the worker cannot restart
    ///
    /// An `on_shutdown` failure is returned after the worker has been released.
    #[instrument(skip(self), fields(agent_id = %self.id))]
    pub async fn shutdown(&self) -> OrchestratorResult<DrainOutcome> {
        if self.state.lock().shut_down {
            return Ok(DrainOutcome::clean());
        }
        let outcome = self.stop().await?;
        self.queue.shutdown().await;

        let hook = self.agent.on_shutdown().await;
        if let Err(err) = &hook {
            warn!(agent_id = %self.id, error = %err, "Agent shutdown hook failed");
        }

        {
            let mut state = self.state.lock();
            state.shut_down = true;
            state.status = AgentStatus::Stopped;
        }
        info!(agent_id = %self.id, "Agent shut down");
        self.emit(types::AGENT_SHUTDOWN, Severity::Info, Value::Null);
        // The worker is released either way; a failed hook is still reported
        hook.map(|()| outcome).map_err(OrchestratorError::Agent)
    }

    /// Replace the agent config; the id cannot change
    pub fn update_config(&self, config: AgentConfig) -> OrchestratorResult<AgentConfig> {
        if config.id != self.id {
            return Err(OrchestratorError::validation(format!(
                "config id {} does not match agent {}",
                config.id, self.id
            )));
        }
        config.validate()?;

        let max_concurrency = config.max_concurrency;
        let previous = std::mem::replace(&mut *self.config.write(), config);
        self.queue.set_max_concurrency(max_concurrency);

        debug!(agent_id = %self.id, max_concurrency, "Agent config updated");
        self.emit(
            types::AGENT_CONFIG_UPDATED,
            Severity::Info,
            json!({"max_concurrency": max_concurrency}),
        );
        Ok(previous)
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    fn start_heartbeat(&self) {
        let weak = self.this.clone();
        let ticker = Ticker::spawn(
            "agent-heartbeat",
            self.worker_config.heartbeat_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(worker) = weak.upgrade() {
                        worker.heartbeat();
                    }
                }
            },
        );
        if let Some(previous) = self.heartbeat.lock().replace(ticker) {
            previous.cancel();
        }
    }

    /// Record a liveness signal; clears a heartbeat-timeout flag
    pub fn heartbeat(&self) {
        let recovered = {
            let mut state = self.state.lock();
            state.last_heartbeat = Some(Utc::now());
            state.last_beat = Some(Instant::now());
            match state.flagged_from.take() {
                Some(previous) if state.status == AgentStatus::Error => {
                    state.status = previous;
                    Some(previous)
                }
                _ => None,
            }
        };

        self.emit(types::AGENT_HEARTBEAT, Severity::Debug, Value::Null);
        if let Some(status) = recovered {
            info!(agent_id = %self.id, status = %status, "Agent recovered after heartbeat");
            self.emit(
                types::AGENT_RECOVERED,
                Severity::Info,
                json!({"status": status}),
            );
        }
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_heartbeat
    }

    /// Time since the last heartbeat (or start), on the tokio clock
    pub fn heartbeat_elapsed(&self) -> Option<Duration> {
        self.state.lock().last_beat.map(|at| at.elapsed())
    }

    /// Flag the worker `Error` after a missed heartbeat; false if already flagged or inactive
    ///
    /// Does not stop the worker; the next heartbeat restores its status.
    pub fn mark_heartbeat_timeout(&self) -> bool {
        let mut state = self.state.lock();
        if state.flagged_from.is_some() || !state.status.is_active() {
            return false;
        }
        state.flagged_from = Some(state.status);
        state.status = AgentStatus::Error;
        true
    }

    pub fn is_heartbeat_flagged(&self) -> bool {
        self.state.lock().flagged_from.is_some()
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    fn processor(&self) -> JobProcessor {
        let weak = self.this.clone();
        Arc::new(move |task: AgentTask| -> BoxFuture<'static, JobResult> {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(worker) => worker
                        .process_task(&task)
                        .await
                        .map_err(OrchestratorError::into_agent_error),
                    None => Err(AgentError::cancelled(format!(
                        "worker for task {} was dropped",
                        task.id
                    ))),
                }
            })
        })
    }

    fn check_task(&self, task: &AgentTask) -> OrchestratorResult<()> {
        if task.agent_id != self.id {
            return Err(OrchestratorError::validation(format!(
                "task {} targets agent {}, not {}",
                task.id, task.agent_id, self.id
            )));
        }
        task.validate()?;
        self.agent.validate_payload(task)
    }

    /// Execute one task directly, bypassing the queue
    ///
    /// Rejects malformed or misrouted tasks with `Validation` and unsupported
    /// kinds with `CapabilityMismatch`. Execution is bounded by the agent's
    /// timeout.
    #[instrument(skip(self, task), fields(agent_id = %self.id, task_id = %task.id, task_type = %task.kind))]
    pub async fn process_task(&self, task: &AgentTask) -> OrchestratorResult<Value> {
        self.check_task(task)?;
        if !self.agent.can_handle(task) {
            return Err(OrchestratorError::CapabilityMismatch {
                agent_id: self.id.clone(),
                task_type: task.kind.to_string(),
            });
        }

        let timeout = self.config.read().timeout;
        let correlation = task.context.correlation_id.clone();
        self.events.publish(
            Event::new(types::TASK_STARTED)
                .with_agent(self.id.clone())
                .with_correlation(correlation.clone())
                .with_data(json!({"task_id": task.id, "type": task.kind, "attempt": task.attempts})),
        );

        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, self.agent.execute(task)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AgentError::timeout(format!(
                "task {} exceeded {}ms",
                task.id,
                timeout.as_millis()
            ))),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        self.record_outcome(outcome.is_ok(), duration_ms);

        match outcome {
            Ok(value) => {
                debug!(duration_ms, "Task completed");
                self.events.publish(
                    Event::new(types::TASK_COMPLETED)
                        .with_agent(self.id.clone())
                        .with_correlation(correlation)
                        .with_data(json!({"task_id": task.id, "duration_ms": duration_ms})),
                );
                Ok(value)
            }
            Err(mut err) => {
                if err.source_id.is_none() {
                    err.source_id = Some(task.id.to_string());
                }
                warn!(duration_ms, error = %err, retryable = err.retryable, "Task failed");
                self.events.publish(
                    Event::new(types::TASK_FAILED)
                        .with_agent(self.id.clone())
                        .with_correlation(correlation)
                        .with_severity(Severity::Warning)
                        .with_data(json!({
                            "task_id": task.id,
                            "duration_ms": duration_ms,
                            "error": err,
                        })),
                );
                Err(OrchestratorError::Agent(err))
            }
        }
    }

    fn record_outcome(&self, success: bool, duration_ms: u64) {
        {
            let mut counters = self.counters.lock();
            counters.processed += 1;
            counters.total_duration_ms += duration_ms;
            if success {
                counters.successful += 1;
            } else {
                counters.failed += 1;
            }
        }
        self.state.lock().last_activity = Some(Utc::now());
    }

    fn default_job_options(&self) -> JobOptions {
        let config = self.config.read();
        JobOptions::new()
            .with_attempts(config.retry_attempts.saturating_add(1))
            .with_backoff(config.retry_policy())
    }

    /// Queue a task with the agent's retry policy
    pub fn submit(&self, task: AgentTask) -> OrchestratorResult<JobHandle> {
        let options = self.default_job_options();
        self.enqueue(task, options)
    }

    /// Queue a task with explicit job options
    #[instrument(skip(self, task, options), fields(agent_id = %self.id, task_id = %task.id))]
    pub fn enqueue(&self, task: AgentTask, options: JobOptions) -> OrchestratorResult<JobHandle> {
        if !self.is_running() {
            return Err(OrchestratorError::Agent(
                AgentError::new(
                    codes::AGENT_NOT_RUNNING,
                    format!("agent {} is not running", self.id),
                )
                .with_retryable(true)
                .with_source(task.id.to_string()),
            ));
        }
        self.check_task(&task)?;
        self.queue.add_job(task, options)
    }

    /// Queue a task and wait for its final outcome
    pub async fn execute(&self, task: AgentTask, options: JobOptions) -> OrchestratorResult<Value> {
        self.enqueue(task, options)?
            .wait()
            .await
            .map_err(OrchestratorError::Agent)
    }

    /// Latest record of a task this worker queued
    pub fn task(&self, task_id: &Uuid) -> Option<AgentTask> {
        self.queue.task(task_id)
    }

    // ========================================================================
    // Health and metrics
    // ========================================================================

    fn liveness_check(&self, status: AgentStatus, flagged: bool) -> HealthCheck {
        match status {
            AgentStatus::Running => HealthCheck::pass(LIVENESS_CHECK),
            AgentStatus::Paused => HealthCheck::warn(LIVENESS_CHECK, "agent is paused"),
            AgentStatus::Idle => HealthCheck::warn(LIVENESS_CHECK, "agent not started"),
            AgentStatus::Error if flagged => {
                HealthCheck::warn(LIVENESS_CHECK, "heartbeat overdue")
            }
            AgentStatus::Error => HealthCheck::fail(LIVENESS_CHECK, "agent in error state"),
            AgentStatus::Stopped => HealthCheck::fail(LIVENESS_CHECK, "agent stopped"),
        }
    }

    /// Liveness, dependency and resource checks; unhealthy if any check fails
    pub async fn get_health(&self) -> HealthReport {
        let (status, flagged) = {
            let state = self.state.lock();
            (state.status, state.flagged_from.is_some())
        };

        let mut checks = vec![self.liveness_check(status, flagged)];
        checks.extend(self.agent.dependency_checks().await);
        if let Some(threshold) = self.worker_config.memory_threshold_mb {
            checks.push(self.memory.check(threshold));
        }

        let baseline = if flagged {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthReport::from_checks(self.id.clone(), status, checks, baseline)
    }

    pub fn metrics(&self) -> AgentMetrics {
        let (processed, successful, failed, total_duration_ms) = {
            let c = self.counters.lock();
            (c.processed, c.successful, c.failed, c.total_duration_ms)
        };
        let (status, last_activity, last_heartbeat) = {
            let state = self.state.lock();
            (state.status, state.last_activity, state.last_heartbeat)
        };
        let queue = self.queue.stats();

        AgentMetrics {
            agent_id: self.id.clone(),
            status,
            tasks_processed: processed,
            tasks_successful: successful,
            tasks_failed: failed,
            total_duration_ms,
            average_duration_ms: if processed == 0 {
                0.0
            } else {
                total_duration_ms as f64 / processed as f64
            },
            queue_waiting: queue.waiting,
            queue_active: queue.active,
            last_activity,
            last_heartbeat,
            custom: self.agent.custom_metrics(),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::agent::FnAgent;
    use fleetflow_core::{BroadcastEventBus, CheckStatus, Payload, TaskKind};
    use std::sync::atomic::AtomicU32;

    fn worker_with(agent: SharedAgent, config: AgentConfig) -> Arc<Worker> {
        Worker::new(
            config,
            WorkerConfig::default().with_memory_threshold_mb(None),
            agent,
            BroadcastEventBus::shared(),
        )
    }

    fn echo() -> SharedAgent {
        FnAgent::new(|task: AgentTask| async move { Ok(Value::Object(task.payload)) })
            .handling("echo")
            .shared()
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let worker = worker_with(echo(), AgentConfig::new("echo", "Echo"));
        assert_eq!(worker.status(), AgentStatus::Idle);

        worker.start().await.unwrap();
        assert_eq!(worker.status(), AgentStatus::Running);
        // second start only warns
        worker.start().await.unwrap();

        worker.pause().unwrap();
        assert_eq!(worker.status(), AgentStatus::Paused);
        assert!(worker.pause().is_err());
        worker.resume().unwrap();

        let outcome = worker.stop().await.unwrap();
        assert!(outcome.drained);
        assert_eq!(worker.status(), AgentStatus::Stopped);

        worker.shutdown().await.unwrap();
        assert!(worker.start().await.is_err());
    }

    #[tokio::test]
    async fn test_process_task_rejects_misrouted_and_unsupported() {
        let worker = worker_with(echo(), AgentConfig::new("echo", "Echo"));

        let misrouted = AgentTask::new("other", "echo", Payload::new());
        assert!(matches!(
            worker.process_task(&misrouted).await,
            Err(OrchestratorError::Validation(_))
        ));

        let unsupported = AgentTask::new("echo", "lookup", payload(json!({"query": "q"})));
        assert!(matches!(
            worker.process_task(&unsupported).await,
            Err(OrchestratorError::CapabilityMismatch { .. })
        ));

        let missing_field = AgentTask::new("echo", TaskKind::Generate, Payload::new());
        assert!(matches!(
            worker.process_task(&missing_field).await,
            Err(OrchestratorError::Validation(_))
        ));
        assert_eq!(worker.metrics().tasks_processed, 0);
    }

    #[tokio::test]
    async fn test_failure_is_wrapped_and_counted() {
        let agent = FnAgent::new(|_task| async { Err(AgentError::non_retryable("boom")) }).shared();
        let worker = worker_with(agent, AgentConfig::new("failing", "Failing"));

        let task = AgentTask::new("failing", "anything", Payload::new());
        let err = worker.process_task(&task).await.unwrap_err().into_agent_error();
        assert_eq!(err.message, "boom");
        assert!(!err.retryable);
        assert_eq!(err.source_id, Some(task.id.to_string()));

        let metrics = worker.metrics();
        assert_eq!((metrics.tasks_processed, metrics.tasks_failed), (1, 1));
        assert_eq!(metrics.success_rate(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_is_retryable() {
        let agent = FnAgent::new(|_task| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        })
        .shared();
        let worker = worker_with(
            agent,
            AgentConfig::new("slow", "Slow").with_timeout(Duration::from_secs(1)),
        );

        let task = AgentTask::new("slow", "sleep", Payload::new());
        let err = worker.process_task(&task).await.unwrap_err().into_agent_error();
        assert_eq!(err.code, codes::TIMEOUT);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_submit_requires_running_worker() {
        let worker = worker_with(echo(), AgentConfig::new("echo", "Echo"));
        let task = AgentTask::new("echo", "echo", Payload::new());
        let err = worker.submit(task).unwrap_err().into_agent_error();
        assert_eq!(err.code, codes::AGENT_NOT_RUNNING);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submitted_task_retries_with_agent_policy() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let agent = FnAgent::new(move |_task| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AgentError::retryable("transient"))
                } else {
                    Ok(json!("done"))
                }
            }
        })
        .shared();
        let worker = worker_with(
            agent,
            AgentConfig::new("retry", "Retry").with_retry(2, Duration::from_millis(50)),
        );
        worker.start().await.unwrap();

        let handle = worker
            .submit(AgentTask::new("retry", "x", Payload::new()))
            .unwrap();
        let id = handle.task_id();
        assert_eq!(handle.wait().await.unwrap(), json!("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(worker.task(&id).unwrap().attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drain_is_bounded() {
        let agent = FnAgent::new(|_task| async {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(Value::Null)
        })
        .shared();
        let worker = Worker::new(
            AgentConfig::new("stuck", "Stuck").with_timeout(Duration::from_secs(3600)),
            WorkerConfig::default()
                .with_drain_timeout(Duration::from_secs(2))
                .with_memory_threshold_mb(None),
            agent,
            BroadcastEventBus::shared(),
        );
        worker.start().await.unwrap();
        let _handle = worker
            .submit(AgentTask::new("stuck", "x", Payload::new()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = worker.stop().await.unwrap();
        assert!(!outcome.drained);
        assert_eq!(outcome.abandoned, 1);
        assert_eq!(worker.status(), AgentStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_flag_and_recovery() {
        let worker = worker_with(echo(), AgentConfig::new("echo", "Echo"));
        assert!(!worker.mark_heartbeat_timeout());

        worker.start().await.unwrap();
        // let the immediate first heartbeat land
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(worker.last_heartbeat().is_some());
        assert!(worker.mark_heartbeat_timeout());
        assert_eq!(worker.status(), AgentStatus::Error);

        let report = worker.get_health().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.checks[0].status, CheckStatus::Warn);

        worker.heartbeat();
        assert_eq!(worker.status(), AgentStatus::Running);
        assert_eq!(worker.get_health().await.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_failing_dependency_makes_agent_unhealthy() {
        struct Flaky;

        #[async_trait::async_trait]
        impl crate::worker::TaskExecutor for Flaky {
            fn can_handle(&self, _task: &AgentTask) -> bool {
                true
            }

            async fn execute(&self, _task: &AgentTask) -> Result<Value, AgentError> {
                Ok(Value::Null)
            }
        }

        impl crate::worker::Lifecycle for Flaky {}

        #[async_trait::async_trait]
        impl crate::worker::HealthReporter for Flaky {
            async fn dependency_checks(&self) -> Vec<HealthCheck> {
                vec![
                    HealthCheck::warn("quota", "80% used"),
                    HealthCheck::fail("api", "unreachable"),
                ]
            }
        }

        let worker = worker_with(Arc::new(Flaky), AgentConfig::new("flaky", "Flaky"));
        worker.start().await.unwrap();
        let report = worker.get_health().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.checks.len(), 3);
    }

    #[tokio::test]
    async fn test_update_config_keeps_id() {
        let worker = worker_with(echo(), AgentConfig::new("echo", "Echo"));
        assert!(worker
            .update_config(AgentConfig::new("other", "Other"))
            .is_err());

        let previous = worker
            .update_config(AgentConfig::new("echo", "Echo v2").with_max_concurrency(4))
            .unwrap();
        assert_eq!(previous.name, "Echo");
        assert_eq!(worker.config().max_concurrency, 4);
    }
}
