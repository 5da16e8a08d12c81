//! Workflow engine facade and dispatcher
//!
//! The `WorkflowEngine` is responsible for:
//! - Keeping the catalogue of registered workflow definitions
//! - Admitting executions under the concurrency ceiling (FIFO)
//! - Pause, resume and cancel of individual executions
//! - Enforcing the per-execution time budget
//! - Persisting execution snapshots at every lifecycle transition

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use fleetflow_core::{
    events::types, AgentError, Event, ExecutionStatus, OrchestratorError, OrchestratorResult,
    Severity, SharedEventBus, WorkflowDefinition, WorkflowExecution,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::handle::{Activation, ExecutionHandle, ResumeAction, Settled};
use super::walker::{StepServices, Walk};
use super::EngineConfig;
use crate::persistence::{ExecutionStore, NoopStore};
use crate::registry::AgentRegistry;
use crate::webhook::{HttpWebhookClient, WebhookClient};

/// Point-in-time engine counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub workflows: usize,
    pub executions: usize,
    /// Executions waiting for admission
    pub queued: usize,
    /// Executions holding a dispatcher slot
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

struct EngineInner {
    config: EngineConfig,
    services: Arc<StepServices>,
    store: Arc<dyn ExecutionStore>,
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    executions: DashMap<Uuid, Arc<ExecutionHandle>>,
    pending: Mutex<VecDeque<Uuid>>,
    running: AtomicUsize,
    wake: Notify,
    shutdown: CancellationToken,
    started: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`WorkflowEngine`]
pub struct WorkflowEngineBuilder {
    registry: Arc<AgentRegistry>,
    config: EngineConfig,
    store: Option<Arc<dyn ExecutionStore>>,
    webhook: Option<Arc<dyn WebhookClient>>,
    events: Option<SharedEventBus>,
}

impl WorkflowEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn webhook_client(mut self, client: Arc<dyn WebhookClient>) -> Self {
        self.webhook = Some(client);
        self
    }

    /// Event bus for engine events; defaults to the registry's bus
    pub fn events(mut self, events: SharedEventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let events = self
            .events
            .unwrap_or_else(|| Arc::clone(self.registry.events()));
        let services = Arc::new(StepServices {
            registry: self.registry,
            webhook: self
                .webhook
                .unwrap_or_else(|| Arc::new(HttpWebhookClient::new())),
            events,
        });

        WorkflowEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                services,
                store: self.store.unwrap_or_else(|| Arc::new(NoopStore)),
                workflows: RwLock::new(HashMap::new()),
                executions: DashMap::new(),
                pending: Mutex::new(VecDeque::new()),
                running: AtomicUsize::new(0),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                dispatcher: Mutex::new(None),
            }),
        }
    }
}

/// Walks workflow executions against the agents of one registry
///
/// # Example
///
/// ```ignore
/// let engine = WorkflowEngine::builder(registry).build();
/// engine.start().await?;
/// engine.register_workflow(definition).await?;
///
/// let id = engine.execute_workflow("onboarding", json!({"user": "ada"})).await?;
/// engine.pause_workflow(id).await?;
/// engine.resume_workflow(id).await?;
/// ```
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn builder(registry: Arc<AgentRegistry>) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder {
            registry,
            config: EngineConfig::default(),
            store: None,
            webhook: None,
            events: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.inner.services.registry
    }

    // =========================================================================
    // Workflow catalogue
    // =========================================================================

    /// Validate, persist and register a definition; a later registration
    /// under the same id replaces the earlier one for new executions
    #[instrument(skip(self, definition), fields(workflow_id = %definition.id))]
    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> OrchestratorResult<()> {
        definition.validate()?;
        self.inner.store.save_workflow_definition(&definition).await?;

        let id = definition.id.clone();
        let steps = definition.steps.len();
        let version = definition.version;
        self.inner
            .workflows
            .write()
            .insert(id.clone(), Arc::new(definition));

        info!(workflow_id = %id, steps, version, "Workflow registered");
        self.inner.emit(
            Event::new(types::WORKFLOW_REGISTERED)
                .with_data(json!({"workflow_id": id, "steps": steps, "version": version})),
        );
        Ok(())
    }

    pub fn get_workflow(&self, id: &str) -> Option<WorkflowDefinition> {
        self.inner
            .workflows
            .read()
            .get(id)
            .map(|d| d.as_ref().clone())
    }

    /// Registered definitions ordered by id
    pub fn list_workflows(&self) -> Vec<WorkflowDefinition> {
        let mut workflows: Vec<WorkflowDefinition> = self
            .inner
            .workflows
            .read()
            .values()
            .map(|d| d.as_ref().clone())
            .collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        workflows
    }

    // =========================================================================
    // Executions
    // =========================================================================

    /// Queue a new execution; it starts once the dispatcher admits it
    #[instrument(skip(self, input))]
    pub async fn execute_workflow(&self, workflow_id: &str, input: Value) -> OrchestratorResult<Uuid> {
        if self.inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::invalid_state(
                "workflow engine is shut down",
            ));
        }
        let definition = self
            .inner
            .workflows
            .read()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("workflow", workflow_id))?;

        let execution = WorkflowExecution::new(workflow_id, input, &definition.variables);
        let id = execution.id;
        let handle = Arc::new(ExecutionHandle::new(definition, execution));
        self.inner.executions.insert(id, Arc::clone(&handle));
        self.inner.persist(&handle).await;

        debug!(execution_id = %id, "Execution queued");
        self.inner.emit(
            Event::new(types::EXECUTION_QUEUED)
                .with_execution(id)
                .with_correlation(Some(id.to_string()))
                .with_data(json!({"workflow_id": workflow_id})),
        );
        self.inner.enqueue(id);
        Ok(id)
    }

    pub fn get_execution(&self, id: Uuid) -> Option<WorkflowExecution> {
        self.inner.executions.get(&id).map(|h| h.snapshot())
    }

    /// Executions in creation order, optionally filtered by status
    pub fn list_executions(&self, status: Option<ExecutionStatus>) -> Vec<WorkflowExecution> {
        let mut executions: Vec<WorkflowExecution> = self
            .inner
            .executions
            .iter()
            .map(|entry| entry.value().snapshot())
            .filter(|e| status.map_or(true, |s| e.status == s))
            .collect();
        executions.sort_by_key(|e| e.id);
        executions
    }

    /// Wait until the execution reaches a terminal status
    pub async fn wait_for_execution(
        &self,
        id: Uuid,
        timeout: Duration,
    ) -> OrchestratorResult<WorkflowExecution> {
        let handle = self.inner.handle(id)?;
        let mut rx = handle.subscribe();

        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| s.is_terminal()))
            .await
            .map(|r| r.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(handle.snapshot()),
            Ok(Err(_)) => Err(OrchestratorError::invalid_state(format!(
                "status channel of execution {id} closed"
            ))),
            Err(_) => Err(OrchestratorError::Timeout(format!(
                "execution {id} did not finish within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Stop a running execution at its next step boundary
    #[instrument(skip(self))]
    pub async fn pause_workflow(&self, id: Uuid) -> OrchestratorResult<()> {
        let handle = self.inner.handle(id)?;
        handle.pause()?;

        info!(execution_id = %id, "Execution paused");
        self.inner.emit(
            Event::new(types::EXECUTION_PAUSED)
                .with_execution(id)
                .with_correlation(Some(id.to_string())),
        );
        self.inner.persist(&handle).await;
        handle.publish_status();
        Ok(())
    }

    /// Continue a paused execution from the steps it parked
    #[instrument(skip(self))]
    pub async fn resume_workflow(&self, id: Uuid) -> OrchestratorResult<()> {
        let handle = self.inner.handle(id)?;
        match handle.resume()? {
            ResumeAction::Continued => {
                info!(execution_id = %id, "Execution resumed");
                self.inner.emit(
                    Event::new(types::EXECUTION_RESUMED)
                        .with_execution(id)
                        .with_correlation(Some(id.to_string())),
                );
                self.inner.persist(&handle).await;
                handle.publish_status();
            }
            ResumeAction::Requeue => {
                debug!(execution_id = %id, "Paused execution queued for resume");
                self.inner.enqueue(id);
            }
        }
        Ok(())
    }

    /// Cancel a pending, running or paused execution
    ///
    /// Steps already dispatched are not aborted; their results are discarded.
    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, id: Uuid) -> OrchestratorResult<()> {
        let handle = self.inner.handle(id)?;
        let active = handle.cancel()?;
        self.inner.pending.lock().retain(|queued| *queued != id);

        info!(execution_id = %id, active, "Execution cancelled");
        self.inner.emit(
            Event::new(types::EXECUTION_CANCELLED)
                .with_execution(id)
                .with_correlation(Some(id.to_string()))
                .with_severity(Severity::Warning),
        );
        self.inner.persist(&handle).await;
        handle.publish_status();
        Ok(())
    }

    pub fn engine_stats(&self) -> EngineStats {
        let mut stats = EngineStats {
            workflows: self.inner.workflows.read().len(),
            executions: self.inner.executions.len(),
            queued: self.inner.pending.lock().len(),
            running: self.inner.running.load(Ordering::SeqCst),
            ..EngineStats::default()
        };
        for entry in self.inner.executions.iter() {
            match entry.value().status() {
                ExecutionStatus::Paused => stats.paused += 1,
                ExecutionStatus::Completed => stats.completed += 1,
                ExecutionStatus::Failed => stats.failed += 1,
                ExecutionStatus::Cancelled => stats.cancelled += 1,
                ExecutionStatus::Pending | ExecutionStatus::Running => {}
            }
        }
        stats
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the dispatcher and pick up scheduled executions
    #[instrument(skip(self))]
    pub async fn start(&self) -> OrchestratorResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::invalid_state(
                "workflow engine is shut down",
            ));
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("Workflow engine already started");
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        *self.inner.dispatcher.lock() = Some(tokio::spawn(async move {
            inner.dispatch_loop().await;
        }));

        let scheduled = self.inner.store.load_scheduled_executions().await?;
        let count = scheduled.len();
        for item in scheduled {
            let delay = (item.scheduled_for - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if delay.is_zero() {
                if let Err(e) = self.execute_workflow(&item.workflow_id, item.input).await {
                    warn!(workflow_id = %item.workflow_id, error = %e, "Scheduled execution rejected");
                }
                continue;
            }

            let engine = self.clone();
            let shutdown = self.inner.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        if let Err(e) = engine.execute_workflow(&item.workflow_id, item.input).await {
                            warn!(workflow_id = %item.workflow_id, error = %e, "Scheduled execution rejected");
                        }
                    }
                }
            });
        }

        info!(
            max_concurrent_executions = self.inner.config.max_concurrent_executions,
            scheduled = count,
            "Workflow engine started"
        );
        Ok(())
    }

    /// Stop admitting executions and wait for running ones, up to the shutdown timeout
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("Shutting down workflow engine");
        self.inner.shutdown.cancel();

        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_timeout;
        loop {
            let running = self.inner.running.load(Ordering::SeqCst);
            if running == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(running, "Shutdown timeout, executions still running");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        info!("Workflow engine shutdown complete");
    }
}

impl EngineInner {
    fn emit(&self, event: Event) {
        self.services.events.publish(event);
    }

    fn handle(&self, id: Uuid) -> OrchestratorResult<Arc<ExecutionHandle>> {
        self.executions
            .get(&id)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| OrchestratorError::not_found("execution", id))
    }

    fn enqueue(&self, id: Uuid) {
        self.pending.lock().push_back(id);
        self.wake.notify_one();
    }

    async fn persist(&self, handle: &ExecutionHandle) {
        let snapshot = handle.snapshot();
        if let Err(e) = self.store.save_execution_state(&snapshot).await {
            warn!(execution_id = %handle.id, error = %e, "Failed to persist execution state");
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        debug!("Dispatcher started");
        loop {
            self.admit();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
            }
        }
        debug!("Dispatcher stopped");
    }

    /// Start queued executions while slots are free
    fn admit(self: &Arc<Self>) {
        let mut pending = self.pending.lock();
        while self.running.load(Ordering::SeqCst) < self.config.max_concurrent_executions {
            let Some(id) = pending.pop_front() else {
                break;
            };
            let Some(handle) = self.executions.get(&id).map(|h| Arc::clone(h.value())) else {
                continue;
            };
            let Some(activation) = handle.activate() else {
                continue;
            };

            self.running.fetch_add(1, Ordering::SeqCst);
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.run_execution(handle, activation).await;
            });
        }
    }

    async fn run_execution(self: Arc<Self>, handle: Arc<ExecutionHandle>, activation: Activation) {
        let id = handle.id;
        let (event_type, mut steps) = match activation {
            Activation::Start => (
                types::EXECUTION_STARTED,
                handle
                    .definition
                    .root_steps()
                    .into_iter()
                    .map(|s| s.id.clone())
                    .collect::<Vec<_>>(),
            ),
            Activation::Resume(frontier) => (types::EXECUTION_RESUMED, frontier),
        };

        info!(
            execution_id = %id,
            workflow_id = %handle.definition.id,
            steps = ?steps,
            "Execution running"
        );
        self.emit(
            Event::new(event_type)
                .with_execution(id)
                .with_correlation(Some(id.to_string()))
                .with_data(json!({"workflow_id": handle.definition.id})),
        );
        self.persist(&handle).await;
        handle.publish_status();

        let walk = Walk::new(Arc::clone(&self.services), Arc::clone(&handle));
        let status = loop {
            let outcome = self.walk_within_budget(&walk, &handle, steps).await;
            match handle.settle(outcome) {
                Settled::Continue(next) => steps = next,
                Settled::Done { status, changed } => break changed.then_some(status),
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.wake.notify_one();

        match status {
            Some(ExecutionStatus::Completed) => {
                info!(execution_id = %id, "Execution completed");
                self.emit(
                    Event::new(types::EXECUTION_COMPLETED)
                        .with_execution(id)
                        .with_correlation(Some(id.to_string())),
                );
            }
            Some(ExecutionStatus::Failed) => {
                let last_error = handle.snapshot().last_error;
                error!(
                    execution_id = %id,
                    error = ?last_error.as_ref().map(|e| e.to_string()),
                    "Execution failed"
                );
                self.emit(
                    Event::new(types::EXECUTION_FAILED)
                        .with_execution(id)
                        .with_correlation(Some(id.to_string()))
                        .with_severity(Severity::Error)
                        .with_data(json!({"error": last_error})),
                );
            }
            _ => debug!(execution_id = %id, status = %handle.status(), "Walk returned"),
        }

        self.persist(&handle).await;
        handle.publish_status();
    }

    async fn walk_within_budget(
        &self,
        walk: &Walk,
        handle: &ExecutionHandle,
        steps: Vec<String>,
    ) -> Result<(), AgentError> {
        let run = walk.walk_sequence(steps, None);
        let Some(budget) = handle.definition.settings.max_execution_time else {
            return run.await;
        };

        let remaining = handle.remaining_budget(budget);
        match tokio::time::timeout(remaining, run).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AgentError::timeout(format!(
                "execution {} exceeded its {}ms time budget",
                handle.id,
                budget.as_millis()
            ))),
        }
    }
}
