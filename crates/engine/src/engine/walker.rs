//! Step graph walking
//!
//! One [`Walk`] drives one execution. Steps are walked depth-first along
//! their success or failure edges. Parallel steps fan out with `join_all`;
//! each branch collects its variable updates in a [`Scope`] that is merged
//! into the execution in declaration order once every branch has joined, so
//! the merged bag does not depend on branch timing.

use std::sync::Arc;
use std::time::Duration;

use fleetflow_core::{
    codes, events::types, AgentError, AgentTask, Event, OrchestratorError, Severity,
    SharedEventBus, StepCondition, StepType, TaskContext, TaskPriority, WorkflowStep,
};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::conditions::evaluate_conditions;
use super::handle::{Checkpoint, ExecutionHandle};
use super::interpolate::interpolate_map;
use super::DEFAULT_STEP_TASK_TYPE;
use crate::queue::JobOptions;
use crate::registry::AgentRegistry;
use crate::webhook::{WebhookClient, WebhookRequest};

/// Collaborators every walk needs
pub(crate) struct StepServices {
    pub registry: Arc<AgentRegistry>,
    pub webhook: Arc<dyn WebhookClient>,
    pub events: SharedEventBus,
}

#[derive(Debug, Clone)]
enum VarUpdate {
    Merge(Map<String, Value>),
    Set(String, Value),
}

/// Variable updates made inside one parallel branch, held until the join
#[derive(Default)]
pub(crate) struct Scope {
    parent: Option<Arc<Scope>>,
    updates: Mutex<Vec<VarUpdate>>,
}

impl Scope {
    fn child(parent: Option<Arc<Scope>>) -> Arc<Self> {
        Arc::new(Self {
            parent,
            updates: Mutex::new(Vec::new()),
        })
    }
}

fn apply_update(vars: &mut Map<String, Value>, update: VarUpdate) {
    match update {
        VarUpdate::Merge(map) => vars.extend(map),
        VarUpdate::Set(name, value) => {
            vars.insert(name, value);
        }
    }
}

#[derive(Clone)]
pub(crate) struct Walk {
    services: Arc<StepServices>,
    handle: Arc<ExecutionHandle>,
}

impl Walk {
    pub fn new(services: Arc<StepServices>, handle: Arc<ExecutionHandle>) -> Self {
        Self { services, handle }
    }

    /// Walk `step_ids` one after another, stopping at the first unhandled failure
    pub fn walk_sequence(
        &self,
        step_ids: Vec<String>,
        scope: Option<Arc<Scope>>,
    ) -> BoxFuture<'static, Result<(), AgentError>> {
        let this = self.clone();
        async move {
            for step_id in step_ids {
                this.walk_step(step_id, scope.clone()).await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Walk `step_ids` concurrently; outcomes are returned in declaration order
    async fn fan_out(
        &self,
        step_ids: &[String],
        scope: Option<&Arc<Scope>>,
    ) -> Vec<Result<(), AgentError>> {
        let scopes: Vec<Arc<Scope>> = step_ids
            .iter()
            .map(|_| Scope::child(scope.cloned()))
            .collect();

        let outcomes = join_all(
            step_ids
                .iter()
                .zip(&scopes)
                .map(|(id, child)| self.walk_step(id.clone(), Some(child.clone()))),
        )
        .await;

        for child in scopes {
            let updates = std::mem::take(&mut *child.updates.lock());
            for update in updates {
                self.apply(scope, update);
            }
        }
        outcomes
    }

    /// Current variables as seen from `scope`
    fn variables(&self, scope: Option<&Arc<Scope>>) -> Map<String, Value> {
        let mut vars = self.handle.update(|e| e.variables.clone());

        let mut chain = Vec::new();
        let mut current = scope.cloned();
        while let Some(s) = current {
            current = s.parent.clone();
            chain.push(s);
        }
        for s in chain.iter().rev() {
            for update in s.updates.lock().iter() {
                apply_update(&mut vars, update.clone());
            }
        }
        vars
    }

    fn apply(&self, scope: Option<&Arc<Scope>>, update: VarUpdate) {
        match scope {
            Some(s) => s.updates.lock().push(update),
            None => self.handle.update(|e| match update {
                VarUpdate::Merge(map) => e.merge_variables(&Value::Object(map)),
                VarUpdate::Set(name, value) => e.set_variable(name, value),
            }),
        }
    }

    fn emit(&self, event_type: &str, severity: Severity, data: Value) {
        self.services.events.publish(
            Event::new(event_type)
                .with_execution(self.handle.id)
                .with_correlation(Some(self.handle.id.to_string()))
                .with_severity(severity)
                .with_data(data),
        );
    }

    /// A step that already finished (or is running elsewhere) is not walked twice
    fn already_handled(&self, step_id: &str) -> bool {
        use fleetflow_core::TaskStatus;
        self.handle.update(|e| {
            e.step_executions.get(step_id).is_some_and(|s| {
                matches!(
                    s.status,
                    TaskStatus::Completed | TaskStatus::Running | TaskStatus::Failed
                )
            })
        })
    }

    /// Retries allowed for `step`, capped by the workflow's `max_retries`
    fn retry_limit(&self, step: &WorkflowStep) -> u32 {
        let Some(policy) = &step.retry_policy else {
            return 0;
        };
        match self.handle.definition.settings.max_retries {
            Some(cap) => policy.max_attempts.min(cap),
            None => policy.max_attempts,
        }
    }

    pub fn walk_step(
        &self,
        step_id: String,
        scope: Option<Arc<Scope>>,
    ) -> BoxFuture<'static, Result<(), AgentError>> {
        let this = self.clone();
        async move { this.run_step(step_id, scope).await }.boxed()
    }

    async fn run_step(&self, step_id: String, scope: Option<Arc<Scope>>) -> Result<(), AgentError> {
        let Some(step) = self.handle.definition.step(&step_id).cloned() else {
            return Err(AgentError::new(
                codes::NOT_FOUND,
                format!("step {step_id} is not part of workflow {}", self.handle.definition.id),
            ));
        };
        let cancel = self.handle.cancel_token().clone();

        loop {
            match self.handle.checkpoint(&step.id) {
                Checkpoint::Proceed => {}
                Checkpoint::Parked => {
                    debug!(execution_id = %self.handle.id, step_id = %step.id, "Step parked while paused");
                    return Ok(());
                }
                Checkpoint::Stopped => return Ok(()),
            }
            if self.already_handled(&step.id) {
                return Ok(());
            }

            let vars = self.variables(scope.as_ref());
            if !step.conditions.is_empty() && !evaluate_conditions(&step.conditions, &vars) {
                self.handle.update(|e| e.record_skipped(&step.id));
                debug!(execution_id = %self.handle.id, step_id = %step.id, "Step skipped");
                self.emit(
                    types::STEP_SKIPPED,
                    Severity::Info,
                    json!({"step_id": step.id}),
                );
                return Ok(());
            }

            let attempt = self
                .handle
                .update(|e| e.begin_step(&step.id, step.agent_id.as_deref()));
            self.emit(
                types::STEP_STARTED,
                Severity::Info,
                json!({"step_id": step.id, "type": step.step_type, "attempt": attempt}),
            );

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = self.dispatch(&step, attempt, &vars, scope.as_ref()) => Some(outcome),
            };
            // Cancelled: whatever the step produced is discarded
            let Some(outcome) = outcome else {
                return Ok(());
            };
            if cancel.is_cancelled() {
                return Ok(());
            }

            match outcome {
                Ok(result) => {
                    let recorded = self
                        .handle
                        .update(|e| e.record_success(&step.id, attempt, result.clone()));
                    if !recorded {
                        return Ok(());
                    }
                    self.patch_joined_parents(&step.id, &result);
                    self.apply_result(&step, result, scope.as_ref());
                    self.emit(
                        types::STEP_COMPLETED,
                        Severity::Info,
                        json!({"step_id": step.id, "attempt": attempt}),
                    );

                    if step.step_type == StepType::Parallel {
                        let outcomes = self.fan_out(&step.on_success, scope.as_ref()).await;
                        return outcomes.into_iter().collect();
                    }
                    return self.walk_sequence(step.on_success.clone(), scope).await;
                }
                Err(err) => {
                    let err = err.with_source(step.id.clone());
                    let recorded = self
                        .handle
                        .update(|e| e.record_failure(&step.id, attempt, err.clone()));
                    if !recorded {
                        return Ok(());
                    }
                    warn!(
                        execution_id = %self.handle.id,
                        step_id = %step.id,
                        attempt,
                        error = %err,
                        "Step failed"
                    );
                    self.emit(
                        types::STEP_FAILED,
                        Severity::Error,
                        json!({"step_id": step.id, "attempt": attempt, "error": err}),
                    );

                    if !step.on_failure.is_empty() {
                        return self.walk_sequence(step.on_failure.clone(), scope).await;
                    }

                    let retries = self.handle.update(|e| e.step_retry_count(&step.id));
                    if err.is_permanent() || retries >= self.retry_limit(&step) {
                        return Err(err);
                    }

                    let delay = step
                        .retry_policy
                        .as_ref()
                        .map_or(Duration::ZERO, |p| p.delay_for_attempt(retries));
                    let retry = self.handle.update(|e| e.record_retry(&step.id));
                    debug!(
                        execution_id = %self.handle.id,
                        step_id = %step.id,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "Step retry scheduled"
                    );
                    self.emit(
                        types::STEP_RETRY_SCHEDULED,
                        Severity::Warning,
                        json!({"step_id": step.id, "retry": retry, "delay_ms": delay.as_millis() as u64}),
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Write a late branch result into parallel parents that already joined
    ///
    /// A branch parked by a pause finishes after its parent recorded `null`
    /// for it. Parents still joining have no result yet and are left alone.
    fn patch_joined_parents(&self, step_id: &str, result: &Value) {
        let parents = self
            .handle
            .definition
            .steps
            .iter()
            .filter(|s| s.step_type == StepType::Parallel && s.branches.iter().any(|b| b == step_id));

        for parent in parents {
            let patched = self.handle.update(|e| {
                let joined = match e.step_results.get_mut(&parent.id) {
                    Some(Value::Object(results)) => {
                        results.insert(step_id.to_string(), result.clone());
                        Value::Object(results.clone())
                    }
                    _ => return false,
                };
                e.set_variable(step_id, result.clone());
                if let Some(name) = parent.output_variable() {
                    e.set_variable(name, joined);
                }
                true
            });
            if patched {
                debug!(
                    execution_id = %self.handle.id,
                    step_id,
                    parent_id = %parent.id,
                    "Late branch result joined"
                );
            }
        }
    }

    fn apply_result(&self, step: &WorkflowStep, result: Value, scope: Option<&Arc<Scope>>) {
        if let Value::Object(map) = &result {
            self.apply(scope, VarUpdate::Merge(map.clone()));
        }
        if let Some(name) = step.output_variable() {
            self.apply(scope, VarUpdate::Set(name.to_string(), result));
        }
    }

    async fn dispatch(
        &self,
        step: &WorkflowStep,
        attempt: u32,
        vars: &Map<String, Value>,
        scope: Option<&Arc<Scope>>,
    ) -> Result<Value, AgentError> {
        let config = interpolate_map(&step.config, vars);

        match step.step_type {
            StepType::Agent => self.run_agent(step, attempt, &config, vars).await,
            StepType::Condition => {
                let conditions: Vec<StepCondition> = match config.get("conditions") {
                    Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
                        AgentError::new(
                            codes::VALIDATION_ERROR,
                            format!("invalid conditions on step {}: {e}", step.id),
                        )
                    })?,
                    None => Vec::new(),
                };
                Ok(Value::Bool(evaluate_conditions(&conditions, vars)))
            }
            StepType::Parallel => {
                let outcomes = self.fan_out(&step.branches, scope).await;
                let failed = outcomes.iter().filter(|o| o.is_err()).count();
                if failed > 0 {
                    debug!(
                        execution_id = %self.handle.id,
                        step_id = %step.id,
                        failed,
                        "Parallel branches failed"
                    );
                }

                let results = self.handle.update(|e| {
                    step.branches
                        .iter()
                        .map(|b| (b.clone(), e.step_results.get(b).cloned().unwrap_or(Value::Null)))
                        .collect::<Map<String, Value>>()
                });
                Ok(Value::Object(results))
            }
            StepType::Delay => {
                let ms = config
                    .get("duration_ms")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        AgentError::new(
                            codes::VALIDATION_ERROR,
                            format!("delay step {} requires duration_ms", step.id),
                        )
                    })?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Value::Null)
            }
            StepType::Webhook => {
                let request = WebhookRequest::from_step_config(&config)
                    .map_err(OrchestratorError::into_agent_error)?;
                self.services.webhook.call(&request).await
            }
        }
    }

    async fn run_agent(
        &self,
        step: &WorkflowStep,
        attempt: u32,
        config: &Map<String, Value>,
        vars: &Map<String, Value>,
    ) -> Result<Value, AgentError> {
        let agent_id = step.agent_id.as_deref().ok_or_else(|| {
            AgentError::new(
                codes::VALIDATION_ERROR,
                format!("agent step {} has no agent_id", step.id),
            )
        })?;
        let worker = self
            .services
            .registry
            .require(agent_id)
            .map_err(OrchestratorError::into_agent_error)?;

        let kind = config
            .get("task_type")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_STEP_TASK_TYPE);
        let payload = match config.get("payload") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(AgentError::new(
                    codes::VALIDATION_ERROR,
                    format!("payload of step {} must be an object", step.id),
                ))
            }
            None => vars.clone(),
        };

        let context = TaskContext::new()
            .with_correlation_id(self.handle.id.to_string())
            .with_source("workflow")
            .with_custom("workflow_id", json!(self.handle.definition.id))
            .with_custom("step_id", json!(step.id));
        let mut task = AgentTask::new(agent_id, kind, payload).with_context(context);
        if let Some(priority) = config
            .get("priority")
            .and_then(|p| serde_json::from_value::<TaskPriority>(p.clone()).ok())
        {
            task = task.with_priority(priority);
        }
        let task_id = task.id;
        self.handle
            .update(|e| e.attach_task(&step.id, attempt, task_id));

        let run = worker.execute(task, JobOptions::single_attempt());
        let result = match config.get("timeout_ms").and_then(Value::as_u64) {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), run).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(AgentError::timeout(format!(
                        "step {} timed out after {ms}ms",
                        step.id
                    )))
                }
            },
            None => run.await,
        };
        result.map_err(OrchestratorError::into_agent_error)
    }
}
