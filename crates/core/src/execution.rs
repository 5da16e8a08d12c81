// Workflow executions
//
// The execution record is owned by one dispatch path. Recording helpers keep
// three invariants:
// - status never leaves a terminal state
// - a step result is written at most once per attempt; stale attempts are ignored
// - completed_steps and failed_steps never share a step id

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::AgentError;
use crate::task::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Paused) | (Running, Completed) | (Running, Failed) | (Running, Cancelled) => {
                true
            }
            // An in-flight step may still fail an execution paused underneath it
            (Paused, Running) | (Paused, Cancelled) | (Paused, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Paused => write!(f, "paused"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-step bookkeeping inside an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    pub execution_id: Uuid,
    pub status: TaskStatus,

    /// Attempts started, 1-based once the step has run
    pub attempt: u32,

    /// Retries scheduled for this step
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub input: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,

    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,

    pub step_results: BTreeMap<String, Value>,
    pub step_errors: BTreeMap<String, AgentError>,
    pub step_executions: BTreeMap<String, StepExecution>,

    pub variables: Map<String, Value>,

    /// Retries scheduled across all steps
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<AgentError>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    /// New pending execution; `input` object keys override `defaults`
    pub fn new(workflow_id: impl Into<String>, input: Value, defaults: &Map<String, Value>) -> Self {
        let mut variables = defaults.clone();
        if let Value::Object(obj) = &input {
            for (k, v) in obj {
                variables.insert(k.clone(), v.clone());
            }
        }
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            input,
            current_step: None,
            completed_steps: vec![],
            failed_steps: vec![],
            skipped_steps: vec![],
            step_results: BTreeMap::new(),
            step_errors: BTreeMap::new(),
            step_executions: BTreeMap::new(),
            variables,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`; returns false (and changes nothing) for illegal transitions
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        true
    }

    pub fn is_step_completed(&self, step_id: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step_id)
    }

    /// Start a new attempt of `step_id`; returns the attempt number
    pub fn begin_step(&mut self, step_id: &str, agent_id: Option<&str>) -> u32 {
        let execution_id = self.id;
        let entry = self
            .step_executions
            .entry(step_id.to_string())
            .or_insert_with(|| StepExecution {
                step_id: step_id.to_string(),
                execution_id,
                status: TaskStatus::Pending,
                attempt: 0,
                retry_count: 0,
                agent_id: None,
                task_id: None,
                started_at: None,
                completed_at: None,
            });
        entry.attempt += 1;
        entry.status = TaskStatus::Running;
        entry.agent_id = agent_id.map(str::to_string);
        entry.task_id = None;
        entry.started_at = Some(Utc::now());
        entry.completed_at = None;
        let attempt = entry.attempt;

        self.current_step = Some(step_id.to_string());
        self.touch();
        attempt
    }

    pub fn attach_task(&mut self, step_id: &str, attempt: u32, task_id: Uuid) {
        if let Some(entry) = self.step_executions.get_mut(step_id) {
            if entry.attempt == attempt {
                entry.task_id = Some(task_id);
            }
        }
    }

    fn is_current_attempt(&self, step_id: &str, attempt: u32) -> bool {
        self.step_executions
            .get(step_id)
            .is_some_and(|e| e.attempt == attempt && e.status == TaskStatus::Running)
    }

    /// Record a successful attempt. Ignored for stale attempts.
    pub fn record_success(&mut self, step_id: &str, attempt: u32, result: Value) -> bool {
        if !self.is_current_attempt(step_id, attempt) {
            return false;
        }
        if let Some(entry) = self.step_executions.get_mut(step_id) {
            entry.status = TaskStatus::Completed;
            entry.completed_at = Some(Utc::now());
        }
        self.step_results.insert(step_id.to_string(), result);
        self.step_errors.remove(step_id);
        self.failed_steps.retain(|s| s != step_id);
        if !self.is_step_completed(step_id) {
            self.completed_steps.push(step_id.to_string());
        }
        self.touch();
        true
    }

    /// Record a failed attempt. Ignored for stale attempts.
    pub fn record_failure(&mut self, step_id: &str, attempt: u32, error: AgentError) -> bool {
        if !self.is_current_attempt(step_id, attempt) {
            return false;
        }
        if let Some(entry) = self.step_executions.get_mut(step_id) {
            entry.status = TaskStatus::Failed;
            entry.completed_at = Some(Utc::now());
        }
        if !self.is_step_completed(step_id) && !self.failed_steps.iter().any(|s| s == step_id) {
            self.failed_steps.push(step_id.to_string());
        }
        self.step_errors.insert(step_id.to_string(), error);
        self.touch();
        true
    }

    pub fn record_skipped(&mut self, step_id: &str) {
        if !self.skipped_steps.iter().any(|s| s == step_id) {
            self.skipped_steps.push(step_id.to_string());
        }
        self.touch();
    }

    /// Count a scheduled retry of `step_id`; returns the step's retry count so far
    pub fn record_retry(&mut self, step_id: &str) -> u32 {
        self.retry_count += 1;
        let count = match self.step_executions.get_mut(step_id) {
            Some(entry) => {
                entry.retry_count += 1;
                entry.status = TaskStatus::Retry;
                entry.retry_count
            }
            None => 1,
        };
        self.touch();
        count
    }

    pub fn step_retry_count(&self, step_id: &str) -> u32 {
        self.step_executions
            .get(step_id)
            .map_or(0, |e| e.retry_count)
    }

    /// Merge object keys into the variable bag
    pub fn merge_variables(&mut self, value: &Value) {
        if let Value::Object(obj) = value {
            for (k, v) in obj {
                self.variables.insert(k.clone(), v.clone());
            }
            self.touch();
        }
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// An execution the persistence layer wants started at a given time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledExecution {
    pub workflow_id: String,

    #[serde(default)]
    pub input: Value,

    pub scheduled_for: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn execution() -> WorkflowExecution {
        WorkflowExecution::new("wf", json!({"x": 1}), &Map::new())
    }

    #[test]
    fn test_input_overrides_defaults() {
        let mut defaults = Map::new();
        defaults.insert("x".into(), json!(0));
        defaults.insert("y".into(), json!("default"));
        let exec = WorkflowExecution::new("wf", json!({"x": 1}), &defaults);
        assert_eq!(exec.variables["x"], json!(1));
        assert_eq!(exec.variables["y"], json!("default"));
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut exec = execution();
        assert!(exec.transition(ExecutionStatus::Running));
        assert!(exec.transition(ExecutionStatus::Completed));
        for next in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Paused,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert!(!exec.transition(next));
            assert_eq!(exec.status, ExecutionStatus::Completed);
        }
    }

    #[test]
    fn test_pause_resume_alternates() {
        let mut exec = execution();
        assert!(!exec.transition(ExecutionStatus::Paused));
        assert!(exec.transition(ExecutionStatus::Running));
        assert!(exec.transition(ExecutionStatus::Paused));
        assert!(exec.transition(ExecutionStatus::Running));
        assert!(exec.transition(ExecutionStatus::Cancelled));
        assert!(exec.completed_at.is_some());
    }

    #[test]
    fn test_stale_attempt_is_ignored() {
        let mut exec = execution();
        let first = exec.begin_step("A", Some("echo"));
        let second = exec.begin_step("A", Some("echo"));
        assert_eq!((first, second), (1, 2));

        assert!(!exec.record_success("A", first, json!("stale")));
        assert!(exec.step_results.get("A").is_none());

        assert!(exec.record_success("A", second, json!("fresh")));
        assert!(!exec.record_success("A", second, json!("again")));
        assert_eq!(exec.step_results["A"], json!("fresh"));
    }

    #[test]
    fn test_completed_and_failed_stay_disjoint() {
        let mut exec = execution();
        let attempt = exec.begin_step("A", None);
        exec.record_failure("A", attempt, AgentError::retryable("boom"));
        assert_eq!(exec.failed_steps, vec!["A".to_string()]);

        exec.record_retry("A");
        let attempt = exec.begin_step("A", None);
        exec.record_success("A", attempt, json!({"ok": true}));

        assert_eq!(exec.completed_steps, vec!["A".to_string()]);
        assert!(exec.failed_steps.is_empty());
        assert!(exec.step_errors.is_empty());
        assert_eq!(exec.step_retry_count("A"), 1);
        assert_eq!(exec.retry_count, 1);
    }

    #[test]
    fn test_merge_only_objects() {
        let mut exec = execution();
        exec.merge_variables(&json!({"summary": "hi"}));
        exec.merge_variables(&json!("not an object"));
        assert_eq!(exec.variables["summary"], json!("hi"));
        assert_eq!(exec.variables.len(), 2);
    }
}
