// Workflow definitions
//
// A workflow is a graph of steps connected by success edges, failure edges
// and (for parallel steps) branch lists. Roots are steps nothing points to.
// Definitions are validated once at registration; the engine assumes a valid
// acyclic graph afterwards.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::retry::RetryPolicy;
use crate::serde_util::option_duration_millis;

// ============================================================================
// Conditions
// ============================================================================

/// Comparator used by a step condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    #[serde(alias = "equals", alias = "==")]
    Eq,
    #[serde(alias = "not_equals", alias = "neq", alias = "!=")]
    Ne,
    #[serde(alias = "greater_than", alias = ">")]
    Gt,
    #[serde(alias = "less_than", alias = "<")]
    Lt,
    #[serde(alias = "greater_than_or_equal", alias = ">=")]
    Gte,
    #[serde(alias = "less_than_or_equal", alias = "<=")]
    Lte,
    /// Field value is a member of the expected array
    In,
    /// Field string contains the expected substring, or field array contains the expected value
    Contains,
}

/// How a condition's result folds into the running result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

/// One predicate over the execution's variable bag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCondition {
    /// Variable name; dotted paths descend into objects
    pub field: String,

    #[serde(alias = "op")]
    pub operator: ConditionOperator,

    #[serde(default)]
    pub value: Value,

    #[serde(default, alias = "logicalOperator")]
    pub logical_operator: LogicalOperator,
}

impl StepCondition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            logical_operator: LogicalOperator::And,
        }
    }

    pub fn or(mut self) -> Self {
        self.logical_operator = LogicalOperator::Or;
        self
    }
}

// ============================================================================
// Steps
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Agent,
    Condition,
    Parallel,
    Delay,
    Webhook,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepType::Agent => write!(f, "agent"),
            StepType::Condition => write!(f, "condition"),
            StepType::Parallel => write!(f, "parallel"),
            StepType::Delay => write!(f, "delay"),
            StepType::Webhook => write!(f, "webhook"),
        }
    }
}

/// One node of the workflow graph
///
/// `config` keys by step type:
/// - agent: `task_type`, `payload`, `priority`, `timeout_ms`
/// - condition: `conditions` (list of [`StepCondition`])
/// - delay: `duration_ms`
/// - webhook: `url`, `method`, `headers`, `body`, `timeout_ms`
/// - any: `output_variable` stores the raw result under that variable name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "type")]
    pub step_type: StepType,

    /// Target agent for agent steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    #[serde(default)]
    pub config: Map<String, Value>,

    #[serde(default)]
    pub on_success: Vec<String>,

    #[serde(default)]
    pub on_failure: Vec<String>,

    /// Sub-steps fanned out by a parallel step
    #[serde(default)]
    pub branches: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    /// Guard evaluated before dispatch; false skips the step
    #[serde(default)]
    pub conditions: Vec<StepCondition>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, step_type: StepType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type,
            agent_id: None,
            config: Map::new(),
            on_success: vec![],
            on_failure: vec![],
            branches: vec![],
            retry_policy: None,
            conditions: vec![],
        }
    }

    pub fn agent(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let mut step = Self::new(id, StepType::Agent);
        step.agent_id = Some(agent_id.into());
        step
    }

    pub fn parallel<I, S>(id: impl Into<String>, branches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut step = Self::new(id, StepType::Parallel);
        step.branches = branches.into_iter().map(Into::into).collect();
        step
    }

    pub fn delay(id: impl Into<String>, duration: Duration) -> Self {
        Self::new(id, StepType::Delay)
            .with_config("duration_ms", Value::from(duration.as_millis() as u64))
    }

    pub fn webhook(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(id, StepType::Webhook).with_config("url", Value::String(url.into()))
    }

    pub fn condition(id: impl Into<String>, conditions: Vec<StepCondition>) -> Self {
        let conditions = serde_json::to_value(conditions).unwrap_or(Value::Array(vec![]));
        Self::new(id, StepType::Condition).with_config("conditions", conditions)
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.on_success.push(next.into());
        self
    }

    pub fn on_failure(mut self, next: impl Into<String>) -> Self {
        self.on_failure.push(next.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn when(mut self, condition: StepCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// All outgoing edges: success, failure, then branches
    pub fn edges(&self) -> impl Iterator<Item = &String> {
        self.on_success
            .iter()
            .chain(self.on_failure.iter())
            .chain(self.branches.iter())
    }

    /// `config.output_variable`, if set
    pub fn output_variable(&self) -> Option<&str> {
        self.config.get("output_variable").and_then(Value::as_str)
    }
}

// ============================================================================
// Definition
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Manual,
    Schedule,
    Event,
}

/// How a workflow is started; informational for the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TriggerConfig {
    #[serde(default, rename = "type")]
    pub trigger_type: TriggerType,

    #[serde(default)]
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkflowSettings {
    /// Wall-clock budget for one execution
    #[serde(
        default,
        with = "option_duration_millis",
        alias = "max_execution_time_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_execution_time: Option<Duration>,

    /// Upper bound on retries of any single step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default = "default_workflow_version")]
    pub version: u32,

    pub steps: Vec<WorkflowStep>,

    #[serde(default)]
    pub trigger: TriggerConfig,

    /// Defaults for the execution's variable bag; input overrides them
    #[serde(default)]
    pub variables: Map<String, Value>,

    #[serde(default)]
    pub settings: WorkflowSettings,
}

fn default_workflow_version() -> u32 {
    1
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            version: default_workflow_version(),
            steps,
            trigger: TriggerConfig::default(),
            variables: Map::new(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps no other step references, in declaration order
    pub fn root_steps(&self) -> Vec<&WorkflowStep> {
        let referenced: HashSet<&String> = self.steps.iter().flat_map(|s| s.edges()).collect();
        self.steps
            .iter()
            .filter(|s| !referenced.contains(&s.id))
            .collect()
    }

    /// Check graph shape and per-type configuration
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.id.trim().is_empty() {
            return Err(OrchestratorError::validation("workflow id is empty"));
        }
        if self.steps.is_empty() {
            return Err(OrchestratorError::validation(format!(
                "workflow {} has no steps",
                self.id
            )));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(OrchestratorError::validation(format!(
                    "workflow {} has a step with an empty id",
                    self.id
                )));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(OrchestratorError::validation(format!(
                    "workflow {} has duplicate step id {}",
                    self.id, step.id
                )));
            }
        }

        for step in &self.steps {
            for target in step.edges() {
                if !ids.contains(target.as_str()) {
                    return Err(OrchestratorError::validation(format!(
                        "step {} references unknown step {}",
                        step.id, target
                    )));
                }
                if target == &step.id {
                    return Err(OrchestratorError::validation(format!(
                        "step {} references itself",
                        step.id
                    )));
                }
            }
            validate_step_config(step)?;
        }

        if self.root_steps().is_empty() {
            return Err(OrchestratorError::validation(format!(
                "workflow {} has no root step",
                self.id
            )));
        }

        if self.has_cycles() {
            return Err(OrchestratorError::validation(format!(
                "workflow {} contains a cycle",
                self.id
            )));
        }

        Ok(())
    }

    /// Kahn's algorithm over all edge kinds
    pub fn has_cycles(&self) -> bool {
        let mut in_degree: HashMap<&str, usize> =
            self.steps.iter().map(|s| (s.id.as_str(), 0)).collect();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

        for step in &self.steps {
            for target in step.edges() {
                adjacency
                    .entry(step.id.as_str())
                    .or_default()
                    .push(target.as_str());
                *in_degree.entry(target.as_str()).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter_map(|(id, &degree)| (degree == 0).then_some(*id))
            .collect();

        let mut processed = 0;
        while let Some(id) = queue.pop_front() {
            processed += 1;
            if let Some(neighbors) = adjacency.remove(id) {
                for neighbor in neighbors {
                    if let Some(degree) = in_degree.get_mut(neighbor) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(neighbor);
                        }
                    }
                }
            }
        }

        processed != in_degree.len()
    }
}

const LEADING_OR: &str = "starts its conditions with `or`, which has nothing to combine with";

/// The first condition seeds the fold, so its operator is never read
fn leads_with_or(conditions: &[StepCondition]) -> bool {
    conditions
        .first()
        .is_some_and(|c| c.logical_operator == LogicalOperator::Or)
}

fn validate_step_config(step: &WorkflowStep) -> OrchestratorResult<()> {
    let invalid = |msg: &str| {
        Err(OrchestratorError::validation(format!(
            "{} step {} {}",
            step.step_type, step.id, msg
        )))
    };

    if leads_with_or(&step.conditions) {
        return invalid(LEADING_OR);
    }

    match step.step_type {
        StepType::Agent => {
            if step.agent_id.as_deref().map_or(true, |a| a.trim().is_empty()) {
                return invalid("has no agent_id");
            }
        }
        StepType::Parallel => {
            if step.branches.is_empty() {
                return invalid("has no branches");
            }
        }
        StepType::Delay => {
            if !step.config.get("duration_ms").is_some_and(Value::is_u64) {
                return invalid("needs a non-negative integer duration_ms");
            }
        }
        StepType::Webhook => {
            if !step.config.get("url").is_some_and(Value::is_string) {
                return invalid("needs a url");
            }
        }
        StepType::Condition => {
            let parsed = step
                .config
                .get("conditions")
                .cloned()
                .map(serde_json::from_value::<Vec<StepCondition>>);
            match parsed {
                Some(Ok(conditions)) if leads_with_or(&conditions) => {
                    return invalid(LEADING_OR);
                }
                Some(Ok(_)) => {}
                _ => return invalid("needs a conditions list"),
            }
        }
    }
    Ok(())
}
