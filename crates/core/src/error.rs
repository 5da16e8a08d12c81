// Error Taxonomy
//
// Two layers:
// - OrchestratorError: what an operation on the registry/worker/queue/engine returns
// - AgentError: a serializable value attached to the task or step that produced it
//
// Every OrchestratorError can be converted into an AgentError so failures are
// never dropped on the way from a worker up to a workflow execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::Severity;

/// Result type alias for orchestration operations
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

// ============================================================================
// Error codes
// ============================================================================

/// Stable error codes carried by [`AgentError::code`]
pub mod codes {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const AGENT_NOT_FOUND: &str = "AGENT_NOT_FOUND";
    pub const DUPLICATE_ID: &str = "DUPLICATE_ID";
    pub const CAPABILITY_MISMATCH: &str = "CAPABILITY_MISMATCH";
    pub const EXECUTION_FAILED: &str = "EXECUTION_FAILED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const CONCURRENCY_LIMIT: &str = "CONCURRENCY_LIMIT_REACHED";
    pub const QUEUE_FULL: &str = "QUEUE_FULL";
    pub const INVALID_STATE: &str = "INVALID_STATE";
    pub const AGENT_NOT_RUNNING: &str = "AGENT_NOT_RUNNING";
    pub const CANCELLED: &str = "CANCELLED";
    pub const WEBHOOK_FAILED: &str = "WEBHOOK_FAILED";
    pub const STORE_ERROR: &str = "STORE_ERROR";
    pub const SERIALIZATION_ERROR: &str = "SERIALIZATION_ERROR";
}

// ============================================================================
// AgentError
// ============================================================================

/// Failure value attached to a task or workflow step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentError {
    /// Machine-readable code (see [`codes`])
    pub code: String,

    /// Human-readable message
    pub message: String,

    /// Whether the caller may retry the operation that produced this error
    pub retryable: bool,

    pub severity: Severity,

    pub timestamp: DateTime<Utc>,

    /// Step or task the error belongs to, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AgentError {
    /// Create an error with the given code, flagged non-retryable
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
            severity: Severity::Error,
            timestamp: Utc::now(),
            source_id: None,
            details: None,
        }
    }

    /// Execution failure the caller may retry
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(codes::EXECUTION_FAILED, message).with_retryable(true)
    }

    /// Execution failure that must not be retried
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::new(codes::EXECUTION_FAILED, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(codes::TIMEOUT, message).with_retryable(true)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(codes::CANCELLED, message).with_severity(Severity::Warning)
    }

    /// Failures that fail the same way on every attempt
    ///
    /// Retry loops skip these whatever the policy says. Everything else,
    /// including errors wrapped with the default `retryable: false`, is
    /// retried while a policy has attempts left.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.code.as_str(),
            codes::VALIDATION_ERROR
                | codes::NOT_FOUND
                | codes::AGENT_NOT_FOUND
                | codes::CAPABILITY_MISMATCH
                | codes::CANCELLED
        )
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Attach the id of the step or task that produced the error
    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source_id {
            Some(source) => write!(f, "[{}] {} ({})", self.code, self.message, source),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        Self::non_retryable(format!("{err:#}"))
    }
}

// ============================================================================
// OrchestratorError
// ============================================================================

/// Errors returned by orchestration operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed input (task, config, workflow definition)
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown execution, workflow, step or task id
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error("agent {agent_id} cannot handle task type {task_type}")]
    CapabilityMismatch { agent_id: String, task_type: String },

    /// Wrapped execution failure
    #[error("agent error: {0}")]
    Agent(AgentError),

    #[error("timeout: {0}")]
    Timeout(String),

    /// Soft limit: the caller should queue, not fail
    #[error("concurrency limit reached: {0}")]
    ConcurrencyLimitReached(usize),

    #[error("queue {queue} is full ({max_size} jobs)")]
    QueueFull { queue: String, max_size: usize },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("webhook error: {0}")]
    Webhook(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Error code this error maps to
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => codes::VALIDATION_ERROR,
            Self::NotFound { .. } => codes::NOT_FOUND,
            Self::AgentNotFound(_) => codes::AGENT_NOT_FOUND,
            Self::DuplicateId(_) => codes::DUPLICATE_ID,
            Self::CapabilityMismatch { .. } => codes::CAPABILITY_MISMATCH,
            Self::Agent(_) => codes::EXECUTION_FAILED,
            Self::Timeout(_) => codes::TIMEOUT,
            Self::ConcurrencyLimitReached(_) => codes::CONCURRENCY_LIMIT,
            Self::QueueFull { .. } => codes::QUEUE_FULL,
            Self::InvalidState(_) => codes::INVALID_STATE,
            Self::Store(_) => codes::STORE_ERROR,
            Self::Webhook(_) => codes::WEBHOOK_FAILED,
            Self::Serialization(_) => codes::SERIALIZATION_ERROR,
        }
    }

    /// Whether retrying the failed operation can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Agent(err) => err.retryable,
            Self::Timeout(_)
            | Self::ConcurrencyLimitReached(_)
            | Self::QueueFull { .. }
            | Self::Webhook(_)
            | Self::Store(_) => true,
            _ => false,
        }
    }

    /// Convert into the value attached to tasks and steps
    pub fn into_agent_error(self) -> AgentError {
        match self {
            Self::Agent(err) => err,
            other => AgentError::new(other.code(), other.to_string())
                .with_retryable(other.is_retryable()),
        }
    }
}

impl From<AgentError> for OrchestratorError {
    fn from(err: AgentError) -> Self {
        Self::Agent(err)
    }
}

impl From<&OrchestratorError> for AgentError {
    fn from(err: &OrchestratorError) -> Self {
        match err {
            OrchestratorError::Agent(inner) => inner.clone(),
            other => AgentError::new(other.code(), other.to_string())
                .with_retryable(other.is_retryable()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_error_defaults_to_non_retryable() {
        let err = AgentError::new(codes::EXECUTION_FAILED, "boom");
        assert!(!err.retryable);
        assert_eq!(err.severity, Severity::Error);
        assert_eq!(err.to_string(), "[EXECUTION_FAILED] boom");
    }

    #[test]
    fn test_agent_error_display_with_source() {
        let err = AgentError::retryable("flaky").with_source("step-a");
        assert!(err.retryable);
        assert_eq!(err.to_string(), "[EXECUTION_FAILED] flaky (step-a)");
    }

    #[test]
    fn test_orchestrator_error_conversion_keeps_code() {
        let err = OrchestratorError::CapabilityMismatch {
            agent_id: "writer".into(),
            task_type: "publish".into(),
        };
        let agent_err = AgentError::from(&err);
        assert_eq!(agent_err.code, codes::CAPABILITY_MISMATCH);
        assert!(!agent_err.retryable);
        assert!(agent_err.message.contains("writer"));
    }

    #[test]
    fn test_wrapped_agent_error_round_trips() {
        let inner = AgentError::retryable("rate limited");
        let err = OrchestratorError::from(inner.clone());
        assert!(err.is_retryable());
        assert_eq!(err.into_agent_error(), inner);
    }

    #[test]
    fn test_permanent_codes() {
        assert!(AgentError::new(codes::VALIDATION_ERROR, "missing field").is_permanent());
        assert!(AgentError::new(codes::AGENT_NOT_FOUND, "ghost").is_permanent());
        assert!(AgentError::cancelled("stopped").is_permanent());
        assert!(!AgentError::non_retryable("boom").is_permanent());
        assert!(!AgentError::from(anyhow::anyhow!("disk full")).is_permanent());
        assert!(!AgentError::new("DEMO_FAILURE", "custom").is_permanent());
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = OrchestratorError::Timeout("task took too long".into());
        assert!(err.is_retryable());
        assert_eq!(err.code(), codes::TIMEOUT);
    }
}
