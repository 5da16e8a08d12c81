//! Runtime state of one execution
//!
//! The execution record, the parked frontier and the activity flag share one
//! lock, so pause/resume/cancel and the walker's checkpoints always agree on
//! what happens next.

use std::sync::Arc;
use std::time::Duration;

use fleetflow_core::{
    AgentError, ExecutionStatus, OrchestratorError, OrchestratorResult, WorkflowDefinition,
    WorkflowExecution,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What the walker should do with the step it is about to start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Checkpoint {
    Proceed,
    /// Execution is paused; the step was parked for the next resume
    Parked,
    /// Execution was cancelled or already finished
    Stopped,
}

/// How an admitted execution starts walking
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Activation {
    Start,
    Resume(Vec<String>),
}

/// Outcome of a finished walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Settled {
    /// Resumed while steps were still in flight; walk the parked steps
    Continue(Vec<String>),
    Done {
        status: ExecutionStatus,
        changed: bool,
    },
}

/// Effect of a resume request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResumeAction {
    /// The walk is still running and continues on its own
    Continued,
    /// The execution must go back through admission
    Requeue,
}

struct HandleState {
    execution: WorkflowExecution,
    frontier: Vec<String>,
    active: bool,
    resume_requested: bool,
    deadline: Option<Instant>,
}

pub(crate) struct ExecutionHandle {
    pub id: Uuid,
    pub definition: Arc<WorkflowDefinition>,
    state: Mutex<HandleState>,
    cancel: CancellationToken,
    status_tx: watch::Sender<ExecutionStatus>,
}

impl ExecutionHandle {
    pub fn new(definition: Arc<WorkflowDefinition>, execution: WorkflowExecution) -> Self {
        let (status_tx, _) = watch::channel(execution.status);
        Self {
            id: execution.id,
            definition,
            state: Mutex::new(HandleState {
                execution,
                frontier: Vec::new(),
                active: false,
                resume_requested: false,
                deadline: None,
            }),
            cancel: CancellationToken::new(),
            status_tx,
        }
    }

    pub fn snapshot(&self) -> WorkflowExecution {
        self.state.lock().execution.clone()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.state.lock().execution.status
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Mutate the execution record under the handle lock
    pub fn update<R>(&self, f: impl FnOnce(&mut WorkflowExecution) -> R) -> R {
        f(&mut self.state.lock().execution)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionStatus> {
        self.status_tx.subscribe()
    }

    /// Push the current status to `wait_for_execution` callers
    pub fn publish_status(&self) {
        let status = self.status();
        self.status_tx.send_replace(status);
    }

    pub fn checkpoint(&self, step_id: &str) -> Checkpoint {
        let mut state = self.state.lock();
        match state.execution.status {
            ExecutionStatus::Running => Checkpoint::Proceed,
            ExecutionStatus::Paused => {
                if !state.frontier.iter().any(|s| s == step_id) {
                    state.frontier.push(step_id.to_string());
                }
                Checkpoint::Parked
            }
            _ => Checkpoint::Stopped,
        }
    }

    /// Claim the execution for a dispatcher slot
    ///
    /// Returns `None` when the execution no longer wants to run (cancelled
    /// while queued, already walking, or paused without a resume request).
    pub fn activate(&self) -> Option<Activation> {
        let mut state = self.state.lock();
        if state.active {
            return None;
        }
        let activation = match state.execution.status {
            ExecutionStatus::Pending => Activation::Start,
            ExecutionStatus::Paused if state.resume_requested => {
                state.resume_requested = false;
                Activation::Resume(std::mem::take(&mut state.frontier))
            }
            _ => return None,
        };
        if !state.execution.transition(ExecutionStatus::Running) {
            return None;
        }
        state.active = true;
        Some(activation)
    }

    /// Time left in the execution budget; the clock starts on first call
    pub fn remaining_budget(&self, budget: Duration) -> Duration {
        let mut state = self.state.lock();
        let deadline = *state.deadline.get_or_insert_with(|| Instant::now() + budget);
        deadline.saturating_duration_since(Instant::now())
    }

    /// Settle the execution after a walk returned
    pub fn settle(&self, outcome: Result<(), AgentError>) -> Settled {
        let mut state = self.state.lock();
        let status = state.execution.status;

        let next = match (status, outcome) {
            (ExecutionStatus::Running, Ok(())) if !state.frontier.is_empty() => {
                return Settled::Continue(std::mem::take(&mut state.frontier));
            }
            (ExecutionStatus::Running, Ok(())) => Some(ExecutionStatus::Completed),
            (ExecutionStatus::Running | ExecutionStatus::Paused, Err(err)) => {
                state.execution.last_error = Some(err);
                Some(ExecutionStatus::Failed)
            }
            _ => None,
        };

        let changed = next.is_some_and(|s| state.execution.transition(s));
        if state.execution.status.is_terminal() {
            state.frontier.clear();
        }
        state.active = false;
        Settled::Done {
            status: state.execution.status,
            changed,
        }
    }

    pub fn pause(&self) -> OrchestratorResult<()> {
        let mut state = self.state.lock();
        let status = state.execution.status;
        if status != ExecutionStatus::Running || !state.execution.transition(ExecutionStatus::Paused) {
            return Err(OrchestratorError::invalid_state(format!(
                "execution {} is {}, only running executions can be paused",
                self.id, status
            )));
        }
        Ok(())
    }

    pub fn resume(&self) -> OrchestratorResult<ResumeAction> {
        let mut state = self.state.lock();
        let status = state.execution.status;
        if status != ExecutionStatus::Paused {
            return Err(OrchestratorError::invalid_state(format!(
                "execution {} is {}, only paused executions can be resumed",
                self.id, status
            )));
        }
        if state.active {
            state.execution.transition(ExecutionStatus::Running);
            Ok(ResumeAction::Continued)
        } else {
            state.resume_requested = true;
            Ok(ResumeAction::Requeue)
        }
    }

    /// Cancel a non-terminal execution; returns whether a walk is still active
    pub fn cancel(&self) -> OrchestratorResult<bool> {
        let mut state = self.state.lock();
        let status = state.execution.status;
        if !state.execution.transition(ExecutionStatus::Cancelled) {
            return Err(OrchestratorError::invalid_state(format!(
                "execution {} is {} and cannot be cancelled",
                self.id, status
            )));
        }
        state.frontier.clear();
        state.resume_requested = false;
        let active = state.active;
        drop(state);
        self.cancel.cancel();
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetflow_core::WorkflowStep;
    use serde_json::{json, Map};

    fn handle() -> ExecutionHandle {
        let definition = Arc::new(WorkflowDefinition::new(
            "wf",
            vec![WorkflowStep::agent("A", "echo")],
        ));
        let execution = WorkflowExecution::new("wf", json!({}), &Map::new());
        ExecutionHandle::new(definition, execution)
    }

    #[test]
    fn test_activate_once() {
        let handle = handle();
        assert_eq!(handle.activate(), Some(Activation::Start));
        assert_eq!(handle.status(), ExecutionStatus::Running);
        assert_eq!(handle.activate(), None);
    }

    #[test]
    fn test_pause_parks_steps_and_resume_requeues() {
        let handle = handle();
        handle.activate();
        handle.pause().unwrap();
        assert_eq!(handle.checkpoint("B"), Checkpoint::Parked);
        assert_eq!(
            handle.settle(Ok(())),
            Settled::Done {
                status: ExecutionStatus::Paused,
                changed: false
            }
        );

        assert_eq!(handle.resume().unwrap(), ResumeAction::Requeue);
        assert_eq!(handle.activate(), Some(Activation::Resume(vec!["B".into()])));
    }

    #[test]
    fn test_resume_while_walking_continues_parked_steps() {
        let handle = handle();
        handle.activate();
        handle.pause().unwrap();
        assert_eq!(handle.checkpoint("C"), Checkpoint::Parked);
        assert_eq!(handle.resume().unwrap(), ResumeAction::Continued);
        assert_eq!(handle.settle(Ok(())), Settled::Continue(vec!["C".into()]));
        assert_eq!(
            handle.settle(Ok(())),
            Settled::Done {
                status: ExecutionStatus::Completed,
                changed: true
            }
        );
    }

    #[test]
    fn test_cancel_is_terminal() {
        let handle = handle();
        assert!(!handle.cancel().unwrap());
        assert!(handle.cancel_token().is_cancelled());
        assert!(handle.cancel().is_err());
        assert!(handle.pause().is_err());
        assert_eq!(handle.activate(), None);
        assert_eq!(handle.checkpoint("A"), Checkpoint::Stopped);
    }

    #[test]
    fn test_failure_while_paused_fails_execution() {
        let handle = handle();
        handle.activate();
        handle.pause().unwrap();
        let settled = handle.settle(Err(AgentError::non_retryable("boom")));
        assert_eq!(
            settled,
            Settled::Done {
                status: ExecutionStatus::Failed,
                changed: true
            }
        );
        assert!(handle.snapshot().last_error.is_some());
    }
}
