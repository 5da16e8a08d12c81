//! Workflow engine
//!
//! The engine walks workflow step graphs. Executions are admitted by a single
//! dispatcher that never lets more than `max_concurrent_executions` walk at
//! once; everything else waits FIFO in the pending queue.
//!
//! ```text
//! execute_workflow ──► pending (FIFO) ──► dispatcher ──► run_execution
//!                                            │                 │
//!                       running < max? ◄─────┘                 ▼
//!                                                 walk roots / parked frontier
//!                                                              │
//!                      ┌──────────┬───────────┬────────────┬───┴──────┐
//!                      ▼          ▼           ▼            ▼          ▼
//!                    agent    condition    parallel      delay     webhook
//!                 (registry)  (no I/O)   (join_all)   (sleep)   (WebhookClient)
//! ```
//!
//! Pause and cancel are cooperative: the walker checks the execution status
//! before every step. A paused walk parks the steps it would have started in
//! the execution's frontier; resuming walks the frontier again.
//!
//! # Example
//!
//! ```ignore
//! use fleetflow_engine::prelude::*;
//!
//! let engine = WorkflowEngine::builder(registry.clone())
//!     .config(EngineConfig::default().with_max_concurrent_executions(4))
//!     .build();
//! engine.start().await?;
//!
//! engine.register_workflow(definition).await?;
//! let id = engine.execute_workflow("publish-post", json!({"topic": "rust"})).await?;
//! let execution = engine.wait_for_execution(id, Duration::from_secs(30)).await?;
//! ```

pub mod conditions;
mod executor;
mod handle;
pub mod interpolate;
mod walker;

use std::time::Duration;

use fleetflow_core::serde_util::duration_millis;
use serde::{Deserialize, Serialize};

pub use conditions::{evaluate_condition, evaluate_conditions};
pub use executor::{EngineStats, WorkflowEngine, WorkflowEngineBuilder};
pub use interpolate::interpolate;

/// Task type used by agent steps that don't set `config.task_type`
pub const DEFAULT_STEP_TASK_TYPE: &str = "workflow_step";

/// Configuration for the workflow engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ceiling on executions walking at the same time
    pub max_concurrent_executions: usize,

    /// How long `shutdown` waits for running executions
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 10,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn with_max_concurrent_executions(mut self, max: usize) -> Self {
        self.max_concurrent_executions = max;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
