//! Per-agent runtime
//!
//! This module provides:
//! - [`Worker`] - lifecycle state machine, task contract, heartbeat, health and metrics
//! - [`Agent`] - the composed contract a concrete agent implements
//!   ([`Lifecycle`] + [`TaskExecutor`] + [`HealthReporter`])
//! - [`WorkerConfig`] - heartbeat, drain and resource settings
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                       Worker                          │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────┐  │
//! │  │  Heartbeat  │  │   Health    │  │   Metrics    │  │
//! │  │  (Ticker)   │  │ live/dep/mem│  │  counters    │  │
//! │  └─────────────┘  └─────────────┘  └──────────────┘  │
//! │         submit ──▶ TaskQueue ──▶ process_task         │
//! │                                     │                 │
//! │                                     ▼                 │
//! │                        dyn Agent::execute (timeout)   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use fleetflow_engine::worker::{FnAgent, Worker, WorkerConfig};
//!
//! let agent = FnAgent::new(|task| async move { Ok(Value::Object(task.payload)) })
//!     .handling("echo")
//!     .shared();
//! let worker = Worker::new(AgentConfig::new("echo", "Echo"), WorkerConfig::default(), agent, bus);
//!
//! worker.start().await?;
//! let result = worker.submit(task)?.wait().await?;
//! worker.shutdown().await?;
//! ```

mod agent;
mod config;
mod resources;
mod runtime;

pub use agent::{
    Agent, AgentContext, FnAgent, HealthReporter, Lifecycle, SharedAgent, TaskExecutor,
};
pub use config::WorkerConfig;
pub use resources::{MemoryProbe, MEMORY_CHECK};
pub use runtime::{DrainOutcome, Worker, LIVENESS_CHECK};
