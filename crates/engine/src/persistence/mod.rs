//! Persistence collaborator
//!
//! This module provides:
//! - [`ExecutionStore`] trait the engine calls on create/update/complete
//! - [`NoopStore`] for purely in-memory operation
//! - [`InMemoryExecutionStore`] for tests and single-process use

mod memory;
mod store;

pub use memory::InMemoryExecutionStore;
pub use store::{ExecutionStore, NoopStore, StoreError};
