//! Persistence contract for workflow data.
//!
//! This module provides:
//! - [`Repository`] trait, the storage contract an engine/workflow calls into
//! - [`InMemoryRepository`], used by tests and as a reference implementation

mod memory;
mod store;

pub use memory::InMemoryRepository;
pub use store::{PersistedWorkflow, Repository, StoreError};
