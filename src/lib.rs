//! # Workflow Runtime
//!
//! A library for long-running, persistable, cooperative workflows: suspendable
//! state machines that park on explicit wait operators instead of blocking a
//! thread, survive process restarts by replaying a persisted state history,
//! and run every handler for a given workflow strictly one-at-a-time.
//!
//! ## Features
//!
//! - **Cooperative suspension**: workflows await composable wait operators
//!   (`wait_for_date`, `wait_for_action`, `wait_for_state`, `wait_for_any`)
//!   instead of blocking; suspending costs nothing but a parked task.
//! - **Serialized execution**: every workflow has its own single-logical-thread
//!   executor, so concurrent external callers never race its handlers.
//! - **Hierarchical state machine interpreter**: nested states with
//!   enter/activate/exit/async handler chains and lowest-common-ancestor
//!   transition planning.
//! - **Pluggable persistence**: workflows call into a [`persistence::Repository`]
//!   trait; [`persistence::InMemoryRepository`] ships as a reference
//!   implementation host applications can replace.
//! - **Engine & Coordinator**: workflow type registration, creation, horizon-based
//!   preloading from storage, and cross-workflow dependency wiring.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Engine / Coordinator                    │
//! │  (type registry, creation, preload-on-startup, dependencies) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    StateLayer<S> (optional)                  │
//! │  (hierarchical interpreter: transitions, history, stats)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowInstance                        │
//! │  (identity, data, action catalog, cancellation)               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            SerializedExecutor + wait operators                │
//! │  (one logical thread per workflow; suspension points)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use workflow_runtime::prelude::*;
//!
//! let mut registry = WorkflowRegistry::new();
//! registry.register("order", Arc::new(|repo| {
//!     let wf = WorkflowInstance::new("order", repo);
//!     let mut states = StateTable::new();
//!     states.insert("Open".to_string(), StateBuilder::new().build()).unwrap();
//!     let layer = StateLayer::new(wf, states, 20);
//!     Arc::new(WorkflowLogicWrapper { layer, initial_state: "Open".to_string() })
//!         as Arc<dyn WorkflowLogic>
//! })).unwrap();
//! ```

pub mod activation;
pub mod clock;
pub mod coordinator;
pub mod data;
pub mod engine;
pub mod executor;
pub mod persistence;
pub mod state_machine;
pub mod wait;
pub mod workflow;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::activation::{ActivationDateTracker, ActivationHandle, ActivationHandleAllocator};
    pub use crate::clock::{Clock, SystemClock, TestClock};
    pub use crate::coordinator::{action_trigger, state_trigger, Coordinator, CoordinatorFault};
    pub use crate::data::NamedValues;
    pub use crate::engine::{Engine, EngineError, WorkflowLogic, WorkflowLogicWrapper, WorkflowRegistry};
    pub use crate::persistence::{InMemoryRepository, PersistedWorkflow, Repository, StoreError};
    pub use crate::state_machine::{StateBuilder, StateKind, StateLayer, StateTable};
    pub use crate::wait::{wait_for_action, wait_for_any, wait_for_date, wait_for_state, CancellationScope, WaitError};
    pub use crate::workflow::{WorkflowFault, WorkflowId, WorkflowInstance, WorkflowStatus};
}

pub use engine::{Engine, EngineError, WorkflowLogic, WorkflowRegistry};
pub use persistence::{InMemoryRepository, Repository, StoreError};
pub use workflow::{WorkflowFault, WorkflowId, WorkflowInstance, WorkflowStatus};
