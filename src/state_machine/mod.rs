//! Hierarchical state machine interpreter.
//!
//! A [`StateLayer`] wraps a [`crate::workflow::WorkflowInstance`] (composition,
//! not subclassing — see the core's doc comment) and adds nested states with
//! enter/activate/async/exit handler channels, transition planning via
//! lowest-common-ancestor path computation, and restoration-after-load
//! semantics.

mod state;
mod transition;
mod instance;

pub use state::{AsyncOperationStep, CategoryTable, StateBuilder, StateConfig, StateKind, StateTable};
pub use transition::{compute_path, StateMachineError};
pub use instance::{StateLayer, StateStats, STATE_HISTORY_KEY};

pub use crate::wait::StateChangedEvent;
