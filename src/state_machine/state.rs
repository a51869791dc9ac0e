//! The state configuration DSL: per-state handler channels plus the
//! data-driven async-operation chain primitives (`Do`/`GoTo`/`Invoke`/`If`/
//! `IfThenGoTo`).

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;

use crate::workflow::WorkflowFault;

use super::transition::StateMachineError;

/// Bound required of any state identifier.
pub trait StateKind: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> StateKind for T {}

pub type HandlerFuture<S> = Pin<Box<dyn Future<Output = Result<Option<S>, WorkflowFault>> + Send>>;
pub type Handler<S> = Arc<dyn Fn() -> HandlerFuture<S> + Send + Sync>;

/// One node of the linear async-operation chain a state's `on_async` entry
/// compiles to. Represented as a data-driven tagged variant (per the design
/// notes) rather than a chain of distinct builder types, so the interpreter
/// is a single recursive walk instead of N monomorphized trait impls.
pub enum AsyncOperationStep<S> {
    /// Run a side effect, then stay in the current state.
    Do(Handler<S>),
    /// Unconditionally transition to `S`.
    GoTo(S),
    /// Await a producer, then continue into the nested step with its value
    /// discarded (the producer's only role is to suspend).
    Invoke(Arc<dyn Fn() -> HandlerFuture<S> + Send + Sync>, Box<AsyncOperationStep<S>>),
    /// Evaluate `predicate`; if true, continue into the nested step, else stop.
    If(Arc<dyn Fn() -> bool + Send + Sync>, Box<AsyncOperationStep<S>>),
    /// Evaluate `predicate`; if true, transition to `S`, else stop.
    IfThenGoTo(Arc<dyn Fn() -> bool + Send + Sync>, S),
}

impl<S: StateKind> AsyncOperationStep<S> {
    /// Walk the chain, returning the requested transition target if any.
    pub async fn run(&self) -> Result<Option<S>, WorkflowFault> {
        match self {
            AsyncOperationStep::Do(handler) => handler().await,
            AsyncOperationStep::GoTo(target) => Ok(Some(target.clone())),
            AsyncOperationStep::Invoke(producer, next) => {
                producer().await?;
                Box::pin(next.run()).await
            }
            AsyncOperationStep::If(predicate, next) => {
                if predicate() {
                    Box::pin(next.run()).await
                } else {
                    Ok(None)
                }
            }
            AsyncOperationStep::IfThenGoTo(predicate, target) => {
                if predicate() {
                    Ok(Some(target.clone()))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

/// Configuration for one state: its parent (for nesting), handler channels,
/// and action visibility.
pub struct StateConfig<S: StateKind> {
    pub parent: Option<S>,
    pub on_enter: Vec<Handler<S>>,
    pub on_activate: Vec<Handler<S>>,
    pub on_exit: Vec<Handler<S>>,
    pub on_async: Vec<Arc<AsyncOperationStep<S>>>,
    pub allowed_actions: HashSet<String>,
    pub disallowed_actions: HashSet<String>,
    pub is_hidden: bool,
    /// Names of entries in the owning [`StateTable`]'s [`CategoryTable`] this
    /// state draws its allowed actions from, in addition to its own
    /// `allowed_actions`.
    pub categories: Vec<String>,
}

impl<S: StateKind> Default for StateConfig<S> {
    fn default() -> Self {
        Self {
            parent: None,
            on_enter: Vec::new(),
            on_activate: Vec::new(),
            on_exit: Vec::new(),
            on_async: Vec::new(),
            allowed_actions: HashSet::new(),
            disallowed_actions: HashSet::new(),
            is_hidden: false,
            categories: Vec::new(),
        }
    }
}

/// Fluent builder for a single state's configuration.
pub struct StateBuilder<S: StateKind> {
    config: StateConfig<S>,
}

impl<S: StateKind> StateBuilder<S> {
    pub fn new() -> Self {
        Self { config: StateConfig::default() }
    }

    pub fn substate_of(mut self, parent: S) -> Self {
        self.config.parent = Some(parent);
        self
    }

    pub fn on_enter(mut self, handler: Handler<S>) -> Self {
        self.config.on_enter.push(handler);
        self
    }

    pub fn on_activate(mut self, handler: Handler<S>) -> Self {
        self.config.on_activate.push(handler);
        self
    }

    pub fn on_exit(mut self, handler: Handler<S>) -> Self {
        self.config.on_exit.push(handler);
        self
    }

    pub fn on_async(mut self, step: AsyncOperationStep<S>) -> Self {
        self.config.on_async.push(Arc::new(step));
        self
    }

    pub fn allow_actions(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.config.allowed_actions.extend(names);
        self
    }

    pub fn disallow_actions(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.config.disallowed_actions.extend(names);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.config.is_hidden = true;
        self
    }

    /// Draw this state's allowed actions from `name`'s entry in the table's
    /// [`CategoryTable`] as well, resolved at validation time.
    pub fn in_category(mut self, name: impl Into<String>) -> Self {
        self.config.categories.push(name.into());
        self
    }

    pub fn build(self) -> StateConfig<S> {
        self.config
    }
}

impl<S: StateKind> Default for StateBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Named set of actions a state can opt into via [`StateBuilder::in_category`]
/// instead of repeating the same `allow_actions` list on every member state.
pub type CategoryTable = HashMap<String, HashSet<String>>;

/// Map of configured states plus the named action categories they can draw
/// from. Wraps a `HashMap<S, StateConfig<S>>` (via `Deref`/`DerefMut`, so the
/// existing path-computation helpers keep working unchanged) and adds
/// duplicate-insert rejection and a pre-flight [`Self::validate`] pass.
pub struct StateTable<S: StateKind> {
    states: HashMap<S, StateConfig<S>>,
    pub categories: CategoryTable,
}

impl<S: StateKind> StateTable<S> {
    pub fn new() -> Self {
        Self { states: HashMap::new(), categories: HashMap::new() }
    }

    /// Insert `state`'s configuration, rejecting a second configuration for
    /// the same state.
    pub fn insert(&mut self, state: S, config: StateConfig<S>) -> Result<(), StateMachineError> {
        if self.states.contains_key(&state) {
            return Err(StateMachineError::DuplicateState);
        }
        self.states.insert(state, config);
        Ok(())
    }

    /// Define (or extend) a named action category.
    pub fn define_category(&mut self, name: impl Into<String>, actions: impl IntoIterator<Item = String>) {
        self.categories.entry(name.into()).or_default().extend(actions);
    }

    /// Check that every state's category references resolve, every action
    /// name referenced anywhere resolves against `known_actions`, and every
    /// `GoTo`/`IfThenGoTo` target in an `on_async` chain names a configured
    /// state. Run once, before a workflow starts.
    pub fn validate(&self, known_actions: &HashSet<String>) -> Result<(), StateMachineError> {
        for config in self.states.values() {
            for name in config.allowed_actions.iter().chain(config.disallowed_actions.iter()) {
                if !known_actions.contains(name) {
                    return Err(StateMachineError::MissingAction(name.clone()));
                }
            }
            for category in &config.categories {
                if !self.categories.contains_key(category) {
                    return Err(StateMachineError::MissingCategory(category.clone()));
                }
            }
            for step in &config.on_async {
                self.validate_chain(step)?;
            }
        }
        Ok(())
    }

    fn validate_chain(&self, step: &AsyncOperationStep<S>) -> Result<(), StateMachineError> {
        match step {
            AsyncOperationStep::Do(_) => Ok(()),
            AsyncOperationStep::GoTo(target) => {
                if self.states.contains_key(target) {
                    Ok(())
                } else {
                    Err(StateMachineError::InvalidChain)
                }
            }
            AsyncOperationStep::Invoke(_, next) | AsyncOperationStep::If(_, next) => self.validate_chain(next),
            AsyncOperationStep::IfThenGoTo(_, target) => {
                if self.states.contains_key(target) {
                    Ok(())
                } else {
                    Err(StateMachineError::InvalidChain)
                }
            }
        }
    }
}

impl<S: StateKind> Default for StateTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: StateKind> std::ops::Deref for StateTable<S> {
    type Target = HashMap<S, StateConfig<S>>;
    fn deref(&self) -> &Self::Target {
        &self.states
    }
}

impl<S: StateKind> std::ops::DerefMut for StateTable<S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn do_step_runs_handler_and_stays() {
        let handler: Handler<&str> = Arc::new(|| Box::pin(async { Ok(None) }));
        let step = AsyncOperationStep::Do(handler);
        assert_eq!(step.run().await.unwrap(), None);
    }

    #[tokio::test]
    async fn goto_step_requests_transition() {
        let step: AsyncOperationStep<&str> = AsyncOperationStep::GoTo("next");
        assert_eq!(step.run().await.unwrap(), Some("next"));
    }

    #[tokio::test]
    async fn if_then_goto_respects_predicate() {
        let step: AsyncOperationStep<&str> = AsyncOperationStep::IfThenGoTo(Arc::new(|| false), "next");
        assert_eq!(step.run().await.unwrap(), None);
        let step: AsyncOperationStep<&str> = AsyncOperationStep::IfThenGoTo(Arc::new(|| true), "next");
        assert_eq!(step.run().await.unwrap(), Some("next"));
    }
}
