//! Workflow registry for type-erased workflow creation.
//!
//! The registry maps workflow type names to factories that build a fresh
//! [`WorkflowLogic`] trait object wired to a repository. This mirrors the
//! teacher's `engine::registry::WorkflowRegistry` type-erasure idiom
//! (`HashMap<String, Factory>` plus a wrapper struct hiding the concrete
//! generic type), but the wrapped value is a cooperative [`StateLayer`]
//! instead of an event-replay workflow.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::clock::Clock;
use crate::persistence::Repository;
use crate::state_machine::{StateKind, StateLayer};
use crate::workflow::{WorkflowFault, WorkflowInstance};

/// Type-erased handle to a running workflow's state-machine half, analogous
/// to the teacher's `AnyWorkflow` trait but driven by the cooperative
/// interpreter instead of event folding.
#[async_trait]
pub trait WorkflowLogic: Send + Sync {
    fn instance(&self) -> &Arc<WorkflowInstance>;
    async fn start(&self, clock: Arc<dyn Clock>) -> Result<(), WorkflowFault>;
    async fn start_restoring(&self, persisted_history: Vec<Value>, clock: Arc<dyn Clock>) -> Result<(), WorkflowFault>;
    fn is_action_allowed(&self, name: &str) -> Option<bool>;
    /// Request a transition to `target` (deserialized against the concrete
    /// state type), for cross-workflow collaborators (e.g. the coordinator)
    /// that only hold a type-erased handle.
    async fn transition_to(&self, target: Value) -> Result<(), WorkflowFault>;
}

/// Adapts a concrete `StateLayer<S>` to the type-erased [`WorkflowLogic`]
/// contract, the same role the teacher's `WorkflowWrapper<W: Workflow>` plays
/// for `AnyWorkflow`.
pub struct WorkflowLogicWrapper<S: StateKind + PartialEq + Serialize + DeserializeOwned> {
    pub layer: Arc<StateLayer<S>>,
    pub initial_state: S,
}

#[async_trait]
impl<S: StateKind + PartialEq + Serialize + DeserializeOwned> WorkflowLogic for WorkflowLogicWrapper<S> {
    fn instance(&self) -> &Arc<WorkflowInstance> {
        &self.layer.workflow
    }

    async fn start(&self, clock: Arc<dyn Clock>) -> Result<(), WorkflowFault> {
        self.layer.start(self.initial_state.clone(), clock).await
    }

    async fn start_restoring(&self, persisted_history: Vec<Value>, clock: Arc<dyn Clock>) -> Result<(), WorkflowFault> {
        let history = persisted_history
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<S>, _>>()
            .map_err(|e| WorkflowFault::User(format!("failed to deserialize persisted state history: {e}")))?;
        self.layer.start_restoring(history, clock).await
    }

    fn is_action_allowed(&self, name: &str) -> Option<bool> {
        self.layer.is_action_allowed(name)
    }

    async fn transition_to(&self, target: Value) -> Result<(), WorkflowFault> {
        let target: S = serde_json::from_value(target)
            .map_err(|e| WorkflowFault::User(format!("failed to deserialize transition target: {e}")))?;
        self.layer.initiate_transition_to(target).await
    }
}

pub type WorkflowFactory = Arc<dyn Fn(Arc<dyn Repository>) -> Arc<dyn WorkflowLogic> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),
    #[error("workflow type '{0}' is already registered")]
    DuplicateWorkflowType(String),
}

#[derive(Default)]
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_name: impl Into<String>, factory: WorkflowFactory) -> Result<(), RegistryError> {
        let type_name = type_name.into();
        if self.factories.contains_key(&type_name) {
            return Err(RegistryError::DuplicateWorkflowType(type_name));
        }
        self.factories.insert(type_name, factory);
        Ok(())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn create(&self, type_name: &str, repository: Arc<dyn Repository>) -> Result<Arc<dyn WorkflowLogic>, RegistryError> {
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(type_name.to_string()))?;
        Ok(factory(repository))
    }

    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::persistence::InMemoryRepository;
    use crate::state_machine::{StateBuilder, StateTable};

    fn make_logic(repo: Arc<dyn Repository>) -> Arc<dyn WorkflowLogic> {
        let wf = WorkflowInstance::new("order", repo);
        let mut states: StateTable<String> = StateTable::new();
        states.insert("Open".to_string(), StateBuilder::new().build()).unwrap();
        let layer = StateLayer::new(wf, states, 10);
        Arc::new(WorkflowLogicWrapper { layer, initial_state: "Open".to_string() })
    }

    #[tokio::test]
    async fn register_and_create_roundtrip() {
        let mut registry = WorkflowRegistry::new();
        registry.register("order", Arc::new(make_logic)).unwrap();
        assert!(registry.contains("order"));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let logic = registry.create("order", repo).unwrap();
        assert_eq!(logic.instance().workflow_type_name, "order");
    }

    #[tokio::test]
    async fn created_logic_starts_into_initial_state() {
        let mut registry = WorkflowRegistry::new();
        registry.register("order", Arc::new(make_logic)).unwrap();
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let logic = registry.create("order", repo).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new("2020-01-01T00:00:00Z".parse().unwrap()));
        logic.start(clock).await.unwrap();
        assert_eq!(logic.is_action_allowed("pay"), None);
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry = WorkflowRegistry::new();
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let err = registry.create("missing", repo);
        assert!(matches!(err, Err(RegistryError::UnknownWorkflowType(_))));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = WorkflowRegistry::new();
        registry.register("order", Arc::new(make_logic)).unwrap();
        let err = registry.register("order", Arc::new(make_logic));
        assert!(matches!(err, Err(RegistryError::DuplicateWorkflowType(_))));
    }
}
