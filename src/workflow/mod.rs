//! Base workflow instance: identity, lifecycle, data storage, and action
//! dispatch. [`crate::state_machine`] layers a hierarchical interpreter on
//! top of this via composition rather than subclassing.

mod action;

pub use action::{ActionCatalog, ActionCatalogError, ActionDefinition, ActionHandler};

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, watch, OnceCell};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::activation::{ActivationDateTracker, ActivationHandleAllocator};
use crate::data::NamedValues;
use crate::executor::{ExecutorError, SerializedExecutor};
use crate::persistence::{Repository, StoreError};
use crate::wait::{ActionExecuted, CancellationScope};

/// Opaque, externally-assignable workflow identity. Generated by default as a
/// sortable UUIDv7 string, but any caller-supplied string is accepted, so a
/// host application's own primary keys work unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for WorkflowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WorkflowStatus {
    InProgress,
    Completed,
    Canceled,
    Failed,
}

#[derive(Debug, Error)]
pub enum WorkflowFault {
    #[error("action '{0}' is not configured")]
    ActionNotConfigured(String),
    #[error("action '{0}' is not allowed in the current state")]
    ActionNotAllowed(String),
    #[error("action '{0}' is already registered")]
    DuplicateActionRegistration(String),
    #[error("workflow was canceled")]
    Canceled,
    #[error("workflow id was already assigned")]
    IdAlreadyAssigned,
    #[error("workflow was already started")]
    AlreadyStarted,
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    StateMachine(#[from] crate::state_machine::StateMachineError),
    #[error("{0}")]
    User(String),
}

/// What a workflow ended up doing, delivered through its completion signal.
#[derive(Debug, Clone)]
pub enum TerminalOutcome {
    Completed,
    Canceled,
    Failed(Arc<WorkflowFault>),
}

/// The core, state-shape-agnostic half of a workflow: identity, data,
/// actions, scheduling, and cancellation. [`crate::state_machine::StateLayer`]
/// wraps one of these rather than a base class being subclassed, per the
/// "composition over a deep generic hierarchy" approach used throughout this
/// crate.
pub struct WorkflowInstance {
    id: OnceCell<WorkflowId>,
    pub workflow_type_name: String,
    data: Mutex<NamedValues>,
    transient_data: Mutex<NamedValues>,
    actions: Mutex<ActionCatalog>,
    action_events: broadcast::Sender<ActionExecuted>,
    pub activation_tracker: Mutex<ActivationDateTracker>,
    pub activation_alloc: Mutex<ActivationHandleAllocator>,
    pub executor: SerializedExecutor,
    pub cancellation: CancellationScope,
    start_guard: OnceCell<()>,
    started: watch::Sender<bool>,
    completed: watch::Sender<Option<TerminalOutcome>>,
    repository: Arc<dyn Repository>,
}

impl WorkflowInstance {
    pub fn new(workflow_type_name: impl Into<String>, repository: Arc<dyn Repository>) -> Arc<Self> {
        let (action_events, _) = broadcast::channel(256);
        let (started, _) = watch::channel(false);
        let (completed, _) = watch::channel(None);
        Arc::new(Self {
            id: OnceCell::new(),
            workflow_type_name: workflow_type_name.into(),
            data: Mutex::new(NamedValues::new()),
            transient_data: Mutex::new(NamedValues::new()),
            actions: Mutex::new(ActionCatalog::new()),
            action_events,
            activation_tracker: Mutex::new(ActivationDateTracker::new()),
            activation_alloc: Mutex::new(ActivationHandleAllocator::default()),
            executor: SerializedExecutor::spawn(),
            cancellation: CancellationScope::new(),
            start_guard: OnceCell::new(),
            started,
            completed,
            repository,
        })
    }

    /// Assign this workflow's id. Write-once: a second call fails.
    pub fn assign_id(&self, id: WorkflowId) -> Result<(), WorkflowFault> {
        self.id.set(id).map_err(|_| WorkflowFault::IdAlreadyAssigned)
    }

    pub fn id(&self) -> Option<&WorkflowId> {
        self.id.get()
    }

    pub fn data(&self) -> NamedValues {
        self.data.lock().clone()
    }

    pub fn with_data_mut<T>(&self, f: impl FnOnce(&mut NamedValues) -> T) -> T {
        f(&mut self.data.lock())
    }

    pub fn with_transient_mut<T>(&self, f: impl FnOnce(&mut NamedValues) -> T) -> T {
        f(&mut self.transient_data.lock())
    }

    pub fn subscribe_actions(&self) -> broadcast::Receiver<ActionExecuted> {
        self.action_events.subscribe()
    }

    pub fn subscribe_started(&self) -> watch::Receiver<bool> {
        self.started.subscribe()
    }

    pub fn subscribe_completed(&self) -> watch::Receiver<Option<TerminalOutcome>> {
        self.completed.subscribe()
    }

    pub fn configure_action(
        &self,
        canonical_name: impl Into<String>,
        handler: ActionHandler,
        synonyms: Vec<String>,
        is_hidden: bool,
    ) -> Result<(), WorkflowFault> {
        self.actions
            .lock()
            .register(canonical_name, handler, Default::default(), synonyms, is_hidden)
            .map_err(|e| match e {
                ActionCatalogError::DuplicateRegistration(n) => WorkflowFault::DuplicateActionRegistration(n),
                ActionCatalogError::NotConfigured(n) => WorkflowFault::ActionNotConfigured(n),
            })
    }

    pub fn times_executed(&self, canonical_name: &str) -> u64 {
        self.actions.lock().times_executed(canonical_name)
    }

    /// Every name (canonical or synonym) registered on this workflow's action
    /// catalog, used to validate a state table's action references up front.
    pub fn known_action_names(&self) -> std::collections::HashSet<String> {
        self.actions.lock().all_names().map(|s| s.to_string()).collect()
    }

    /// Latch the workflow into "starting": a `Start` operation may run at
    /// most once. Returns [`WorkflowFault::AlreadyStarted`] on a second call.
    pub fn begin_start(&self) -> Result<(), WorkflowFault> {
        self.start_guard.set(()).map_err(|_| WorkflowFault::AlreadyStarted)
    }

    /// Mark the workflow's started signal resolved. Called once, from inside
    /// the single `Start` operation, after `OnInit`/`OnCreated`-or-`OnLoaded`
    /// have run and before the run loop begins.
    pub fn mark_started(&self) {
        let _ = self.started.send(true);
    }

    /// Dispatch `name` with `params`: validates configuration, consults
    /// `is_allowed`, runs the handler, records stats, persists, then notifies
    /// waiters — all serialized on this workflow's executor (O1/O2).
    #[instrument(skip(self, params, is_allowed), fields(workflow_id = %self.id().map(|i| i.as_str()).unwrap_or("<unassigned>")))]
    pub async fn execute_action(
        self: &Arc<Self>,
        name: &str,
        params: NamedValues,
        throw_not_allowed: bool,
        is_allowed: impl Fn(&str) -> bool + Send + 'static,
    ) -> Result<bool, WorkflowFault> {
        let this = self.clone();
        let name = name.to_string();
        let executor = this.executor.clone();
        executor
            .run_or_inline(move || {
                let this = this.clone();
                async move {
                    let definition = {
                        let actions = this.actions.lock();
                        actions.resolve(&name).cloned()
                    };
                    let Some(definition) = definition else {
                        return Err(WorkflowFault::ActionNotConfigured(name));
                    };
                    if !is_allowed(&definition.canonical_name) {
                        if throw_not_allowed {
                            return Err(WorkflowFault::ActionNotAllowed(name));
                        }
                        return Ok(false);
                    }
                    (definition.handler)(params.clone()).await?;
                    {
                        let mut actions = this.actions.lock();
                        actions.record_execution(&definition.canonical_name);
                    }
                    this.save_workflow_data().await?;
                    let _ = this.action_events.send(ActionExecuted {
                        synonyms: definition.synonyms.clone(),
                        params,
                    });
                    debug!(action = %definition.canonical_name, "action executed");
                    Ok(true)
                }
            })
            .await?
    }

    /// Persist the current data snapshot plus `next_activation_date`. Only
    /// meaningful when called from this workflow's executor.
    pub async fn save_workflow_data(&self) -> Result<(), WorkflowFault> {
        let next_activation = self.activation_tracker.lock().next();
        let id = self.id().cloned().ok_or(WorkflowFault::IdAlreadyAssigned)?;
        let data = self.data();
        self.repository.save_workflow_data(&id, &data, next_activation).await?;
        Ok(())
    }

    /// Idempotent cancellation: the first call latches cancellation; further
    /// calls are no-ops.
    pub fn cancel_workflow(&self) {
        if self.cancellation.is_cancelled() {
            return;
        }
        info!("workflow canceled");
        self.cancellation.cancel();
    }

    /// Resolve the completion signal exactly once (I4). Later calls are
    /// ignored — only the first of Completed/Canceled/Failed wins.
    pub async fn finish(&self, outcome: TerminalOutcome) {
        if self.completed.borrow().is_some() {
            warn!("finish() called on an already-completed workflow; ignoring");
            return;
        }
        let id = match self.id() {
            Some(id) => id.clone(),
            None => return,
        };
        match &outcome {
            TerminalOutcome::Completed => {
                let _ = self.repository.mark_completed(&id).await;
            }
            TerminalOutcome::Canceled => {
                let _ = self.repository.mark_canceled(&id).await;
            }
            TerminalOutcome::Failed(fault) => {
                let _ = self.repository.mark_failed(&id, fault.to_string()).await;
            }
        }
        let _ = self.completed.send(Some(outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryRepository;
    use std::sync::Arc as StdArc;

    fn workflow() -> Arc<WorkflowInstance> {
        let repo: Arc<dyn Repository> = StdArc::new(InMemoryRepository::new());
        let wf = WorkflowInstance::new("test", repo);
        wf.assign_id(WorkflowId::from("wf-1")).unwrap();
        wf
    }

    #[tokio::test]
    async fn execute_action_records_stats_and_notifies() {
        let wf = workflow();
        wf.configure_action("pay", Arc::new(|_| Box::pin(async { Ok(()) })), vec!["settle".into()], false)
            .unwrap();
        let mut rx = wf.subscribe_actions();
        let ok = wf.execute_action("settle", NamedValues::new(), true, |_| true).await.unwrap();
        assert!(ok);
        assert_eq!(wf.times_executed("pay"), 1);
        let event = rx.recv().await.unwrap();
        assert!(event.synonyms.contains(&"pay".to_string()));
    }

    #[tokio::test]
    async fn execute_action_not_allowed_without_throw() {
        let wf = workflow();
        wf.configure_action("pay", Arc::new(|_| Box::pin(async { Ok(()) })), vec![], false).unwrap();
        let ok = wf.execute_action("pay", NamedValues::new(), false, |_| false).await.unwrap();
        assert!(!ok);
        assert_eq!(wf.times_executed("pay"), 0);
    }

    #[tokio::test]
    async fn execute_action_not_allowed_with_throw() {
        let wf = workflow();
        wf.configure_action("pay", Arc::new(|_| Box::pin(async { Ok(()) })), vec![], false).unwrap();
        let err = wf.execute_action("pay", NamedValues::new(), true, |_| false).await;
        assert!(matches!(err, Err(WorkflowFault::ActionNotAllowed(_))));
    }

    #[tokio::test]
    async fn id_is_write_once() {
        let wf = workflow();
        assert!(matches!(wf.assign_id(WorkflowId::from("other")), Err(WorkflowFault::IdAlreadyAssigned)));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let wf = workflow();
        wf.cancel_workflow();
        wf.cancel_workflow();
        assert!(wf.cancellation.is_cancelled());
    }
}
