//! Workflow execution engine.
//!
//! The engine owns the running-workflow bookkeeping (`DashMap`, matching the
//! teacher's sharded concurrent maps rather than one coarse `RwLock`), drives
//! workflow creation, and preloads workflows whose activation horizon is
//! approaching from the repository at startup and on a recurring cadence.

mod registry;

pub use registry::{RegistryError, WorkflowFactory, WorkflowLogic, WorkflowLogicWrapper, WorkflowRegistry};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::clock::Clock;
use crate::data::NamedValues;
use crate::persistence::{Repository, StoreError};
use crate::state_machine::STATE_HISTORY_KEY;
use crate::workflow::{WorkflowFault, WorkflowId};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Workflow(#[from] WorkflowFault),
    #[error("workflow {0} is already running")]
    AlreadyRunning(WorkflowId),
}

/// Default lookahead window for [`Engine::load_and_execute_active_workflows`].
pub const DEFAULT_PRELOAD_HOURS: i64 = 6;

/// Drives workflow type construction, creation, and preload-on-startup.
pub struct Engine {
    registry: WorkflowRegistry,
    repository: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    running: DashMap<WorkflowId, Arc<dyn WorkflowLogic>>,
    preloader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(registry: WorkflowRegistry, repository: Arc<dyn Repository>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            repository,
            clock,
            running: DashMap::new(),
            preloader: parking_lot::Mutex::new(None),
        })
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn get_active_workflow_by_id(&self, id: &WorkflowId) -> Option<Arc<dyn WorkflowLogic>> {
        self.running.get(id).map(|entry| entry.value().clone())
    }

    /// Construct, persist, and start a brand-new workflow of `type_name`.
    /// The returned logic's id is already assigned even when the caller
    /// leaves it to [`WorkflowId::generate`].
    #[instrument(skip(self, initial_data, initial_transient))]
    pub async fn create_workflow(
        self: &Arc<Self>,
        type_name: &str,
        id: Option<WorkflowId>,
        initial_data: NamedValues,
        initial_transient: NamedValues,
    ) -> Result<Arc<dyn WorkflowLogic>, EngineError> {
        let logic = self.registry.create(type_name, self.repository.clone())?;
        let id = id.unwrap_or_else(WorkflowId::generate);
        if self.running.contains_key(&id) {
            return Err(EngineError::AlreadyRunning(id));
        }
        let instance = logic.instance();
        instance.assign_id(id.clone())?;
        instance.with_data_mut(|data| data.merge_from(initial_data));
        instance.with_transient_mut(|data| data.merge_from(initial_transient));
        self.repository.create_workflow(&id, type_name, &instance.data()).await?;
        self.running.insert(id.clone(), logic.clone());
        logic.start(self.clock.clone()).await?;
        info!(workflow_id = %id, workflow_type = type_name, "workflow created");
        Ok(logic)
    }

    /// Re-instantiate a persisted workflow row and resume it from its saved
    /// state history (if any).
    async fn load_one(self: &Arc<Self>, row: crate::persistence::PersistedWorkflow) -> Result<(), EngineError> {
        if self.running.contains_key(&row.id) {
            return Ok(());
        }
        let logic = self.registry.create(&row.workflow_type_name, self.repository.clone())?;
        let instance = logic.instance();
        instance.assign_id(row.id.clone())?;
        instance.with_data_mut(|data| data.merge_from(row.data.clone()));
        self.running.insert(row.id.clone(), logic.clone());
        let history = row.data.get(STATE_HISTORY_KEY).cloned().and_then(|v| v.as_array().cloned()).unwrap_or_default();
        logic.start_restoring(history, self.clock.clone()).await?;
        info!(workflow_id = %row.id, workflow_type = row.workflow_type_name, "workflow restored");
        Ok(())
    }

    /// Enumerate repository rows whose `nextActivationDate` falls within
    /// `preload_hours` of now (ignoring ids already running in this process)
    /// and resume each one. Intended to be called once at startup and then
    /// on the recurring cadence `start_preloader` drives.
    #[instrument(skip(self))]
    pub async fn load_and_execute_active_workflows(self: &Arc<Self>, preload_hours: i64) -> Result<usize, EngineError> {
        let horizon = self.clock.now() + chrono::Duration::hours(preload_hours);
        let running_ids: Vec<WorkflowId> = self.running.iter().map(|e| e.key().clone()).collect();
        let rows = self.repository.get_active_workflows(horizon, &running_ids).await?;
        let loaded = rows.len();
        for row in rows {
            if let Err(e) = self.load_one(row).await {
                warn!(error = %e, "failed to preload workflow");
            }
        }
        Ok(loaded)
    }

    /// Start a background task that calls [`Self::load_and_execute_active_workflows`]
    /// every `preload_hours - 0.5` hours, matching the horizon the spec calls
    /// for (always preload 30 minutes before the next boundary). Runs until
    /// [`Self::shutdown`] is called or the returned handle is aborted — there
    /// is no other cancellation path.
    pub fn start_preloader(self: &Arc<Self>, preload_hours: i64) {
        let engine = self.clone();
        let period = Duration::from_secs(preload_hours.max(1) as u64 * 3600 - 1800);
        let handle = tokio::spawn(async move {
            loop {
                if let Err(e) = engine.load_and_execute_active_workflows(preload_hours).await {
                    warn!(error = %e, "preload pass failed");
                }
                tokio::time::sleep(period).await;
            }
        });
        *self.preloader.lock() = Some(handle);
    }

    /// Abort the preloader task, if running. Does not affect already-started
    /// workflows.
    pub fn shutdown(&self) {
        if let Some(handle) = self.preloader.lock().take() {
            handle.abort();
        }
    }

    pub fn remove_completed(&self, id: &WorkflowId) {
        self.running.remove(id);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("running", &self.running.len()).finish()
    }
}
