//! Repository trait: the storage contract a workflow instance calls into.
//!
//! This crate treats the backing store as an external collaborator — it owns
//! no SQL, no migrations, nothing backend-specific. [`crate::persistence::InMemoryRepository`]
//! is the only implementation shipped, used by the engine's own tests and as
//! a reference for host applications writing a real one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::data::NamedValues;
use crate::workflow::{WorkflowId, WorkflowStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    NotFound(WorkflowId),
    #[error("workflow already exists: {0}")]
    AlreadyExists(WorkflowId),
    #[error("backend error: {0}")]
    Backend(String),
}

/// A workflow row as the repository sees it: everything needed to
/// reconstitute an instance without knowing its concrete Rust type.
#[derive(Debug, Clone)]
pub struct PersistedWorkflow {
    pub id: WorkflowId,
    pub workflow_type_name: String,
    pub status: WorkflowStatus,
    pub next_activation_date: Option<DateTime<Utc>>,
    pub data: NamedValues,
}

/// Storage contract every method of which is called from the owning
/// workflow's serialized executor (never concurrently for the same id).
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    /// Create a brand-new row for a workflow that has never been saved.
    async fn create_workflow(
        &self,
        id: &WorkflowId,
        workflow_type_name: &str,
        initial_data: &NamedValues,
    ) -> Result<(), StoreError>;

    /// Commit the full data snapshot and the current `next_activation_date`.
    async fn save_workflow_data(
        &self,
        id: &WorkflowId,
        data: &NamedValues,
        next_activation_date: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn mark_completed(&self, id: &WorkflowId) -> Result<(), StoreError>;

    async fn mark_canceled(&self, id: &WorkflowId) -> Result<(), StoreError>;

    async fn mark_failed(&self, id: &WorkflowId, error: String) -> Result<(), StoreError>;

    /// Entries with `status` in {InProgress, Failed} and
    /// `next_activation_date <= max_activation_date`, excluding `ignore_ids`
    /// (already running in this process).
    async fn get_active_workflows(
        &self,
        max_activation_date: DateTime<Utc>,
        ignore_ids: &[WorkflowId],
    ) -> Result<Vec<PersistedWorkflow>, StoreError>;

    /// Any InProgress/Failed entry by id, regardless of activation horizon.
    async fn get_active_workflow_by_id(&self, id: &WorkflowId) -> Result<Option<PersistedWorkflow>, StoreError>;
}
