//! In-memory [`Repository`] implementation used by this crate's own tests
//! and as a reference for host applications writing a real one.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::data::NamedValues;
use crate::workflow::{WorkflowId, WorkflowStatus};

use super::store::{PersistedWorkflow, Repository, StoreError};

#[derive(Clone)]
struct Row {
    workflow_type_name: String,
    status: WorkflowStatus,
    next_activation_date: Option<DateTime<Utc>>,
    data: NamedValues,
}

#[derive(Default)]
pub struct InMemoryRepository {
    rows: RwLock<HashMap<WorkflowId, Row>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn create_workflow(
        &self,
        id: &WorkflowId,
        workflow_type_name: &str,
        initial_data: &NamedValues,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.write();
        if rows.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.clone()));
        }
        rows.insert(
            id.clone(),
            Row {
                workflow_type_name: workflow_type_name.to_string(),
                status: WorkflowStatus::InProgress,
                next_activation_date: None,
                data: initial_data.clone(),
            },
        );
        Ok(())
    }

    async fn save_workflow_data(
        &self,
        id: &WorkflowId,
        data: &NamedValues,
        next_activation_date: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        row.data = data.clone();
        row.next_activation_date = next_activation_date;
        Ok(())
    }

    async fn mark_completed(&self, id: &WorkflowId) -> Result<(), StoreError> {
        self.set_status(id, WorkflowStatus::Completed)
    }

    async fn mark_canceled(&self, id: &WorkflowId) -> Result<(), StoreError> {
        self.set_status(id, WorkflowStatus::Canceled)
    }

    async fn mark_failed(&self, id: &WorkflowId, _error: String) -> Result<(), StoreError> {
        self.set_status(id, WorkflowStatus::Failed)
    }

    async fn get_active_workflows(
        &self,
        max_activation_date: DateTime<Utc>,
        ignore_ids: &[WorkflowId],
    ) -> Result<Vec<PersistedWorkflow>, StoreError> {
        let rows = self.rows.read();
        Ok(rows
            .iter()
            .filter(|(id, row)| {
                matches!(row.status, WorkflowStatus::InProgress | WorkflowStatus::Failed)
                    && row.next_activation_date.map(|d| d <= max_activation_date).unwrap_or(false)
                    && !ignore_ids.contains(id)
            })
            .map(|(id, row)| to_persisted(id, row))
            .collect())
    }

    async fn get_active_workflow_by_id(&self, id: &WorkflowId) -> Result<Option<PersistedWorkflow>, StoreError> {
        let rows = self.rows.read();
        Ok(rows
            .get(id)
            .filter(|row| matches!(row.status, WorkflowStatus::InProgress | WorkflowStatus::Failed))
            .map(|row| to_persisted(id, row)))
    }
}

impl InMemoryRepository {
    fn set_status(&self, id: &WorkflowId, status: WorkflowStatus) -> Result<(), StoreError> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        row.status = status;
        Ok(())
    }
}

fn to_persisted(id: &WorkflowId, row: &Row) -> PersistedWorkflow {
    PersistedWorkflow {
        id: id.clone(),
        workflow_type_name: row.workflow_type_name.clone(),
        status: row.status,
        next_activation_date: row.next_activation_date,
        data: row.data.clone(),
    }
}
