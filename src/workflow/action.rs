//! Action registration: the catalog of named, externally triggerable events
//! a workflow accepts, plus synonym resolution and per-canonical-name stats.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::data::NamedValues;
use crate::workflow::WorkflowFault;

pub type ActionHandler =
    Arc<dyn Fn(NamedValues) -> Pin<Box<dyn Future<Output = Result<(), WorkflowFault>> + Send>> + Send + Sync>;

/// One registered action: its handler, metadata, and synonym set. The first
/// name an action is registered under is canonical; synonyms all resolve to
/// the same definition and share its stats bucket.
#[derive(Clone)]
pub struct ActionDefinition {
    pub canonical_name: String,
    pub synonyms: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub is_hidden: bool,
    pub handler: ActionHandler,
}

#[derive(Debug, thiserror::Error)]
pub enum ActionCatalogError {
    #[error("action '{0}' is already registered")]
    DuplicateRegistration(String),
    #[error("action '{0}' is not configured")]
    NotConfigured(String),
}

/// Maps every registered name (canonical or synonym) to its shared
/// definition, and tracks how many times each canonical action has executed.
#[derive(Default)]
pub struct ActionCatalog {
    definitions: Vec<ActionDefinition>,
    by_name: HashMap<String, usize>,
    stats: HashMap<String, u64>,
}

impl ActionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        canonical_name: impl Into<String>,
        handler: ActionHandler,
        metadata: HashMap<String, String>,
        synonyms: Vec<String>,
        is_hidden: bool,
    ) -> Result<(), ActionCatalogError> {
        let canonical_name = canonical_name.into();
        if self.by_name.contains_key(&canonical_name) {
            return Err(ActionCatalogError::DuplicateRegistration(canonical_name));
        }
        for synonym in &synonyms {
            if self.by_name.contains_key(synonym) {
                return Err(ActionCatalogError::DuplicateRegistration(synonym.clone()));
            }
        }
        let mut all_names = vec![canonical_name.clone()];
        all_names.extend(synonyms.iter().cloned());

        let index = self.definitions.len();
        self.definitions.push(ActionDefinition {
            canonical_name: canonical_name.clone(),
            synonyms: all_names.clone(),
            metadata,
            is_hidden,
            handler,
        });
        for name in all_names {
            self.by_name.insert(name, index);
        }
        self.stats.insert(canonical_name, 0);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<&ActionDefinition> {
        self.by_name.get(name).map(|&i| &self.definitions[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn record_execution(&mut self, canonical_name: &str) {
        *self.stats.entry(canonical_name.to_string()).or_insert(0) += 1;
    }

    pub fn times_executed(&self, canonical_name: &str) -> u64 {
        self.stats.get(canonical_name).copied().unwrap_or(0)
    }

    pub fn visible_names(&self) -> impl Iterator<Item = &str> {
        self.definitions.iter().filter(|d| !d.is_hidden).map(|d| d.canonical_name.as_str())
    }

    /// Every registered name, canonical or synonym, visible or hidden.
    pub fn all_names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> ActionHandler {
        Arc::new(|_| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn synonyms_share_canonical_stats() {
        let mut catalog = ActionCatalog::new();
        catalog
            .register("pay", noop_handler(), HashMap::new(), vec!["settle".into()], false)
            .unwrap();
        assert!(catalog.resolve("settle").is_some());
        catalog.record_execution("pay");
        assert_eq!(catalog.times_executed("pay"), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut catalog = ActionCatalog::new();
        catalog.register("pay", noop_handler(), HashMap::new(), vec![], false).unwrap();
        let err = catalog.register("pay", noop_handler(), HashMap::new(), vec![], false);
        assert!(matches!(err, Err(ActionCatalogError::DuplicateRegistration(_))));
    }

    #[test]
    fn hidden_actions_are_excluded_from_visible_names() {
        let mut catalog = ActionCatalog::new();
        catalog.register("internal", noop_handler(), HashMap::new(), vec![], true).unwrap();
        catalog.register("public", noop_handler(), HashMap::new(), vec![], false).unwrap();
        let visible: Vec<_> = catalog.visible_names().collect();
        assert_eq!(visible, vec!["public"]);
    }
}
