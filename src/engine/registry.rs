// Definition registry - validated authoring of workflow definitions

//! # Definition Registry
//!
//! The authoring surface over a [`DefinitionStore`]. It validates and persists
//! definitions and manages activation; it contains no FSM logic.
//!
//! - create: validated, fresh id, version 1, inactive
//! - update: re-validated, version + 1, keeps id, creation audit fields and
//!   the active flag; the code is fixed once created
//! - activate: makes one definition the active one for its code and
//!   deactivates its siblings in the same store operation

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use super::bounded;
use super::storage::DefinitionStore;
use crate::models::WorkflowDefinition;
use crate::{Result, WorkflowError};

/// One page of definitions, newest first
#[derive(Debug, Clone, Serialize)]
pub struct DefinitionPage {
    pub items: Vec<WorkflowDefinition>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

pub struct DefinitionRegistry {
    store: Arc<dyn DefinitionStore>,
    timeout: Duration,
}

impl DefinitionRegistry {
    pub fn new(store: Arc<dyn DefinitionStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn create_definition(&self, mut definition: WorkflowDefinition, actor: &str) -> Result<WorkflowDefinition> {
        definition.validate().map_err(WorkflowError::InvalidDefinition)?;

        let now = Utc::now();
        definition.id = uuid::Uuid::new_v4().to_string();
        definition.version = 1;
        definition.is_active = false;
        definition.created_at = now;
        definition.updated_at = now;
        definition.created_by = actor.to_string();
        definition.updated_by = actor.to_string();

        let saved = bounded(self.timeout, "save definition", self.store.save_definition(definition)).await?;
        info!(id = %saved.id, code = %saved.code, "Workflow definition created");
        Ok(saved)
    }

    /// Replace the states, transitions and descriptive fields of a definition
    pub async fn update_definition(
        &self,
        id: &str,
        mut definition: WorkflowDefinition,
        actor: &str,
    ) -> Result<WorkflowDefinition> {
        definition.validate().map_err(WorkflowError::InvalidDefinition)?;
        let existing = self.get_definition(id).await?;
        if definition.code != existing.code {
            return Err(WorkflowError::InvalidDefinition(format!(
                "code cannot change from '{}' to '{}'",
                existing.code, definition.code
            )));
        }

        definition.id = existing.id;
        definition.version = existing.version + 1;
        definition.is_active = existing.is_active;
        definition.created_at = existing.created_at;
        definition.created_by = existing.created_by;
        definition.updated_at = Utc::now();
        definition.updated_by = actor.to_string();

        let saved = bounded(self.timeout, "save definition", self.store.save_definition(definition)).await?;
        info!(id = %saved.id, code = %saved.code, version = saved.version, "Workflow definition updated");
        Ok(saved)
    }

    pub async fn get_definition(&self, id: &str) -> Result<WorkflowDefinition> {
        bounded(self.timeout, "load definition", self.store.get_definition(id))
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow definition {}", id)))
    }

    /// `page` is 1-based; out-of-range pages are empty
    pub async fn list_definitions(&self, page: usize, page_size: usize) -> Result<DefinitionPage> {
        let mut all = bounded(self.timeout, "list definitions", self.store.list_definitions()).await?;
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let page = page.max(1);
        let page_size = page_size.max(1);
        let total = all.len();
        let items = all
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();

        Ok(DefinitionPage {
            items,
            total,
            page,
            page_size,
        })
    }

    pub async fn delete_definition(&self, id: &str) -> Result<()> {
        let removed = bounded(self.timeout, "delete definition", self.store.delete_definition(id)).await?;
        if !removed {
            return Err(WorkflowError::NotFound(format!("workflow definition {}", id)));
        }
        info!(id = %id, "Workflow definition deleted");
        Ok(())
    }

    pub async fn activate_definition(&self, id: &str) -> Result<WorkflowDefinition> {
        let active = bounded(self.timeout, "activate definition", self.store.activate_exclusive(id)).await?;
        info!(id = %active.id, code = %active.code, version = active.version, "Workflow definition activated");
        Ok(active)
    }

    pub async fn deactivate_definition(&self, id: &str) -> Result<WorkflowDefinition> {
        let mut definition = self.get_definition(id).await?;
        if !definition.is_active {
            return Ok(definition);
        }
        definition.is_active = false;
        definition.updated_at = Utc::now();
        let saved = bounded(self.timeout, "save definition", self.store.save_definition(definition)).await?;
        info!(id = %saved.id, code = %saved.code, "Workflow definition deactivated");
        Ok(saved)
    }

    /// The active definition for a code, if any
    pub async fn get_active(&self, code: &str) -> Result<Option<WorkflowDefinition>> {
        let all = bounded(self.timeout, "list definitions", self.store.list_definitions()).await?;
        Ok(all.into_iter().find(|d| d.code == code && d.is_active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStorage;
    use crate::models::basic_order;

    fn registry() -> DefinitionRegistry {
        DefinitionRegistry::new(Arc::new(InMemoryStorage::new()), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_create_rejects_invalid() {
        let registry = registry();
        let mut def = basic_order();
        def.states.retain(|s| !s.is_end());
        def.transitions.clear();

        let err = registry.create_definition(def, "admin").await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidDefinition(_)));
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_keeps_activation() {
        let registry = registry();
        let created = registry.create_definition(basic_order(), "alice").await.unwrap();
        registry.activate_definition(&created.id).await.unwrap();

        let mut edited = basic_order();
        edited.name = "订单流程 v2".to_string();
        let updated = registry.update_definition(&created.id, edited, "bob").await.unwrap();

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.version, 2);
        assert!(updated.is_active);
        assert_eq!(updated.created_by, "alice");
        assert_eq!(updated.updated_by, "bob");
    }

    #[tokio::test]
    async fn test_at_most_one_active_per_code() {
        let registry = registry();
        let a = registry.create_definition(basic_order(), "alice").await.unwrap();
        let b = registry.create_definition(basic_order(), "alice").await.unwrap();

        registry.activate_definition(&a.id).await.unwrap();
        registry.activate_definition(&b.id).await.unwrap();

        let active = registry.get_active("basic_order").await.unwrap().unwrap();
        assert_eq!(active.id, b.id);
        assert!(!registry.get_definition(&a.id).await.unwrap().is_active);

        registry.deactivate_definition(&b.id).await.unwrap();
        assert!(registry.get_active("basic_order").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_cannot_move_definition_to_another_code() {
        let registry = registry();
        let a = registry.create_definition(basic_order(), "alice").await.unwrap();
        let mut other = basic_order();
        other.code = "sample_order".to_string();
        let b = registry.create_definition(other, "alice").await.unwrap();
        registry.activate_definition(&a.id).await.unwrap();
        registry.activate_definition(&b.id).await.unwrap();

        let err = registry.update_definition(&b.id, basic_order(), "bob").await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidDefinition(_)));

        let all = registry.list_definitions(1, 10).await.unwrap().items;
        let active: Vec<_> = all.iter().filter(|d| d.code == "basic_order" && d.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);

        let unchanged = registry.get_definition(&b.id).await.unwrap();
        assert_eq!(unchanged.code, "sample_order");
        assert_eq!(unchanged.version, 1);
    }

    #[tokio::test]
    async fn test_list_pages_and_delete() {
        let registry = registry();
        for _ in 0..3 {
            registry.create_definition(basic_order(), "alice").await.unwrap();
        }
        let page = registry.list_definitions(1, 2).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        assert_eq!(registry.list_definitions(2, 2).await.unwrap().items.len(), 1);

        let id = page.items[0].id.clone();
        registry.delete_definition(&id).await.unwrap();
        assert!(matches!(
            registry.delete_definition(&id).await.unwrap_err(),
            WorkflowError::NotFound(_)
        ));
    }
}
