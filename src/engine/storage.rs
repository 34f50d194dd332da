// Storage abstraction for the workflow engines
// Definitions, instances and the owning entity records

//! # Storage Abstraction Layer
//!
//! Three repositories sit behind async traits so both engines can be wired to
//! any backend through their constructors:
//!
//! - [`DefinitionStore`]: versioned workflow definitions, read-mostly
//! - [`InstanceStore`]: workflow instances with their embedded history and
//!   the separate rollback log
//! - [`EntityRepository`]: the business records (orders) the engine projects
//!   workflow state onto
//!
//! ## Commit protocol
//!
//! [`InstanceStore::commit_transition`] is the single durable write of a
//! transition. It applies state, history, variables and (for rollbacks) the
//! rollback record together, and only if the stored `current_state` still
//! equals the state the caller read. A lost race surfaces as
//! [`WorkflowError::StateConflict`] and leaves the instance untouched.
//!
//! [`InMemoryStorage`] implements all three traits for tests, demos and
//! single-process deployments. `nats_storage` provides the distributed backend.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::{HistoryEntry, RollbackRecord, StateId, Variables, WorkflowDefinition, WorkflowInstance};
use crate::{Result, WorkflowError};

/// Everything one committed transition writes
#[derive(Debug, Clone)]
pub struct InstanceCommit {
    /// State the caller observed; the write is rejected if it changed
    pub expected_state: StateId,
    pub next_state: StateId,
    pub entry: HistoryEntry,
    /// Merged into the instance's variables
    pub variables: Variables,
    /// Present when the commit is a rollback
    pub rollback: Option<RollbackRecord>,
    /// Oldest entries beyond this many are dropped; 0 keeps everything
    pub history_cap: usize,
}

impl InstanceCommit {
    /// Apply this commit to an instance whose state has already been checked
    pub fn apply_to(self, instance: &mut WorkflowInstance) -> Option<RollbackRecord> {
        instance.current_state = self.next_state;
        instance.history.push(self.entry);
        if self.history_cap > 0 && instance.history.len() > self.history_cap {
            let excess = instance.history.len() - self.history_cap;
            instance.history.drain(..excess);
        }
        instance.variables.extend(self.variables);
        instance.updated_at = Utc::now();
        self.rollback
    }
}

/// Durable storage for workflow definitions
#[async_trait::async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Insert or replace a definition by id
    async fn save_definition(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition>;

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>>;

    /// All definitions, in no particular order
    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>>;

    /// Returns `false` when nothing was stored under `id`
    async fn delete_definition(&self, id: &str) -> Result<bool>;

    /// Mark `id` active and every other definition with the same code inactive
    async fn activate_exclusive(&self, id: &str) -> Result<WorkflowDefinition>;
}

/// Durable storage for workflow instances
#[async_trait::async_trait]
pub trait InstanceStore: Send + Sync {
    /// Store a new instance
    ///
    /// Fails with `AlreadyInitialized` if an instance already exists for the
    /// same `(entity_type, entity_id)`.
    async fn create_instance(&self, instance: WorkflowInstance) -> Result<WorkflowInstance>;

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>>;

    async fn find_by_entity(&self, entity_type: &str, entity_id: &str) -> Result<Option<WorkflowInstance>>;

    /// Atomically apply a transition if `current_state == commit.expected_state`
    async fn commit_transition(&self, id: &Uuid, commit: InstanceCommit) -> Result<WorkflowInstance>;

    /// Merge variables into an instance outside a transition
    async fn update_variables(&self, id: &Uuid, variables: Variables) -> Result<()>;

    /// Rollback records of one instance, oldest first
    async fn list_rollbacks(&self, id: &Uuid) -> Result<Vec<RollbackRecord>>;
}

/// Access to the business records that own workflow instances
///
/// The engine only knows the fields it projects (`status`, `workflow_state`,
/// `updated_at`, ...) and, on the order fast path, `progress`.
#[async_trait::async_trait]
pub trait EntityRepository: Send + Sync {
    async fn get_entity(&self, id: &str) -> Result<Option<Map<String, Value>>>;

    /// Merge `fields` into the record; `NotFound` if it does not exist
    async fn update_entity(&self, id: &str, fields: Map<String, Value>) -> Result<()>;

    /// Merge `fields` only if `field` currently equals `expected`
    ///
    /// Returns `Ok(false)` when the guard did not match.
    async fn compare_and_update(
        &self,
        id: &str,
        field: &str,
        expected: &Value,
        fields: Map<String, Value>,
    ) -> Result<bool>;
}

pub(crate) fn lock_poisoned<T>(_: PoisonError<T>) -> WorkflowError {
    WorkflowError::Persistence(anyhow::anyhow!("storage lock poisoned"))
}

/// In-memory storage for development, tests and the CLI demo
///
/// Every trait operation takes one lock for its whole duration, which is what
/// makes `commit_transition` and `activate_exclusive` atomic here.
#[derive(Default)]
pub struct InMemoryStorage {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
    instances: RwLock<HashMap<Uuid, WorkflowInstance>>,
    rollbacks: RwLock<HashMap<Uuid, Vec<RollbackRecord>>>,
    entities: RwLock<HashMap<String, Map<String, Value>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entity record
    pub fn insert_entity(&self, id: &str, fields: Map<String, Value>) -> Result<()> {
        let mut entities = self.entities.write().map_err(lock_poisoned)?;
        entities.insert(id.to_string(), fields);
        Ok(())
    }
}

#[async_trait::async_trait]
impl DefinitionStore for InMemoryStorage {
    async fn save_definition(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition> {
        let mut definitions = self.definitions.write().map_err(lock_poisoned)?;
        definitions.insert(definition.id.clone(), definition.clone());
        Ok(definition)
    }

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        let definitions = self.definitions.read().map_err(lock_poisoned)?;
        Ok(definitions.get(id).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        let definitions = self.definitions.read().map_err(lock_poisoned)?;
        Ok(definitions.values().cloned().collect())
    }

    async fn delete_definition(&self, id: &str) -> Result<bool> {
        let mut definitions = self.definitions.write().map_err(lock_poisoned)?;
        Ok(definitions.remove(id).is_some())
    }

    async fn activate_exclusive(&self, id: &str) -> Result<WorkflowDefinition> {
        let mut definitions = self.definitions.write().map_err(lock_poisoned)?;
        let code = definitions
            .get(id)
            .map(|d| d.code.clone())
            .ok_or_else(|| WorkflowError::NotFound(format!("definition {}", id)))?;

        let now = Utc::now();
        for definition in definitions.values_mut().filter(|d| d.code == code) {
            let active = definition.id == id;
            if definition.is_active != active {
                definition.is_active = active;
                definition.updated_at = now;
            }
        }

        definitions
            .get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("definition {}", id)))
    }
}

#[async_trait::async_trait]
impl InstanceStore for InMemoryStorage {
    async fn create_instance(&self, instance: WorkflowInstance) -> Result<WorkflowInstance> {
        let mut instances = self.instances.write().map_err(lock_poisoned)?;
        let exists = instances
            .values()
            .any(|i| i.entity_type == instance.entity_type && i.entity_id == instance.entity_id);
        if exists {
            return Err(WorkflowError::AlreadyInitialized {
                entity_type: instance.entity_type,
                entity_id: instance.entity_id,
            });
        }
        instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>> {
        let instances = self.instances.read().map_err(lock_poisoned)?;
        Ok(instances.get(id).cloned())
    }

    async fn find_by_entity(&self, entity_type: &str, entity_id: &str) -> Result<Option<WorkflowInstance>> {
        let instances = self.instances.read().map_err(lock_poisoned)?;
        Ok(instances
            .values()
            .find(|i| i.entity_type == entity_type && i.entity_id == entity_id)
            .cloned())
    }

    async fn commit_transition(&self, id: &Uuid, commit: InstanceCommit) -> Result<WorkflowInstance> {
        let mut instances = self.instances.write().map_err(lock_poisoned)?;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| WorkflowError::NotFound(format!("instance {}", id)))?;

        if instance.current_state != commit.expected_state {
            return Err(WorkflowError::StateConflict {
                instance_id: id.to_string(),
                expected: commit.expected_state.to_string(),
                actual: instance.current_state.to_string(),
            });
        }

        // both guards are held before anything is applied
        let mut rollbacks = if commit.rollback.is_some() {
            Some(self.rollbacks.write().map_err(lock_poisoned)?)
        } else {
            None
        };
        if let (Some(record), Some(rollbacks)) = (commit.apply_to(instance), rollbacks.as_mut()) {
            rollbacks.entry(*id).or_default().push(record);
        }
        Ok(instance.clone())
    }

    async fn update_variables(&self, id: &Uuid, variables: Variables) -> Result<()> {
        let mut instances = self.instances.write().map_err(lock_poisoned)?;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| WorkflowError::NotFound(format!("instance {}", id)))?;
        instance.variables.extend(variables);
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn list_rollbacks(&self, id: &Uuid) -> Result<Vec<RollbackRecord>> {
        let rollbacks = self.rollbacks.read().map_err(lock_poisoned)?;
        Ok(rollbacks.get(id).cloned().unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl EntityRepository for InMemoryStorage {
    async fn get_entity(&self, id: &str) -> Result<Option<Map<String, Value>>> {
        let entities = self.entities.read().map_err(lock_poisoned)?;
        Ok(entities.get(id).cloned())
    }

    async fn update_entity(&self, id: &str, fields: Map<String, Value>) -> Result<()> {
        let mut entities = self.entities.write().map_err(lock_poisoned)?;
        let entity = entities
            .get_mut(id)
            .ok_or_else(|| WorkflowError::NotFound(format!("entity {}", id)))?;
        entity.extend(fields);
        Ok(())
    }

    async fn compare_and_update(
        &self,
        id: &str,
        field: &str,
        expected: &Value,
        fields: Map<String, Value>,
    ) -> Result<bool> {
        let mut entities = self.entities.write().map_err(lock_poisoned)?;
        let entity = entities
            .get_mut(id)
            .ok_or_else(|| WorkflowError::NotFound(format!("entity {}", id)))?;
        if entity.get(field) != Some(expected) {
            return Ok(false);
        }
        entity.extend(fields);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{basic_order, EventId};
    use serde_json::json;

    fn commit(expected: &str, next: &str) -> InstanceCommit {
        InstanceCommit {
            expected_state: StateId::from(expected),
            next_state: StateId::from(next),
            entry: HistoryEntry::new(
                StateId::from(expected),
                StateId::from(next),
                EventId::from("go"),
                "u1",
                "",
                None,
            ),
            variables: Variables::new(),
            rollback: None,
            history_cap: 0,
        }
    }

    #[tokio::test]
    async fn test_instance_unique_per_entity() {
        let storage = InMemoryStorage::new();
        let first = WorkflowInstance::new("wf", "order", "O1", StateId::from("draft"));
        storage.create_instance(first).await.unwrap();

        let second = WorkflowInstance::new("wf", "order", "O1", StateId::from("draft"));
        let err = storage.create_instance(second).await.unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadyInitialized { .. }));

        // same id, different entity type is a different instance
        let other = WorkflowInstance::new("wf", "style", "O1", StateId::from("draft"));
        assert!(storage.create_instance(other).await.is_ok());
    }

    #[tokio::test]
    async fn test_commit_is_compare_and_swap() {
        let storage = InMemoryStorage::new();
        let instance = WorkflowInstance::new("wf", "order", "O1", StateId::from("draft"));
        let id = instance.id;
        storage.create_instance(instance).await.unwrap();

        let updated = storage.commit_transition(&id, commit("draft", "ordered")).await.unwrap();
        assert_eq!(updated.current_state, StateId::from("ordered"));
        assert_eq!(updated.history.len(), 1);

        // a second writer that also read "draft" loses
        let err = storage
            .commit_transition(&id, commit("draft", "cancelled"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::StateConflict { .. }));

        let stored = storage.get_instance(&id).await.unwrap().unwrap();
        assert_eq!(stored.current_state, StateId::from("ordered"));
        assert_eq!(stored.history.len(), 1);
    }

    #[tokio::test]
    async fn test_history_cap_drops_oldest_entries() {
        let storage = InMemoryStorage::new();
        let instance = WorkflowInstance::new("wf", "order", "O1", StateId::from("a"));
        let id = instance.id;
        storage.create_instance(instance).await.unwrap();

        for (from, to) in [("a", "b"), ("b", "c"), ("c", "d")] {
            let mut step = commit(from, to);
            step.history_cap = 2;
            storage.commit_transition(&id, step).await.unwrap();
        }

        let stored = storage.get_instance(&id).await.unwrap().unwrap();
        assert_eq!(stored.current_state, StateId::from("d"));
        let targets: Vec<&str> = stored.history.iter().map(|h| h.to_state.as_str()).collect();
        assert_eq!(targets, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_failed_rollback_commit_leaves_instance_untouched() {
        let storage = InMemoryStorage::new();
        let instance = WorkflowInstance::new("wf", "order", "O1", StateId::from("draft"));
        let id = instance.id;
        storage.create_instance(instance).await.unwrap();
        let forward = storage.commit_transition(&id, commit("draft", "ordered")).await.unwrap();

        // poison the rollback log
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = storage.rollbacks.write().unwrap();
            panic!("writer died");
        }));

        let last = forward.history.last().unwrap();
        let mut undo = commit("ordered", "draft");
        undo.entry = HistoryEntry::rollback_of(last, "u1", "undo");
        undo.rollback = Some(RollbackRecord::for_entry(&id.to_string(), last, "u1", "undo"));

        let err = storage.commit_transition(&id, undo).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Persistence(_)));

        let stored = storage.get_instance(&id).await.unwrap().unwrap();
        assert_eq!(stored.current_state, StateId::from("ordered"));
        assert_eq!(stored.history.len(), 1);
    }

    #[tokio::test]
    async fn test_activate_exclusive_deactivates_siblings() {
        let storage = InMemoryStorage::new();
        let mut v1 = basic_order();
        v1.is_active = true;
        let v2 = basic_order();
        let (v1_id, v2_id) = (v1.id.clone(), v2.id.clone());
        storage.save_definition(v1).await.unwrap();
        storage.save_definition(v2).await.unwrap();

        let active = storage.activate_exclusive(&v2_id).await.unwrap();
        assert!(active.is_active);
        assert!(!storage.get_definition(&v1_id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_entity_compare_and_update() {
        let storage = InMemoryStorage::new();
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!(0));
        storage.insert_entity("O1", fields).unwrap();

        let mut update = Map::new();
        update.insert("status".to_string(), json!(1));
        assert!(storage.compare_and_update("O1", "status", &json!(0), update.clone()).await.unwrap());
        assert!(!storage.compare_and_update("O1", "status", &json!(0), update).await.unwrap());

        let entity = storage.get_entity("O1").await.unwrap().unwrap();
        assert_eq!(entity["status"], json!(1));
    }
}
