// Instance runtime - the definition-driven state machine and rollback manager

//! # Workflow Engine
//!
//! [`WorkflowEngine`] drives instances through the definition they are bound
//! to. Every dependency is injected through the constructor: definition store,
//! instance store, entity repository, action executor and configuration.
//!
//! ## Transition protocol
//!
//! 1. Load the instance for the entity (`NotFound` if none)
//! 2. Load its definition (`NotFound` if gone)
//! 3. Pick the first transition matching `(current_state, event)`
//!    (`InvalidTransition` if none, or if the current state is terminal)
//! 4. Check the required role (`Forbidden`); conditions are not evaluated
//!    when this fails
//! 5. Evaluate conditions in order (`ConditionFailed` with the first
//!    failing description)
//! 6. Commit state, history entry and merged variables in one
//!    compare-and-swap write (`StateConflict` if another writer got there first)
//! 7. Project the new state onto the entity record (best-effort)
//! 8. Run actions (best-effort)
//!
//! Steps 1-6 either all succeed or nothing is written.
//!
//! ## Rollback
//!
//! Only the most recent history entry can be reversed, and only if it did not
//! end in a terminal state. A rollback appends a synthetic `"rollback"` entry
//! and a [`RollbackRecord`] in the same commit.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::actions::{ActionContext, ActionExecutor};
use super::bounded;
use super::conditions::{ConditionEvaluator, EvaluationContext};
use super::storage::{DefinitionStore, EntityRepository, InstanceCommit, InstanceStore};
use crate::config::EngineConfig;
use crate::models::{
    EventId, HistoryEntry, RollbackRecord, StateId, TransitionDefinition, Variables, WorkflowDefinition,
    WorkflowInstance, ROLLBACK_EVENT,
};
use crate::{Result, WorkflowError};

/// One caller request to move an entity along its workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub entity_id: String,
    pub event: String,
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub metadata: Variables,
}

impl TransitionRequest {
    pub fn new<E: Into<String>, V: Into<String>>(entity_id: E, event: V) -> Self {
        Self {
            entity_id: entity_id.into(),
            event: event.into(),
            ..Default::default()
        }
    }

    pub fn operator<S: Into<String>>(mut self, operator: S) -> Self {
        self.operator = operator.into();
        self
    }

    pub fn role<S: Into<String>>(mut self, role: S) -> Self {
        self.role = role.into();
        self
    }

    pub fn reason<S: Into<String>>(mut self, reason: S) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn metadata<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Eligibility of one outgoing transition for a given caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionExplanation {
    pub transition_id: String,
    pub name: String,
    pub event: EventId,
    pub to_state: StateId,
    pub role_allowed: bool,
    pub conditions_passed: bool,
    pub eligible: bool,
    /// First blocking reason when not eligible
    pub reason: Option<String>,
}

/// Definition-driven instance runtime
pub struct WorkflowEngine {
    definitions: Arc<dyn DefinitionStore>,
    instances: Arc<dyn InstanceStore>,
    entities: Option<Arc<dyn EntityRepository>>,
    evaluator: ConditionEvaluator,
    actions: ActionExecutor,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        instances: Arc<dyn InstanceStore>,
        actions: ActionExecutor,
        config: EngineConfig,
    ) -> Self {
        Self {
            definitions,
            instances,
            entities: None,
            evaluator: ConditionEvaluator::new(),
            actions,
            config,
        }
    }

    /// Attach the owning entity repository for condition data and projection
    pub fn with_entities(mut self, entities: Arc<dyn EntityRepository>) -> Self {
        self.entities = Some(entities);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bind an entity to the active definition with `definition_code`
    ///
    /// `definition_code` may also be a definition id. The instance starts in
    /// the definition's start state with an empty history.
    pub async fn init_workflow(&self, entity_id: &str, definition_code: &str) -> Result<WorkflowInstance> {
        let definition = self.resolve_definition(definition_code).await?;
        let start = definition
            .start_state()
            .ok_or_else(|| WorkflowError::InvalidDefinition(format!("'{}' has no start state", definition.code)))?;

        if let Some(entities) = &self.entities {
            let entity = self
                .store("load entity", entities.get_entity(entity_id))
                .await?;
            if entity.is_none() {
                return Err(WorkflowError::NotFound(format!(
                    "{} {}",
                    self.config.entity_type, entity_id
                )));
            }
        }

        let instance = WorkflowInstance::new(
            &definition.id,
            self.config.entity_type.as_str(),
            entity_id,
            start.id.clone(),
        );
        let instance = self
            .store("create instance", self.instances.create_instance(instance))
            .await?;

        info!(
            entity_id = %entity_id,
            workflow = %definition.code,
            version = definition.version,
            state = %instance.current_state,
            "Workflow initialized"
        );

        let mut extra = Map::new();
        extra.insert("workflow_code".to_string(), json!(definition.code));
        extra.insert("workflow_instance".to_string(), json!(instance.id.to_string()));
        self.project(entity_id, &instance.current_state, extra).await;

        Ok(instance)
    }

    /// Fire an event against an entity's instance
    pub async fn transition(&self, request: TransitionRequest) -> Result<WorkflowInstance> {
        let instance = self.load_instance(&request.entity_id).await?;
        let definition = self.load_definition(&instance.workflow_id).await?;
        let current = instance.current_state.clone();
        let event = EventId::from(request.event.as_str());

        let transition = match definition.find_transition(&current, &event) {
            Some(t) if !definition.is_terminal(&current) => t,
            _ => {
                debug!(entity_id = %request.entity_id, state = %current, event = %event, "No transition rule");
                return Err(WorkflowError::InvalidTransition {
                    state: current.to_string(),
                    event: event.to_string(),
                });
            }
        };

        if let Some(required) = &transition.require_role {
            if &request.role != required {
                warn!(
                    entity_id = %request.entity_id,
                    event = %event,
                    required = %required,
                    role = %request.role,
                    "Transition rejected: role mismatch"
                );
                return Err(WorkflowError::Forbidden(format!(
                    "event '{}' requires role '{}'",
                    event, required
                )));
            }
        }

        let entity = self.load_entity(&request.entity_id).await?;
        let context = EvaluationContext::new(entity.as_ref(), Some(&instance.variables), Some(&request.metadata));
        let outcome = self.evaluator.evaluate_all(&transition.conditions, &context);
        if !outcome.passed {
            let reason = outcome.reason.unwrap_or_default();
            info!(entity_id = %request.entity_id, event = %event, reason = %reason, "Transition rejected: condition failed");
            return Err(WorkflowError::ConditionFailed(reason));
        }

        let next = transition.to_state.clone();
        let entry = HistoryEntry::new(
            current.clone(),
            next.clone(),
            event.clone(),
            &request.operator,
            &request.reason,
            Some(request.metadata.clone()),
        );
        let commit = InstanceCommit {
            expected_state: current.clone(),
            next_state: next.clone(),
            entry,
            variables: request.metadata.clone(),
            rollback: None,
            history_cap: self.config.instance_history_cap,
        };
        let updated = self
            .store("commit transition", self.instances.commit_transition(&instance.id, commit))
            .await?;

        info!(
            entity_id = %request.entity_id,
            event = %event,
            from = %current,
            to = %next,
            operator = %request.operator,
            "Transition committed"
        );

        self.project(&request.entity_id, &next, Map::new()).await;
        self.run_actions(transition, &updated, &current, &request.operator).await;

        Ok(updated)
    }

    /// Current state of an entity's instance
    pub async fn get_state(&self, entity_id: &str) -> Result<StateId> {
        Ok(self.load_instance(entity_id).await?.current_state)
    }

    /// The full instance bound to an entity
    pub async fn get_instance(&self, entity_id: &str) -> Result<WorkflowInstance> {
        self.load_instance(entity_id).await
    }

    /// Outgoing transitions of the current state, in declaration order
    ///
    /// Role and conditions are not checked; see [`Self::explain_transitions`].
    pub async fn get_available_transitions(&self, entity_id: &str) -> Result<Vec<TransitionDefinition>> {
        let instance = self.load_instance(entity_id).await?;
        let definition = self.load_definition(&instance.workflow_id).await?;
        if definition.is_terminal(&instance.current_state) {
            return Ok(Vec::new());
        }
        Ok(definition
            .transitions_from(&instance.current_state)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Check every outgoing transition against a caller's role and metadata
    pub async fn explain_transitions(
        &self,
        entity_id: &str,
        role: &str,
        metadata: &Variables,
    ) -> Result<Vec<TransitionExplanation>> {
        let instance = self.load_instance(entity_id).await?;
        let definition = self.load_definition(&instance.workflow_id).await?;
        if definition.is_terminal(&instance.current_state) {
            return Ok(Vec::new());
        }
        let entity = self.load_entity(entity_id).await?;
        let context = EvaluationContext::new(entity.as_ref(), Some(&instance.variables), Some(metadata));

        Ok(definition
            .transitions_from(&instance.current_state)
            .into_iter()
            .map(|t| {
                let role_allowed = t.require_role.as_deref().map_or(true, |r| r == role);
                let outcome = self.evaluator.evaluate_all(&t.conditions, &context);
                let reason = if !role_allowed {
                    t.require_role.as_ref().map(|r| format!("requires role '{}'", r))
                } else {
                    outcome.reason.clone()
                };
                TransitionExplanation {
                    transition_id: t.id.clone(),
                    name: t.name.clone(),
                    event: t.event.clone(),
                    to_state: t.to_state.clone(),
                    role_allowed,
                    conditions_passed: outcome.passed,
                    eligible: role_allowed && outcome.passed,
                    reason,
                }
            })
            .collect())
    }

    /// Most recent history entries first; `limit == 0` means the configured default
    pub async fn get_history(&self, entity_id: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        let instance = self.load_instance(entity_id).await?;
        Ok(instance.recent_history(self.config.history_limit(limit)))
    }

    /// Reverse the most recent transition
    pub async fn rollback(&self, entity_id: &str, operator: &str, reason: &str) -> Result<WorkflowInstance> {
        let instance = self.load_instance(entity_id).await?;
        let definition = self.load_definition(&instance.workflow_id).await?;

        let last = match instance.last_entry() {
            Some(entry) if !entry.is_rollback() => entry,
            _ => {
                return Err(WorkflowError::InvalidTransition {
                    state: instance.current_state.to_string(),
                    event: ROLLBACK_EVENT.to_string(),
                })
            }
        };

        if definition.is_terminal(&last.to_state) || definition.is_terminal(&instance.current_state) {
            warn!(entity_id = %entity_id, state = %last.to_state, "Rollback rejected: terminal state");
            return Err(WorkflowError::Forbidden(format!(
                "cannot roll back from terminal state '{}'",
                last.to_state
            )));
        }

        let entry = HistoryEntry::rollback_of(last, operator, reason);
        let record = RollbackRecord::for_entry(&instance.id.to_string(), last, operator, reason);
        let target = last.from_state.clone();
        let commit = InstanceCommit {
            expected_state: instance.current_state.clone(),
            next_state: target.clone(),
            entry,
            variables: Variables::new(),
            rollback: Some(record),
            history_cap: self.config.instance_history_cap,
        };
        let updated = self
            .store("commit rollback", self.instances.commit_transition(&instance.id, commit))
            .await?;

        info!(
            entity_id = %entity_id,
            from = %instance.current_state,
            to = %target,
            original_event = %last.event,
            operator = %operator,
            "Rollback committed"
        );

        self.project(entity_id, &target, Map::new()).await;
        Ok(updated)
    }

    /// Rollback records, most recent first
    pub async fn get_rollback_history(&self, entity_id: &str, limit: usize) -> Result<Vec<RollbackRecord>> {
        let instance = self.load_instance(entity_id).await?;
        let records = self
            .store("list rollbacks", self.instances.list_rollbacks(&instance.id))
            .await?;
        Ok(records
            .into_iter()
            .rev()
            .take(self.config.history_limit(limit))
            .collect())
    }

    async fn store<T, F>(&self, what: &str, call: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        bounded(self.config.store_timeout(), what, call).await
    }

    async fn resolve_definition(&self, code_or_id: &str) -> Result<WorkflowDefinition> {
        let definitions = self
            .store("list definitions", self.definitions.list_definitions())
            .await?;
        if let Some(active) = definitions
            .into_iter()
            .find(|d| d.code == code_or_id && d.is_active)
        {
            return Ok(active);
        }
        self.store("load definition", self.definitions.get_definition(code_or_id))
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("active workflow definition '{}'", code_or_id)))
    }

    async fn load_instance(&self, entity_id: &str) -> Result<WorkflowInstance> {
        self.store(
            "load instance",
            self.instances
                .find_by_entity(&self.config.entity_type, entity_id),
        )
        .await?
        .ok_or_else(|| WorkflowError::NotFound(format!("workflow instance for {} {}", self.config.entity_type, entity_id)))
    }

    async fn load_definition(&self, id: &str) -> Result<WorkflowDefinition> {
        self.store("load definition", self.definitions.get_definition(id))
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow definition {}", id)))
    }

    async fn load_entity(&self, entity_id: &str) -> Result<Option<Map<String, Value>>> {
        match &self.entities {
            Some(entities) => self.store("load entity", entities.get_entity(entity_id)).await,
            None => Ok(None),
        }
    }

    /// Write workflow fields onto the entity record; failures are logged only
    async fn project(&self, entity_id: &str, state: &StateId, mut fields: Map<String, Value>) {
        let Some(entities) = &self.entities else {
            return;
        };
        fields.insert("workflow_state".to_string(), json!(state.as_str()));
        fields.insert("updated_at".to_string(), json!(Utc::now().timestamp()));
        if let Some(status) = self.config.status_for(state.as_str()) {
            fields.insert("status".to_string(), json!(status));
        }
        if let Err(e) = self
            .store("project entity", entities.update_entity(entity_id, fields))
            .await
        {
            warn!(entity_id = %entity_id, state = %state, error = %e, "Entity projection failed");
        }
    }

    async fn run_actions(
        &self,
        transition: &TransitionDefinition,
        instance: &WorkflowInstance,
        from: &StateId,
        operator: &str,
    ) {
        if transition.actions.is_empty() {
            return;
        }
        let context = ActionContext {
            instance_id: Some(instance.id),
            entity_type: instance.entity_type.clone(),
            entity_id: instance.entity_id.clone(),
            event: transition.event.clone(),
            from_state: from.clone(),
            to_state: transition.to_state.clone(),
            operator: operator.to_string(),
        };
        self.actions.execute(&transition.actions, &context).await;
    }
}
