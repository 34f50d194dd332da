// Workflow instances and their audit trail

//! # Workflow Instances
//!
//! A [`WorkflowInstance`] binds one definition to one business entity. It is
//! created once, mutated on every committed transition, and never hard-deleted
//! by the engine.
//!
//! The embedded `history` is append-only and oldest-first. Its last entry is
//! the rollback target. Rollbacks additionally produce a [`RollbackRecord`],
//! stored separately, and a synthetic history entry with event `"rollback"`
//! so the audit trail stays one linear sequence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::state::{EventId, StateId};

/// Arbitrary key/value data persisted across transitions
pub type Variables = HashMap<String, serde_json::Value>;

/// Event name of the synthetic history entry written by a rollback
pub const ROLLBACK_EVENT: &str = "rollback";

/// One running execution of a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub workflow_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub current_state: StateId,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub variables: Variables,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// New instance placed in `initial_state` with an empty history
    pub fn new<T: Into<String>, E: Into<String>>(
        workflow_id: &str,
        entity_type: T,
        entity_id: E,
        initial_state: StateId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.to_string(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            current_state: initial_state,
            history: Vec::new(),
            variables: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn last_entry(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }

    /// Up to `limit` entries, most recent first
    pub fn recent_history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.history.iter().rev().take(limit).cloned().collect()
    }
}

/// One committed transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub from_state: StateId,
    pub to_state: StateId,
    pub event: EventId,
    pub operator: String,
    #[serde(default)]
    pub reason: String,
    /// Unix seconds
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Variables>,
}

impl HistoryEntry {
    pub fn new(
        from_state: StateId,
        to_state: StateId,
        event: EventId,
        operator: &str,
        reason: &str,
        metadata: Option<Variables>,
    ) -> Self {
        Self {
            from_state,
            to_state,
            event,
            operator: operator.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
            metadata: metadata.filter(|m| !m.is_empty()),
        }
    }

    /// Synthetic entry appended when `reversed` is rolled back
    ///
    /// Moves from the reversed entry's target back to its source, and links the
    /// original event in metadata.
    pub fn rollback_of(reversed: &HistoryEntry, operator: &str, reason: &str) -> Self {
        let mut metadata = Variables::new();
        metadata.insert("rollback".to_string(), serde_json::Value::Bool(true));
        metadata.insert(
            "original_event".to_string(),
            serde_json::Value::String(reversed.event.as_str().to_string()),
        );
        Self::new(
            reversed.to_state.clone(),
            reversed.from_state.clone(),
            EventId::from(ROLLBACK_EVENT),
            operator,
            reason,
            Some(metadata),
        )
    }

    pub fn is_rollback(&self) -> bool {
        self.event.as_str() == ROLLBACK_EVENT
    }
}

/// Audit record of one rollback, kept apart from the history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub instance_id: String,
    pub rollback_from: StateId,
    pub rollback_to: StateId,
    pub original_event: EventId,
    pub operator: String,
    #[serde(default)]
    pub reason: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Variables>,
}

impl RollbackRecord {
    pub fn for_entry(instance_id: &str, reversed: &HistoryEntry, operator: &str, reason: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            rollback_from: reversed.to_state.clone(),
            rollback_to: reversed.from_state.clone(),
            original_event: reversed.event.clone(),
            operator: operator.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }
}
