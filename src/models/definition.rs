// Workflow definitions - reusable state machine blueprints

//! # Workflow Definitions
//!
//! A [`WorkflowDefinition`] is the blueprint an instance is bound to. It holds:
//! - An ordered list of declared states, each typed start / normal / end
//! - A list of transitions, each mapping `(from_state, event)` to `to_state`
//! - Versioning, an activation flag and audit fields
//!
//! ## Validation
//!
//! [`WorkflowDefinition::validate`] is run on every create and update. It rejects:
//! - definitions without a code or without states
//! - duplicate state ids
//! - a missing start state or a missing end state
//! - transitions referencing undeclared states
//! - transitions leaving an end state
//! - two transitions sharing the same `(from_state, event)` pair
//!
//! The last rule keeps event resolution unambiguous. Definitions stored before
//! the rule existed can still carry duplicates, so [`WorkflowDefinition::find_transition`]
//! resolves them deterministically by declaration order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use super::action::Action;
use super::condition::Condition;
use super::state::{EventId, StateId, StateType};

/// A declared state of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub id: StateId,
    pub name: String,
    #[serde(default)]
    pub code: String,
    #[serde(rename = "type", default)]
    pub state_type: StateType,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub description: String,
}

impl StateDefinition {
    pub fn new<I: Into<StateId>, N: Into<String>>(id: I, name: N, state_type: StateType) -> Self {
        let id = id.into();
        Self {
            code: id.as_str().to_string(),
            id,
            name: name.into(),
            state_type,
            color: String::new(),
            description: String::new(),
        }
    }

    /// Builder-style display color
    pub fn with_color<C: Into<String>>(mut self, color: C) -> Self {
        self.color = color.into();
        self
    }

    pub fn is_end(&self) -> bool {
        self.state_type == StateType::End
    }
}

/// A guarded transition between two declared states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub from_state: StateId,
    pub to_state: StateId,
    pub event: EventId,

    /// ANDed in order; the first failure wins
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub actions: Vec<Action>,

    /// Caller role that must match exactly; checked before any condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_role: Option<String>,

    #[serde(default)]
    pub description: String,
}

impl TransitionDefinition {
    pub fn new<I, F, T, E>(id: I, from_state: F, to_state: T, event: E) -> Self
    where
        I: Into<String>,
        F: Into<StateId>,
        T: Into<StateId>,
        E: Into<EventId>,
    {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            from_state: from_state.into(),
            to_state: to_state.into(),
            event: event.into(),
            conditions: Vec::new(),
            actions: Vec::new(),
            require_role: None,
            description: String::new(),
        }
    }

    pub fn with_name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_role<R: Into<String>>(mut self, role: R) -> Self {
        self.require_role = Some(role.into());
        self
    }
}

/// A reusable state machine blueprint
///
/// Several definitions may share a `code` (successive drafts, variants), but the
/// registry keeps at most one of them active at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub states: Vec<StateDefinition>,
    #[serde(default)]
    pub transitions: Vec<TransitionDefinition>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub updated_by: String,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Create an unsaved definition with a generated id and version 1
    pub fn new<N: Into<String>, C: Into<String>>(
        name: N,
        code: C,
        states: Vec<StateDefinition>,
        transitions: Vec<TransitionDefinition>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            code: code.into(),
            description: String::new(),
            states,
            transitions,
            version: 1,
            is_active: false,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            created_by: String::new(),
            updated_by: String::new(),
        }
    }

    /// Check the structural invariants listed in the module docs
    pub fn validate(&self) -> Result<(), String> {
        if self.code.trim().is_empty() {
            return Err("workflow code must not be empty".to_string());
        }
        if self.states.is_empty() {
            return Err(format!("workflow '{}' declares no states", self.code));
        }

        let mut state_ids = HashSet::new();
        for state in &self.states {
            if !state_ids.insert(&state.id) {
                return Err(format!("duplicate state id '{}'", state.id));
            }
        }

        if !self.states.iter().any(|s| s.state_type == StateType::Start) {
            return Err(format!("workflow '{}' has no start state", self.code));
        }
        if !self.states.iter().any(|s| s.state_type == StateType::End) {
            return Err(format!("workflow '{}' has no end state", self.code));
        }

        let mut routes = HashSet::new();
        for transition in &self.transitions {
            if !state_ids.contains(&transition.from_state) {
                return Err(format!(
                    "transition '{}' references unknown from_state '{}'",
                    transition.id, transition.from_state
                ));
            }
            if !state_ids.contains(&transition.to_state) {
                return Err(format!(
                    "transition '{}' references unknown to_state '{}'",
                    transition.id, transition.to_state
                ));
            }
            if self.is_terminal(&transition.from_state) {
                return Err(format!(
                    "transition '{}' leaves end state '{}'",
                    transition.id, transition.from_state
                ));
            }
            if !routes.insert((&transition.from_state, &transition.event)) {
                return Err(format!(
                    "transition '{}' duplicates event '{}' from state '{}'",
                    transition.id, transition.event, transition.from_state
                ));
            }
        }

        Ok(())
    }

    /// The first declared start state
    pub fn start_state(&self) -> Option<&StateDefinition> {
        self.states
            .iter()
            .find(|s| s.state_type == StateType::Start)
    }

    pub fn state(&self, id: &StateId) -> Option<&StateDefinition> {
        self.states.iter().find(|s| &s.id == id)
    }

    /// End states are sinks: no transition or rollback leaves them
    pub fn is_terminal(&self, id: &StateId) -> bool {
        self.state(id).map(|s| s.is_end()).unwrap_or(false)
    }

    /// Outgoing transitions of a state, in declaration order
    pub fn transitions_from(&self, from: &StateId) -> Vec<&TransitionDefinition> {
        self.transitions
            .iter()
            .filter(|t| &t.from_state == from)
            .collect()
    }

    /// First transition matching `(from, event)` in declaration order
    pub fn find_transition(&self, from: &StateId, event: &EventId) -> Option<&TransitionDefinition> {
        self.transitions
            .iter()
            .find(|t| &t.from_state == from && &t.event == event)
    }

    /// Distinct event names, in order of first appearance
    pub fn events(&self) -> Vec<&EventId> {
        let mut seen = HashSet::new();
        self.transitions
            .iter()
            .map(|t| &t.event)
            .filter(|e| seen.insert(*e))
            .collect()
    }

    /// States no path from the start state reaches
    pub fn find_unreachable_states(&self) -> Vec<&StateId> {
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::new();

        for start in self.states.iter().filter(|s| s.state_type == StateType::Start) {
            if reachable.insert(&start.id) {
                queue.push_back(&start.id);
            }
        }

        while let Some(current) = queue.pop_front() {
            for transition in self.transitions_from(current) {
                if reachable.insert(&transition.to_state) {
                    queue.push_back(&transition.to_state);
                }
            }
        }

        self.states
            .iter()
            .map(|s| &s.id)
            .filter(|id| !reachable.contains(id))
            .collect()
    }
}
