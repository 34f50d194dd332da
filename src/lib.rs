// Flowgate - configurable workflow state machines for business entities
// Definitions, guarded transitions, audit history and single-step rollback

//! # Flowgate Library
//!
//! This is the main library crate for Flowgate, a workflow engine that governs
//! the lifecycle of business entities (principally orders) through named states.
//! This file is the **library root** and defines the public API.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`WorkflowDefinition`]: a reusable blueprint of states and transitions
//! - [`TransitionDefinition`]: a rule mapping `(state, event)` to a new state, with guards
//! - [`Condition`] / [`Action`]: guard conditions and post-commit side effects
//! - [`WorkflowInstance`]: one running execution bound to one business entity
//! - [`HistoryEntry`] / [`RollbackRecord`]: the audit trail
//!
//! ### Engines
//!
//! #### [`WorkflowEngine`] - definition-driven runtime
//!
//! Loads the bound definition, selects the transition for the current state and
//! event, checks the required role, then the guard conditions, and commits state
//! plus history in one compare-and-swap write. Actions run after the commit and
//! can never undo it.
//!
//! #### [`OrderWorkflow`] - hard-wired order fast path
//!
//! States, events and rules are compiled into code. Current status is served
//! from a [`StateCache`] with durable fallback; history and rollback logs are
//! cache-resident capped lists.
//!
//! #### [`DefinitionRegistry`] - authoring surface
//!
//! Validates and persists definitions, and keeps at most one active definition
//! per code.
//!
//! ### Storage Layer
//! Pluggable async traits ([`DefinitionStore`], [`InstanceStore`],
//! [`EntityRepository`], [`StateCache`]) with in-memory and NATS JetStream
//! implementations.

// Core domain models
pub mod models;

// Engines, storage backends and the cache layer
pub mod engine;

// Layered configuration
pub mod config;

// Re-export core domain types for easy access
pub use models::{
    Action,              // Post-commit side effect
    Condition,           // Guard condition
    EventId,             // Triggering event name
    HistoryEntry,        // One committed transition
    Operator,            // Guard comparison operator
    RollbackRecord,      // Audit record of a rollback
    StateDefinition,     // Declared state
    StateId,             // State identifier
    StateType,           // start / normal / end
    TransitionDefinition, // Guarded transition rule
    Variables,           // Instance variable map
    WorkflowDefinition,  // Blueprint
    WorkflowInstance,    // Running instance
};

pub use models::order::{basic_order, OrderStatus};

// Re-export engine types for convenience
pub use engine::{
    actions::{ActionDispatcher, ActionExecutor, DefaultActionDispatcher, NotificationBus, WorkflowNotification},
    cache::{InMemoryStateCache, StateCache},
    conditions::{ConditionOutcome, EvaluationContext},
    nats_storage::{NatsStateCache, NatsStorage, NatsStorageConfig},
    order::OrderWorkflow,
    registry::DefinitionRegistry,
    runtime::{TransitionExplanation, TransitionRequest, WorkflowEngine},
    storage::{DefinitionStore, EntityRepository, InMemoryStorage, InstanceStore},
};

pub use config::EngineConfig;

use thiserror::Error;

/// Errors returned by every engine operation
///
/// Business rule violations are ordinary values of this type; the engine never
/// panics on them. Storage backends fold their own error types into
/// [`WorkflowError::Persistence`].
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Instance, definition or entity is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// A workflow instance already exists for this entity
    #[error("Workflow already initialized for {entity_type} {entity_id}")]
    AlreadyInitialized {
        entity_type: String,
        entity_id: String,
    },

    /// No transition rule matches the current state and event
    #[error("Invalid transition: no rule for event '{event}' in state '{state}'")]
    InvalidTransition { state: String, event: String },

    /// Role requirement not met, or rollback of a finalized outcome
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A guard condition evaluated to false; carries its description
    #[error("Condition failed: {0}")]
    ConditionFailed(String),

    /// The instance moved on between read and write (compare-and-swap lost)
    #[error("State conflict on {instance_id}: expected '{expected}', found '{actual}'")]
    StateConflict {
        instance_id: String,
        expected: String,
        actual: String,
    },

    /// Definition failed validation
    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    /// Durable write or read failed; nothing was committed
    #[error("Persistence failure: {0}")]
    Persistence(#[from] anyhow::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// A store or cache call exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),
}

/// Type alias for Results that use our error type
pub type Result<T> = std::result::Result<T, WorkflowError>;
