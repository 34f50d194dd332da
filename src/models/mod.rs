// Core domain models for Flowgate
// Plain data: definitions, instances, guards, actions and the order table

//! # Domain Models Module
//!
//! Pure data structures shared by every engine. Nothing in here performs I/O;
//! evaluation and persistence live in `engine/`.
//!
//! - `state`: [`StateId`], [`EventId`], [`StateType`]
//! - `definition`: [`WorkflowDefinition`] and its validation
//! - `condition` / `action`: the tagged unions carried by transitions
//! - `instance`: [`WorkflowInstance`], [`HistoryEntry`], [`RollbackRecord`]
//! - `order`: the compiled order state machine and the `basic_order` seed

pub mod state;

pub mod definition;

pub mod condition;

pub mod action;

pub mod instance;

pub mod order;

pub use state::{EventId, StateId, StateType};

pub use definition::{StateDefinition, TransitionDefinition, WorkflowDefinition};

pub use condition::{Condition, ConditionKind, Operator};

pub use action::{Action, ActionKind};

pub use instance::{HistoryEntry, RollbackRecord, Variables, WorkflowInstance, ROLLBACK_EVENT};

pub use order::{basic_order, OrderRule, OrderStatus, ORDER_RULES};
