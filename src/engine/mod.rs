// Flowgate engines
// Runtimes, storage backends, guard evaluation, actions and the cache layer

//! # Engine Module
//!
//! Everything that executes or persists lives here; `models/` stays pure data.
//!
//! ## Components
//!
//! ### Storage (`storage`, `nats_storage`)
//! - Async repository traits for definitions, instances and entity records
//! - In-memory implementation for tests and demos
//! - NATS JetStream key/value implementation for deployments
//!
//! ### Guards and side effects (`conditions`, `actions`)
//! - Pure condition evaluation over entity data, variables and caller metadata
//! - Post-commit actions: variable updates, notifications, webhooks
//!
//! ### Runtimes (`runtime`, `order`)
//! - [`runtime::WorkflowEngine`]: definition-driven FSM with rollback
//! - [`order::OrderWorkflow`]: compiled order FSM with a fast-read cache
//!
//! ### Cache layer (`cache`, `history`)
//! - TTL key/value cache trait with capped newest-first lists
//! - Cache-resident history and rollback logs for the order fast path
//!
//! ### Authoring (`registry`)
//! - Validated create/update/activate of definitions

use std::future::Future;
use std::time::Duration;

use crate::{Result, WorkflowError};

pub mod storage;

pub mod conditions;

pub mod actions;

pub mod cache;

pub mod history;

pub mod runtime;

pub mod order;

pub mod registry;

pub mod nats_storage;


#[cfg(test)]
mod order_tests;

pub use actions::{ActionContext, ActionDispatcher, ActionExecutor, DefaultActionDispatcher, NotificationBus};
pub use cache::{InMemoryStateCache, StateCache};
pub use conditions::{ConditionEvaluator, ConditionOutcome, EvaluationContext};
pub use order::OrderWorkflow;
pub use registry::DefinitionRegistry;
pub use runtime::WorkflowEngine;
pub use storage::{DefinitionStore, EntityRepository, InMemoryStorage, InstanceCommit, InstanceStore};

/// Run a store or cache call under a deadline
///
/// An elapsed deadline becomes [`WorkflowError::Timeout`]; the inner future is
/// dropped, so nothing after its last completed await point happens.
pub(crate) async fn bounded<T, F>(limit: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(WorkflowError::Timeout(format!(
            "{} exceeded {}ms",
            what,
            limit.as_millis()
        ))),
    }
}
