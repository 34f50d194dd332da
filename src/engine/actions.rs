// Action executor - best-effort side effects after a committed transition

//! # Action Executor
//!
//! Runs a transition's actions once its commit has succeeded:
//!
//! - `update_field`: merge a value into the instance's variables
//! - `notify`: publish a [`WorkflowNotification`] through the dispatcher
//! - `webhook`: POST a JSON body through the dispatcher
//! - unknown kinds: logged and skipped
//!
//! Every failure is logged at `warn` and swallowed. Nothing here can undo the
//! transition, and nothing is retried.
//!
//! Delivery goes through the [`ActionDispatcher`] trait. [`DefaultActionDispatcher`]
//! publishes notifications on a tokio broadcast [`NotificationBus`] and sends
//! webhooks with `reqwest`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bounded;
use super::storage::InstanceStore;
use crate::models::{Action, ActionKind, EventId, StateId, Variables};
use crate::{Result, WorkflowError};

/// What a transition's actions are executed for
#[derive(Debug, Clone, Serialize)]
pub struct ActionContext {
    /// Instance to write `update_field` results into; absent on the order fast path
    pub instance_id: Option<Uuid>,
    pub entity_type: String,
    pub entity_id: String,
    pub event: EventId,
    pub from_state: StateId,
    pub to_state: StateId,
    pub operator: String,
}

/// Message published by a `notify` action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNotification {
    pub channel: String,
    pub message: Value,
    pub entity_type: String,
    pub entity_id: String,
    pub event: EventId,
    pub from_state: StateId,
    pub to_state: StateId,
    pub operator: String,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast bus for workflow notifications
#[derive(Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<WorkflowNotification>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to current subscribers; returns how many received it
    pub fn publish(&self, notification: WorkflowNotification) -> usize {
        // no subscribers is not an error
        self.sender.send(notification).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowNotification> {
        self.sender.subscribe()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Delivery of outward-facing actions
#[async_trait::async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn notify(&self, notification: WorkflowNotification) -> Result<()>;

    async fn webhook(&self, url: &str, body: Value) -> Result<()>;
}

/// Broadcast notifications and `reqwest` webhooks
pub struct DefaultActionDispatcher {
    bus: NotificationBus,
    http: reqwest::Client,
    timeout: Duration,
}

impl DefaultActionDispatcher {
    pub fn new(bus: NotificationBus, timeout: Duration) -> Self {
        Self {
            bus,
            http: reqwest::Client::new(),
            timeout,
        }
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }
}

#[async_trait::async_trait]
impl ActionDispatcher for DefaultActionDispatcher {
    async fn notify(&self, notification: WorkflowNotification) -> Result<()> {
        let receivers = self.bus.publish(notification);
        debug!(receivers, "Notification published");
        Ok(())
    }

    async fn webhook(&self, url: &str, body: Value) -> Result<()> {
        let response = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| WorkflowError::Persistence(anyhow::anyhow!("webhook {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WorkflowError::Persistence(anyhow::anyhow!(
                "webhook {} returned {}",
                url,
                status
            )));
        }
        Ok(())
    }
}

/// Runs transition actions after commit
#[derive(Clone)]
pub struct ActionExecutor {
    dispatcher: Arc<dyn ActionDispatcher>,
    instances: Option<Arc<dyn InstanceStore>>,
    store_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(dispatcher: Arc<dyn ActionDispatcher>, store_timeout: Duration) -> Self {
        Self {
            dispatcher,
            instances: None,
            store_timeout,
        }
    }

    /// Enable `update_field` by giving the executor the instance store
    pub fn with_instance_store(mut self, instances: Arc<dyn InstanceStore>) -> Self {
        self.instances = Some(instances);
        self
    }

    /// Execute every action in order; returns how many failed
    pub async fn execute(&self, actions: &[Action], context: &ActionContext) -> usize {
        let mut failures = 0;
        for action in actions {
            if let Err(e) = self.execute_one(action, context).await {
                failures += 1;
                warn!(
                    entity_id = %context.entity_id,
                    event = %context.event,
                    action = action.kind_name(),
                    error = %e,
                    "Action failed after commit; transition stands"
                );
            }
        }
        failures
    }

    async fn execute_one(&self, action: &Action, context: &ActionContext) -> Result<()> {
        match &action.kind {
            ActionKind::UpdateField { field, value } => {
                let (Some(instances), Some(instance_id)) = (&self.instances, context.instance_id) else {
                    debug!(field = %field, "No instance to update; skipping update_field");
                    return Ok(());
                };
                let mut variables = Variables::new();
                variables.insert(field.clone(), value.clone());
                bounded(
                    self.store_timeout,
                    "update_field",
                    instances.update_variables(&instance_id, variables),
                )
                .await
            }
            ActionKind::Notify { channel, message } => {
                self.dispatcher
                    .notify(WorkflowNotification {
                        channel: channel.clone(),
                        message: message.clone(),
                        entity_type: context.entity_type.clone(),
                        entity_id: context.entity_id.clone(),
                        event: context.event.clone(),
                        from_state: context.from_state.clone(),
                        to_state: context.to_state.clone(),
                        operator: context.operator.clone(),
                        timestamp: Utc::now(),
                    })
                    .await
            }
            ActionKind::Webhook { url, payload } => {
                let body = json!({
                    "entity_type": context.entity_type,
                    "entity_id": context.entity_id,
                    "event": context.event,
                    "from_state": context.from_state,
                    "to_state": context.to_state,
                    "operator": context.operator,
                    "payload": payload,
                });
                self.dispatcher.webhook(url, body).await?;
                info!(entity_id = %context.entity_id, url = %url, "Webhook delivered");
                Ok(())
            }
            ActionKind::Unknown => {
                warn!(description = %action.description, "Unknown action kind; skipping");
                Ok(())
            }
        }
    }
}
