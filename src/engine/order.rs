// Order fast path - compiled state machine with a fast-read status cache

//! # Order Workflow
//!
//! [`OrderWorkflow`] runs the order lifecycle from the compiled
//! [`ORDER_RULES`] table instead of a stored definition. The durable truth is
//! the order record's integer `status` field, reached through an
//! [`EntityRepository`]; a [`StateCache`] serves current status reads.
//!
//! ## Write path (saga)
//!
//! 1. Read the order record, pick the rule, check role and progress guard
//! 2. Compare-and-swap `status` on the record (`StateConflict` if it moved)
//! 3. Append the history entry to the cache-resident log (best-effort)
//! 4. Set the cached status; if that fails, delete the key; if that fails
//!    too, remember the order as unsynced so this instance bypasses the cache
//!    for it until a read repopulates it
//!
//! ## Read path
//!
//! Cache first. A miss, an error, a timeout or an undecodable value falls
//! back to the durable record and repopulates the cache with the status TTL.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashSet;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::bounded;
use super::cache::{status_key, StateCache};
use super::conditions::{ConditionEvaluator, EvaluationContext};
use super::history::HistoryLog;
use super::runtime::TransitionRequest;
use super::storage::EntityRepository;
use crate::config::EngineConfig;
use crate::models::order::{events, find_order_rule, OrderRule, OrderStatus, ORDER_RULES};
use crate::models::{EventId, HistoryEntry, RollbackRecord, StateId, ROLLBACK_EVENT};
use crate::{Result, WorkflowError};

/// Row of [`OrderWorkflow::transition_rules`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderTransitionInfo {
    pub from: &'static str,
    pub from_name: &'static str,
    pub to: &'static str,
    pub to_name: &'static str,
    pub event: &'static str,
    pub name: &'static str,
    pub has_condition: bool,
    pub require_role: Option<&'static str>,
}

/// Hard-wired order state machine with cache synchronization
pub struct OrderWorkflow {
    orders: Arc<dyn EntityRepository>,
    cache: Arc<dyn StateCache>,
    log: HistoryLog,
    evaluator: ConditionEvaluator,
    unsynced: DashSet<String>,
    config: EngineConfig,
}

impl OrderWorkflow {
    pub fn new(orders: Arc<dyn EntityRepository>, cache: Arc<dyn StateCache>, config: EngineConfig) -> Self {
        let log = HistoryLog::new(
            cache.clone(),
            &config.entity_type,
            config.history_cap,
            config.rollback_cap,
            config.log_ttl(),
            config.cache_timeout(),
        );
        Self {
            orders,
            cache,
            log,
            evaluator: ConditionEvaluator::new(),
            unsynced: DashSet::new(),
            config,
        }
    }

    /// Current status, cache first with durable fallback
    pub async fn get_current_status(&self, order_id: &str) -> Result<OrderStatus> {
        let key = status_key(&self.config.entity_type, order_id);

        if !self.unsynced.contains(order_id) {
            match bounded(self.config.cache_timeout(), "cache get", self.cache.get(&key)).await {
                Ok(Some(cached)) => match OrderStatus::from_state_id(&cached) {
                    Some(status) => return Ok(status),
                    None => warn!(order_id = %order_id, value = %cached, "Undecodable cached status"),
                },
                Ok(None) => debug!(order_id = %order_id, "Status cache miss"),
                Err(e) => warn!(order_id = %order_id, error = %e, "Status cache read failed; using durable record"),
            }
        }

        let (status, _) = self.load_order(order_id).await?;
        match bounded(
            self.config.cache_timeout(),
            "cache set",
            self.cache
                .set(&key, status.state_id().to_string(), self.config.status_ttl()),
        )
        .await
        {
            Ok(()) => {
                self.unsynced.remove(order_id);
            }
            Err(e) => warn!(order_id = %order_id, error = %e, "Status cache repopulation failed"),
        }
        Ok(status)
    }

    /// Fire an order event
    pub async fn transition(&self, request: TransitionRequest) -> Result<OrderStatus> {
        let order_id = request.entity_id.as_str();
        let (current, record) = self.load_order(order_id).await?;

        let rule = find_order_rule(current, &request.event).ok_or_else(|| {
            debug!(order_id = %order_id, state = %current, event = %request.event, "No order rule");
            WorkflowError::InvalidTransition {
                state: current.state_id().to_string(),
                event: request.event.clone(),
            }
        })?;

        if let Some(required) = rule.require_role {
            if request.role != required {
                warn!(order_id = %order_id, event = %request.event, required = %required, role = %request.role, "Order transition rejected: role mismatch");
                return Err(WorkflowError::Forbidden(format!(
                    "event '{}' requires role '{}'",
                    request.event, required
                )));
            }
        }

        if let Some(condition) = rule.condition() {
            let context = EvaluationContext::new(Some(&record), None, Some(&request.metadata));
            let outcome = self.evaluator.evaluate(&condition, &context);
            if !outcome.passed {
                let reason = outcome.reason.unwrap_or_default();
                info!(order_id = %order_id, event = %request.event, reason = %reason, "Order transition rejected: condition failed");
                return Err(WorkflowError::ConditionFailed(reason));
            }
        }

        self.swap_status(order_id, current, rule.to).await?;

        let entry = HistoryEntry::new(
            StateId::from(current.state_id()),
            StateId::from(rule.to.state_id()),
            EventId::from(rule.event),
            &request.operator,
            &request.reason,
            Some(request.metadata.clone()),
        );
        self.log.record_history(order_id, &entry).await;
        self.sync_cache(order_id, rule.to).await;

        info!(
            order_id = %order_id,
            event = %rule.event,
            from = %current,
            to = %rule.to,
            operator = %request.operator,
            "Order transition committed"
        );
        Ok(rule.to)
    }

    /// Reverse the most recent order transition
    pub async fn rollback(&self, order_id: &str, operator: &str, reason: &str) -> Result<OrderStatus> {
        let (current, _) = self.load_order(order_id).await?;
        let last = self
            .log
            .history(order_id, 1)
            .await?
            .into_iter()
            .next()
            .filter(|entry| !entry.is_rollback())
            .ok_or_else(|| WorkflowError::InvalidTransition {
                state: current.state_id().to_string(),
                event: ROLLBACK_EVENT.to_string(),
            })?;

        let reversed_to = OrderStatus::from_state_id(last.to_state.as_str());
        let target = OrderStatus::from_state_id(last.from_state.as_str()).ok_or_else(|| {
            WorkflowError::InvalidTransition {
                state: current.state_id().to_string(),
                event: ROLLBACK_EVENT.to_string(),
            }
        })?;

        if current.is_terminal() || reversed_to.map_or(false, |s| s.is_terminal()) {
            warn!(order_id = %order_id, state = %current, "Order rollback rejected: terminal state");
            return Err(WorkflowError::Forbidden(format!(
                "cannot roll back from terminal state '{}'",
                current
            )));
        }

        // a dropped history append leaves an older entry on top of the log
        if reversed_to != Some(current) {
            warn!(order_id = %order_id, state = %current, last_to = %last.to_state, "Order rollback rejected: history out of sync");
            return Err(WorkflowError::InvalidTransition {
                state: current.state_id().to_string(),
                event: ROLLBACK_EVENT.to_string(),
            });
        }

        self.swap_status(order_id, current, target).await?;

        let entry = HistoryEntry::rollback_of(&last, operator, reason);
        let record = RollbackRecord::for_entry(order_id, &last, operator, reason);
        self.log.record_history(order_id, &entry).await;
        self.log.record_rollback(order_id, &record).await;
        self.sync_cache(order_id, target).await;

        info!(order_id = %order_id, from = %current, to = %target, original_event = %last.event, operator = %operator, "Order rollback committed");
        Ok(target)
    }

    /// Record production progress and advance the order when it crosses a threshold
    ///
    /// Progress above zero starts production of an ordered order; progress of
    /// 1.0 or more completes an order in production.
    pub async fn update_progress(&self, order_id: &str, progress: f64, operator: &str) -> Result<OrderStatus> {
        let mut fields = Map::new();
        fields.insert("progress".to_string(), json!(progress));
        fields.insert("updated_at".to_string(), json!(Utc::now().timestamp()));
        bounded(
            self.config.store_timeout(),
            "update progress",
            self.orders.update_entity(order_id, fields),
        )
        .await?;

        let (current, _) = self.load_order(order_id).await?;
        let event = match current {
            OrderStatus::Production if progress >= 1.0 => events::COMPLETE,
            OrderStatus::Ordered if progress > 0.0 => events::START_PRODUCTION,
            _ => return Ok(current),
        };

        debug!(order_id = %order_id, progress, event = %event, "Progress triggers transition");
        self.transition(
            TransitionRequest::new(order_id, event)
                .operator(operator)
                .reason("progress update")
                .metadata("progress", json!(progress)),
        )
        .await
    }

    pub async fn start_cutting(&self, order_id: &str, operator: &str) -> Result<OrderStatus> {
        self.transition(TransitionRequest::new(order_id, events::START_CUTTING).operator(operator))
            .await
    }

    pub async fn start_production(&self, order_id: &str, operator: &str) -> Result<OrderStatus> {
        self.transition(TransitionRequest::new(order_id, events::START_PRODUCTION).operator(operator))
            .await
    }

    /// Complete an order; the progress guard reads the order record
    pub async fn complete_order(&self, order_id: &str, operator: &str) -> Result<OrderStatus> {
        self.transition(TransitionRequest::new(order_id, events::COMPLETE).operator(operator))
            .await
    }

    pub async fn cancel_order(&self, order_id: &str, operator: &str, role: &str, reason: &str) -> Result<OrderStatus> {
        self.transition(
            TransitionRequest::new(order_id, events::CANCEL)
                .operator(operator)
                .role(role)
                .reason(reason),
        )
        .await
    }

    /// Rules leaving the current status, in declaration order
    pub async fn get_available_transitions(&self, order_id: &str) -> Result<Vec<&'static OrderRule>> {
        let current = self.get_current_status(order_id).await?;
        Ok(ORDER_RULES.iter().filter(|r| r.from == current).collect())
    }

    /// Most recent history first; `limit == 0` means the configured default
    pub async fn get_history(&self, order_id: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.log.history(order_id, self.config.history_limit(limit)).await
    }

    pub async fn get_rollback_history(&self, order_id: &str, limit: usize) -> Result<Vec<RollbackRecord>> {
        self.log.rollbacks(order_id, self.config.history_limit(limit)).await
    }

    /// Drop the cached status so the next read goes to the durable record
    pub async fn invalidate_cache(&self, order_id: &str) -> Result<()> {
        let key = status_key(&self.config.entity_type, order_id);
        bounded(self.config.cache_timeout(), "cache delete", self.cache.delete(&key)).await
    }

    /// The compiled rule table with display names
    pub fn transition_rules() -> Vec<OrderTransitionInfo> {
        ORDER_RULES
            .iter()
            .map(|r| OrderTransitionInfo {
                from: r.from.state_id(),
                from_name: r.from.name(),
                to: r.to.state_id(),
                to_name: r.to.name(),
                event: r.event,
                name: r.name,
                has_condition: r.has_condition(),
                require_role: r.require_role,
            })
            .collect()
    }

    /// Display name of an integer status code
    pub fn status_name(code: i64) -> Option<&'static str> {
        OrderStatus::from_code(code).map(|s| s.name())
    }

    async fn load_order(&self, order_id: &str) -> Result<(OrderStatus, Map<String, Value>)> {
        let record = bounded(
            self.config.store_timeout(),
            "load order",
            self.orders.get_entity(order_id),
        )
        .await?
        .ok_or_else(|| WorkflowError::NotFound(format!("order {}", order_id)))?;

        let status = record
            .get("status")
            .and_then(Value::as_i64)
            .and_then(OrderStatus::from_code)
            .ok_or_else(|| {
                WorkflowError::Persistence(anyhow::anyhow!(
                    "order {} has no valid status field",
                    order_id
                ))
            })?;
        Ok((status, record))
    }

    async fn swap_status(&self, order_id: &str, expected: OrderStatus, next: OrderStatus) -> Result<()> {
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!(next.code()));
        fields.insert("workflow_state".to_string(), json!(next.state_id()));
        fields.insert("updated_at".to_string(), json!(Utc::now().timestamp()));

        let swapped = bounded(
            self.config.store_timeout(),
            "update order status",
            self.orders
                .compare_and_update(order_id, "status", &json!(expected.code()), fields),
        )
        .await?;

        if !swapped {
            if let Err(e) = self.invalidate_cache(order_id).await {
                warn!(order_id = %order_id, error = %e, "Cache invalidation after conflict failed");
                self.unsynced.insert(order_id.to_string());
            }
            let (actual, _) = self.load_order(order_id).await?;
            return Err(WorkflowError::StateConflict {
                instance_id: order_id.to_string(),
                expected: expected.state_id().to_string(),
                actual: actual.state_id().to_string(),
            });
        }
        Ok(())
    }

    async fn sync_cache(&self, order_id: &str, status: OrderStatus) {
        let key = status_key(&self.config.entity_type, order_id);
        let set = bounded(
            self.config.cache_timeout(),
            "cache set",
            self.cache
                .set(&key, status.state_id().to_string(), self.config.status_ttl()),
        )
        .await;

        match set {
            Ok(()) => {
                self.unsynced.remove(order_id);
            }
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "Status cache write failed; invalidating");
                if let Err(e) = self.invalidate_cache(order_id).await {
                    warn!(order_id = %order_id, error = %e, "Status cache invalidation failed; bypassing cache");
                    self.unsynced.insert(order_id.to_string());
                }
            }
        }
    }
}
