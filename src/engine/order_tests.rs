// Order fast path tests: durable status, cache synchronization and rollback

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio_test::{assert_err, assert_ok};

use super::cache::{status_key, InMemoryStateCache, StateCache};
use super::order::OrderWorkflow;
use super::runtime::TransitionRequest;
use super::storage::{EntityRepository, InMemoryStorage};
use crate::config::EngineConfig;
use crate::models::order::{OrderStatus, PROGRESS_GUARD_MESSAGE};
use crate::models::{EventId, StateId};
use crate::{Result, WorkflowError};

fn order_record(status: i64, progress: f64) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("order_no".to_string(), json!("SO-0001"));
    fields.insert("status".to_string(), json!(status));
    fields.insert("progress".to_string(), json!(progress));
    fields
}

fn setup_with_cache(cache: Arc<dyn StateCache>) -> (Arc<InMemoryStorage>, OrderWorkflow) {
    let orders = Arc::new(InMemoryStorage::new());
    orders.insert_entity("O1", order_record(0, 0.0)).unwrap();
    let workflow = OrderWorkflow::new(orders.clone(), cache, EngineConfig::default());
    (orders, workflow)
}

fn setup() -> (Arc<InMemoryStorage>, Arc<InMemoryStateCache>, OrderWorkflow) {
    let cache = Arc::new(InMemoryStateCache::new());
    let (orders, workflow) = setup_with_cache(cache.clone());
    (orders, cache, workflow)
}

async fn durable_status(orders: &InMemoryStorage, id: &str) -> i64 {
    orders.get_entity(id).await.unwrap().unwrap()["status"].as_i64().unwrap()
}

#[tokio::test]
async fn test_order_lifecycle() {
    let (orders, cache, workflow) = setup();

    assert_eq!(workflow.get_current_status("O1").await.unwrap(), OrderStatus::Draft);

    let status = workflow
        .transition(TransitionRequest::new("O1", "submit_order").operator("u1").role("sales"))
        .await
        .unwrap();
    assert_eq!(status, OrderStatus::Ordered);
    assert_eq!(durable_status(&orders, "O1").await, 1);
    assert_eq!(
        cache.get(&status_key("order", "O1")).await.unwrap().as_deref(),
        Some("ordered")
    );

    assert_eq!(workflow.start_cutting("O1", "u1").await.unwrap(), OrderStatus::Production);

    let err = workflow
        .transition(TransitionRequest::new("O1", "complete").operator("u1").metadata("progress", json!(0.8)))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::ConditionFailed(ref r) if r == PROGRESS_GUARD_MESSAGE));
    assert_eq!(durable_status(&orders, "O1").await, 2);

    let status = workflow
        .transition(TransitionRequest::new("O1", "complete").operator("u1").metadata("progress", json!(1.0)))
        .await
        .unwrap();
    assert_eq!(status, OrderStatus::Completed);
    assert_eq!(workflow.get_current_status("O1").await.unwrap(), OrderStatus::Completed);

    let err = workflow.rollback("O1", "u1", "oops").await.unwrap_err();
    assert!(matches!(err, WorkflowError::Forbidden(_)));
    assert_eq!(durable_status(&orders, "O1").await, 3);

    let history = workflow.get_history("O1", 0).await.unwrap();
    let events: Vec<&str> = history.iter().map(|h| h.event.as_str()).collect();
    assert_eq!(events, vec!["complete", "start_cutting", "submit_order"]);
}

#[tokio::test]
async fn test_cold_cache_reads_durable_record() {
    let (_orders, cache, workflow) = setup();
    workflow
        .transition(TransitionRequest::new("O1", "submit_order").operator("u1"))
        .await
        .unwrap();

    cache.clear();
    assert!(cache.is_empty());

    assert_eq!(workflow.get_current_status("O1").await.unwrap(), OrderStatus::Ordered);
    assert_eq!(
        cache.get(&status_key("order", "O1")).await.unwrap().as_deref(),
        Some("ordered")
    );
}

#[tokio::test]
async fn test_undecodable_cache_value_falls_back() {
    let (_orders, cache, workflow) = setup();
    cache
        .set(&status_key("order", "O1"), "???".to_string(), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(workflow.get_current_status("O1").await.unwrap(), OrderStatus::Draft);
}

#[tokio::test]
async fn test_transition_ignores_stale_cache() {
    let (orders, cache, workflow) = setup();
    let key = status_key("order", "O1");
    cache.set(&key, "draft".to_string(), Duration::from_secs(60)).await.unwrap();

    // another process moved the order without touching this cache
    let mut fields = Map::new();
    fields.insert("status".to_string(), json!(1));
    orders.update_entity("O1", fields).await.unwrap();

    let status = workflow.start_cutting("O1", "u1").await.unwrap();
    assert_eq!(status, OrderStatus::Production);
    assert_eq!(cache.get(&key).await.unwrap().as_deref(), Some("production"));
}

/// Cache whose writes can be switched off
struct FlakyCache {
    inner: InMemoryStateCache,
    fail_set: AtomicBool,
    fail_delete: AtomicBool,
    fail_push: AtomicBool,
}

impl FlakyCache {
    fn new() -> Self {
        Self {
            inner: InMemoryStateCache::new(),
            fail_set: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            fail_push: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl StateCache for FlakyCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        if self.fail_set.load(Ordering::SeqCst) {
            return Err(WorkflowError::Persistence(anyhow::anyhow!("cache write refused")));
        }
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(WorkflowError::Persistence(anyhow::anyhow!("cache delete refused")));
        }
        self.inner.delete(key).await
    }

    async fn push_capped(&self, key: &str, value: String, cap: usize, ttl: Duration) -> Result<()> {
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(WorkflowError::Persistence(anyhow::anyhow!("cache append refused")));
        }
        self.inner.push_capped(key, value, cap, ttl).await
    }

    async fn range(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        self.inner.range(key, limit).await
    }
}

#[tokio::test]
async fn test_failed_cache_write_invalidates() {
    let cache = Arc::new(FlakyCache::new());
    let (_orders, workflow) = setup_with_cache(cache.clone());
    let key = status_key("order", "O1");

    assert_eq!(workflow.get_current_status("O1").await.unwrap(), OrderStatus::Draft);
    assert_eq!(cache.inner.get(&key).await.unwrap().as_deref(), Some("draft"));

    cache.fail_set.store(true, Ordering::SeqCst);
    workflow
        .transition(TransitionRequest::new("O1", "submit_order").operator("u1"))
        .await
        .unwrap();

    assert_eq!(cache.inner.get(&key).await.unwrap(), None);
    assert_eq!(workflow.get_current_status("O1").await.unwrap(), OrderStatus::Ordered);
}

#[tokio::test]
async fn test_unreachable_cache_is_bypassed() {
    let cache = Arc::new(FlakyCache::new());
    let (_orders, workflow) = setup_with_cache(cache.clone());
    let key = status_key("order", "O1");

    assert_eq!(workflow.get_current_status("O1").await.unwrap(), OrderStatus::Draft);

    cache.fail_set.store(true, Ordering::SeqCst);
    cache.fail_delete.store(true, Ordering::SeqCst);
    workflow
        .transition(TransitionRequest::new("O1", "submit_order").operator("u1"))
        .await
        .unwrap();

    // the stale entry is still there but never served
    assert_eq!(cache.inner.get(&key).await.unwrap().as_deref(), Some("draft"));
    assert_eq!(workflow.get_current_status("O1").await.unwrap(), OrderStatus::Ordered);

    cache.fail_set.store(false, Ordering::SeqCst);
    cache.fail_delete.store(false, Ordering::SeqCst);
    assert_eq!(workflow.get_current_status("O1").await.unwrap(), OrderStatus::Ordered);
    assert_eq!(cache.inner.get(&key).await.unwrap().as_deref(), Some("ordered"));
}

#[tokio::test]
async fn test_rollback_refuses_history_behind_durable_status() {
    let cache = Arc::new(FlakyCache::new());
    let (orders, workflow) = setup_with_cache(cache.clone());

    workflow
        .transition(TransitionRequest::new("O1", "submit_order").operator("u1"))
        .await
        .unwrap();
    cache.fail_push.store(true, Ordering::SeqCst);
    workflow.start_cutting("O1", "u1").await.unwrap();
    cache.fail_push.store(false, Ordering::SeqCst);

    // newest logged entry is submit_order, but the order is in production
    let err = workflow.rollback("O1", "u2", "undo").await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::InvalidTransition { ref state, ref event } if state == "production" && event == "rollback"
    ));
    assert_eq!(durable_status(&orders, "O1").await, 2);
    assert_eq!(workflow.get_current_status("O1").await.unwrap(), OrderStatus::Production);
    assert!(workflow.get_rollback_history("O1", 0).await.unwrap().is_empty());
    assert_eq!(workflow.get_history("O1", 0).await.unwrap().len(), 1);
}

/// Order repository where a competing writer cancels the order first
struct RacingOrders {
    inner: Arc<InMemoryStorage>,
    raced: AtomicBool,
}

#[async_trait::async_trait]
impl EntityRepository for RacingOrders {
    async fn get_entity(&self, id: &str) -> Result<Option<Map<String, Value>>> {
        self.inner.get_entity(id).await
    }

    async fn update_entity(&self, id: &str, fields: Map<String, Value>) -> Result<()> {
        self.inner.update_entity(id, fields).await
    }

    async fn compare_and_update(
        &self,
        id: &str,
        field: &str,
        expected: &Value,
        fields: Map<String, Value>,
    ) -> Result<bool> {
        if !self.raced.swap(true, Ordering::SeqCst) {
            let mut competing = Map::new();
            competing.insert("status".to_string(), json!(OrderStatus::Cancelled.code()));
            self.inner.update_entity(id, competing).await?;
        }
        self.inner.compare_and_update(id, field, expected, fields).await
    }
}

#[tokio::test]
async fn test_lost_race_is_state_conflict() {
    let storage = Arc::new(InMemoryStorage::new());
    storage.insert_entity("O1", order_record(0, 0.0)).unwrap();
    let cache = Arc::new(InMemoryStateCache::new());
    let workflow = OrderWorkflow::new(
        Arc::new(RacingOrders {
            inner: storage.clone(),
            raced: AtomicBool::new(false),
        }),
        cache.clone(),
        EngineConfig::default(),
    );

    assert_eq!(workflow.get_current_status("O1").await.unwrap(), OrderStatus::Draft);

    let err = workflow
        .transition(TransitionRequest::new("O1", "submit_order").operator("u1"))
        .await
        .unwrap_err();
    match err {
        WorkflowError::StateConflict { expected, actual, .. } => {
            assert_eq!(expected, "draft");
            assert_eq!(actual, "cancelled");
        }
        other => panic!("expected StateConflict, got {:?}", other),
    }

    // the cached draft was invalidated, so the next read sees the winner
    assert_eq!(workflow.get_current_status("O1").await.unwrap(), OrderStatus::Cancelled);
    assert!(workflow.get_history("O1", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_progress_drives_transitions() {
    let (orders, _cache, workflow) = setup();

    assert_eq!(workflow.update_progress("O1", 0.5, "u1").await.unwrap(), OrderStatus::Draft);

    workflow
        .transition(TransitionRequest::new("O1", "submit_order").operator("u1"))
        .await
        .unwrap();
    assert_eq!(
        workflow.update_progress("O1", 0.3, "worker").await.unwrap(),
        OrderStatus::Production
    );
    assert_eq!(
        workflow.update_progress("O1", 0.9, "worker").await.unwrap(),
        OrderStatus::Production
    );
    assert_eq!(
        workflow.update_progress("O1", 1.0, "worker").await.unwrap(),
        OrderStatus::Completed
    );

    let record = orders.get_entity("O1").await.unwrap().unwrap();
    assert_eq!(record["progress"], json!(1.0));
    assert_eq!(record["workflow_state"], json!("completed"));

    let history = workflow.get_history("O1", 2).await.unwrap();
    assert_eq!(history[0].event, EventId::from("complete"));
    assert_eq!(history[1].event, EventId::from("start_production"));
}

#[tokio::test]
async fn test_update_progress_event_loops_on_production() {
    let (orders, cache, workflow) = setup();
    workflow
        .transition(TransitionRequest::new("O1", "submit_order").operator("u1"))
        .await
        .unwrap();
    workflow.start_production("O1", "u1").await.unwrap();

    let status = workflow
        .transition(
            TransitionRequest::new("O1", "update_progress")
                .operator("worker")
                .metadata("progress", json!(0.4)),
        )
        .await
        .unwrap();
    assert_eq!(status, OrderStatus::Production);
    assert_eq!(durable_status(&orders, "O1").await, 2);
    assert_eq!(
        cache.get(&status_key("order", "O1")).await.unwrap().as_deref(),
        Some("production")
    );

    let history = workflow.get_history("O1", 0).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].event, EventId::from("update_progress"));
    assert_eq!(history[0].from_state, StateId::from("production"));
    assert_eq!(history[0].to_state, StateId::from("production"));

    assert_ok!(
        workflow
            .transition(TransitionRequest::new("O1", "update_progress").operator("worker"))
            .await
    );
    let err = workflow
        .transition(TransitionRequest::new("O404", "update_progress").operator("worker"))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::NotFound(_)));
}

#[tokio::test]
async fn test_complete_reads_progress_from_record() {
    let (orders, _cache, workflow) = setup();
    workflow
        .transition(TransitionRequest::new("O1", "submit_order").operator("u1"))
        .await
        .unwrap();
    workflow.start_production("O1", "u1").await.unwrap();

    let err = workflow.complete_order("O1", "u1").await.unwrap_err();
    assert!(matches!(err, WorkflowError::ConditionFailed(_)));

    let mut fields = Map::new();
    fields.insert("progress".to_string(), json!(1));
    orders.update_entity("O1", fields).await.unwrap();
    assert_eq!(workflow.complete_order("O1", "u1").await.unwrap(), OrderStatus::Completed);
}

#[tokio::test]
async fn test_rollback_restores_previous_status() {
    let (orders, _cache, workflow) = setup();
    workflow
        .transition(TransitionRequest::new("O1", "submit_order").operator("u1"))
        .await
        .unwrap();

    let status = workflow.rollback("O1", "u2", "entered by mistake").await.unwrap();
    assert_eq!(status, OrderStatus::Draft);
    assert_eq!(durable_status(&orders, "O1").await, 0);
    assert_eq!(workflow.get_current_status("O1").await.unwrap(), OrderStatus::Draft);

    let history = workflow.get_history("O1", 2).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].is_rollback());
    assert_eq!(history[0].from_state, StateId::from("ordered"));
    assert_eq!(history[0].to_state, StateId::from("draft"));
    assert_eq!(history[1].event, EventId::from("submit_order"));

    let records = workflow.get_rollback_history("O1", 0).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].instance_id, "O1");
    assert_eq!(records[0].original_event, EventId::from("submit_order"));
    assert_eq!(records[0].reason, "entered by mistake");

    let err = workflow.rollback("O1", "u2", "again").await.unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_rollback_without_history() {
    let (_orders, _cache, workflow) = setup();
    let err = workflow.rollback("O1", "u1", "").await.unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_cancel_requires_admin() {
    let (orders, _cache, workflow) = setup();

    let err = assert_err!(workflow.cancel_order("O1", "u1", "sales", "customer left").await);
    assert!(matches!(err, WorkflowError::Forbidden(_)));
    assert_eq!(durable_status(&orders, "O1").await, 0);

    let status = assert_ok!(workflow.cancel_order("O1", "boss", "admin", "customer left").await);
    assert_eq!(status, OrderStatus::Cancelled);
    assert!(workflow.get_available_transitions("O1").await.unwrap().is_empty());

    let err = workflow.rollback("O1", "boss", "undo").await.unwrap_err();
    assert!(matches!(err, WorkflowError::Forbidden(_)));
    assert!(workflow.get_rollback_history("O1", 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_event_and_missing_order() {
    let (_orders, _cache, workflow) = setup();

    let err = workflow.complete_order("O1", "u1").await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::InvalidTransition { ref state, ref event } if state == "draft" && event == "complete"
    ));

    let err = workflow.get_current_status("O404").await.unwrap_err();
    assert!(matches!(err, WorkflowError::NotFound(_)));
}

#[tokio::test]
async fn test_available_transitions_follow_rule_order() {
    let (_orders, _cache, workflow) = setup();
    workflow
        .transition(TransitionRequest::new("O1", "submit_order").operator("u1"))
        .await
        .unwrap();

    let events: Vec<&str> = workflow
        .get_available_transitions("O1")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.event)
        .collect();
    assert_eq!(events, vec!["start_cutting", "start_production", "cancel"]);
}

#[test]
fn test_rule_table_and_names() {
    let rules = OrderWorkflow::transition_rules();
    assert_eq!(rules.len(), 8);
    assert_eq!(rules[0].event, "submit_order");
    assert_eq!(rules[0].from_name, "草稿");
    assert_eq!(rules[0].to_name, "已下单");

    let complete = rules.iter().find(|r| r.event == "complete").unwrap();
    assert!(complete.has_condition);
    assert!(rules
        .iter()
        .filter(|r| r.event == "cancel")
        .all(|r| r.require_role == Some("admin")));

    assert_eq!(OrderWorkflow::status_name(2), Some("生产中"));
    assert_eq!(OrderWorkflow::status_name(7), None);
}
