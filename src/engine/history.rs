// Cache-resident audit logs for the order fast path

//! # History Logs
//!
//! The definition-driven runtime keeps history embedded in the instance
//! document. The order fast path has no instance document, so its history and
//! rollback records live in the [`StateCache`] as capped newest-first lists
//! with their own TTL.
//!
//! Writes are best-effort: a failed or timed-out append is logged and dropped.
//! A cache flush therefore empties recent history until new transitions
//! repopulate it.

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use super::bounded;
use super::cache::{history_key, rollback_key, StateCache};
use crate::models::{HistoryEntry, RollbackRecord};
use crate::Result;

/// Capped history and rollback lists for one entity type
#[derive(Clone)]
pub struct HistoryLog {
    cache: Arc<dyn StateCache>,
    entity_type: String,
    history_cap: usize,
    rollback_cap: usize,
    ttl: Duration,
    timeout: Duration,
}

impl HistoryLog {
    pub fn new(
        cache: Arc<dyn StateCache>,
        entity_type: &str,
        history_cap: usize,
        rollback_cap: usize,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            entity_type: entity_type.to_string(),
            history_cap,
            rollback_cap,
            ttl,
            timeout,
        }
    }

    /// Append a history entry; failures are logged, not returned
    pub async fn record_history(&self, entity_id: &str, entry: &HistoryEntry) {
        let key = history_key(&self.entity_type, entity_id);
        if let Err(e) = self.push(&key, entry, self.history_cap).await {
            warn!(entity_id = %entity_id, error = %e, "Failed to append history entry");
        }
    }

    pub async fn record_rollback(&self, entity_id: &str, record: &RollbackRecord) {
        let key = rollback_key(&self.entity_type, entity_id);
        if let Err(e) = self.push(&key, record, self.rollback_cap).await {
            warn!(entity_id = %entity_id, error = %e, "Failed to append rollback record");
        }
    }

    /// Most recent history entries, newest first
    pub async fn history(&self, entity_id: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.read(&history_key(&self.entity_type, entity_id), limit).await
    }

    pub async fn rollbacks(&self, entity_id: &str, limit: usize) -> Result<Vec<RollbackRecord>> {
        self.read(&rollback_key(&self.entity_type, entity_id), limit).await
    }

    async fn push<T: Serialize>(&self, key: &str, item: &T, cap: usize) -> Result<()> {
        let json = serde_json::to_string(item)?;
        bounded(
            self.timeout,
            "cache append",
            self.cache.push_capped(key, json, cap, self.ttl),
        )
        .await
    }

    async fn read<T: DeserializeOwned>(&self, key: &str, limit: usize) -> Result<Vec<T>> {
        let raw = bounded(self.timeout, "cache range", self.cache.range(key, limit)).await?;
        Ok(raw
            .iter()
            .filter_map(|item| match serde_json::from_str(item) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping undecodable log item");
                    None
                }
            })
            .collect())
    }
}
