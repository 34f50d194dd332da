// Fast-read cache for the order fast path

//! # State Cache
//!
//! [`StateCache`] is a small key/value surface with TTLs and capped lists. The
//! order fast path keeps three kinds of keys in it:
//!
//! - `order.status.{id}`: current state id, 24h TTL
//! - `order.history.{id}`: history entries as JSON, newest first, capped
//! - `order.rollback.{id}`: rollback records as JSON, newest first, capped
//!
//! The cache is never authoritative. Callers recover from read errors by going
//! to durable storage and swallow write errors after logging them.
//!
//! [`InMemoryStateCache`] backs tests and single-process runs; the NATS KV
//! implementation lives in `nats_storage`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::Result;

/// Key/value cache with per-key TTL and capped newest-first lists
#[async_trait::async_trait]
pub trait StateCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Prepend `value`, trim the list to `cap` and refresh its TTL
    async fn push_capped(&self, key: &str, value: String, cap: usize, ttl: Duration) -> Result<()>;

    /// Up to `limit` list items, newest first
    async fn range(&self, key: &str, limit: usize) -> Result<Vec<String>>;
}

/// Cache key of an entity's current status
pub fn status_key(entity_type: &str, id: &str) -> String {
    format!("{}.status.{}", entity_type, id)
}

pub fn history_key(entity_type: &str, id: &str) -> String {
    format!("{}.history.{}", entity_type, id)
}

pub fn rollback_key(entity_type: &str, id: &str) -> String {
    format!("{}.rollback.{}", entity_type, id)
}

#[derive(Debug, Clone)]
enum CachedValue {
    Text(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedValue,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Process-local cache with lazy expiry
#[derive(Default)]
pub struct InMemoryStateCache {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every key, as a cache flush or restart would
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.get(key).map(|e| e.clone())?;
        if entry.is_expired() {
            self.entries.remove(key);
            return None;
        }
        Some(entry)
    }
}

#[async_trait::async_trait]
impl StateCache for InMemoryStateCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(match self.live(key).map(|e| e.value) {
            Some(CachedValue::Text(text)) => Some(text),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: CachedValue::Text(value),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn push_capped(&self, key: &str, value: String, cap: usize, ttl: Duration) -> Result<()> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry {
                value: CachedValue::List(VecDeque::new()),
                expires_at: Instant::now() + ttl,
            });

        if entry.is_expired() || !matches!(entry.value, CachedValue::List(_)) {
            entry.value = CachedValue::List(VecDeque::new());
        }
        if let CachedValue::List(items) = &mut entry.value {
            items.push_front(value);
            items.truncate(cap);
        }
        entry.expires_at = Instant::now() + ttl;
        Ok(())
    }

    async fn range(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        Ok(match self.live(key).map(|e| e.value) {
            Some(CachedValue::List(items)) => items.into_iter().take(limit).collect(),
            _ => Vec::new(),
        })
    }
}
