// NATS JetStream key/value backends for definitions, instances, entities and the cache

//! # NATS Storage Implementation
//!
//! Durable stores and the fast-read cache on NATS JetStream KV buckets.
//!
//! ## Buckets
//!
//! With the default prefix `flowgate`:
//! - `flowgate_definitions`: definition JSON by definition id
//! - `flowgate_instances`: instance document (instance + its rollback records) by instance id
//! - `flowgate_instance_index`: `{entity_type}.{entity_id}` to instance id
//!
//! Caller-supplied ids are escaped into keys: characters outside
//! `[A-Za-z0-9_/-]` become `=XX` per UTF-8 byte, so distinct ids never share
//! a key.
//! - `flowgate_entities`: entity records by entity id
//! - `flowgate_cache`: cache values wrapped with their own expiry
//!
//! ## Compare-and-swap
//!
//! Instance commits and entity compare-and-update use the KV revision: read the
//! entry, check the guard, then `update(key, value, revision)`. When the update
//! loses to another writer the entry is re-read and the guard re-checked, so a
//! conflict is reported only if the guarded value really moved.
//!
//! Uniqueness of instances per entity comes from `create` on the index key,
//! which fails when the key already exists. If the instance document then
//! cannot be written, the index key is deleted again so the entity can be
//! initialized later.
//!
//! `activate_exclusive` spans several keys and is not atomic here. It
//! deactivates siblings before activating the target, so readers may briefly
//! see no active definition but never two.

use std::future::Future;
use std::time::Duration;

use async_nats::jetstream::{self, kv};
use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cache::StateCache;
use super::storage::{DefinitionStore, EntityRepository, InstanceCommit, InstanceStore};
use crate::models::{RollbackRecord, Variables, WorkflowDefinition, WorkflowInstance};
use crate::{Result, WorkflowError};

/// Attempts at a revision-guarded write before giving up
const MAX_CAS_ATTEMPTS: usize = 5;

/// Connection and bucket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsStorageConfig {
    /// Comma-separated NATS server URLs
    pub url: String,
    pub bucket_prefix: String,
    pub connection_timeout_ms: u64,
    pub replicas: usize,
}

impl Default for NatsStorageConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            bucket_prefix: "flowgate".to_string(),
            connection_timeout_ms: 5000,
            replicas: 1,
        }
    }
}

impl NatsStorageConfig {
    fn bucket(&self, name: &str) -> String {
        format!("{}_{}", self.bucket_prefix, name)
    }
}

/// Instance plus its rollback log, stored as one KV value so commits are atomic
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstanceDocument {
    instance: WorkflowInstance,
    #[serde(default)]
    rollbacks: Vec<RollbackRecord>,
}

fn storage_error(context: &str, e: impl std::fmt::Display) -> WorkflowError {
    WorkflowError::Persistence(anyhow::anyhow!("{}: {}", context, e))
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Escape a raw id into a KV key token
///
/// Injective: `=` only ever starts an escape, and the empty id maps to `=`.
fn kv_key(raw: &str) -> String {
    if raw.is_empty() {
        return "=".to_string();
    }
    let mut key = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/') {
            key.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                key.push_str(&format!("={:02X}", byte));
            }
        }
    }
    key
}

fn entity_index_key(entity_type: &str, entity_id: &str) -> String {
    format!("{}.{}", kv_key(entity_type), kv_key(entity_id))
}

/// Run `write` once `claim` succeeds, and undo the claim if the write fails
async fn write_claimed<T>(
    claim: impl Future<Output = Result<()>>,
    write: impl Future<Output = Result<T>>,
    release: impl Future<Output = Result<()>>,
) -> Result<T> {
    claim.await?;
    match write.await {
        Ok(value) => Ok(value),
        Err(e) => {
            if let Err(release_err) = release.await {
                warn!(error = %release_err, "Failed to release claim after failed write");
            }
            Err(e)
        }
    }
}

async fn connect(config: &NatsStorageConfig) -> Result<jetstream::Context> {
    let client = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_millis(config.connection_timeout_ms))
        .connect(config.url.as_str())
        .await
        .map_err(|e| storage_error("Failed to connect to NATS", e))?;
    info!(url = %config.url, "Connected to NATS");
    Ok(jetstream::new(client))
}

/// Open a KV bucket, creating it if needed
async fn ensure_kv_bucket(
    js: &jetstream::Context,
    bucket: &str,
    history: i64,
    max_age: Duration,
    replicas: usize,
) -> Result<kv::Store> {
    match js.get_key_value(bucket).await {
        Ok(store) => {
            debug!("Using existing KV bucket: {}", bucket);
            Ok(store)
        }
        Err(_) => {
            info!("Creating KV bucket: {}", bucket);
            js.create_key_value(kv::Config {
                bucket: bucket.to_string(),
                history,
                max_age,
                storage: jetstream::stream::StorageType::File,
                num_replicas: replicas,
                description: format!("Flowgate storage - {}", bucket),
                ..Default::default()
            })
            .await
            .map_err(|e| storage_error(&format!("Failed to create KV bucket {}", bucket), e))
        }
    }
}

/// Durable stores on NATS JetStream KV
pub struct NatsStorage {
    jetstream: jetstream::Context,
    config: NatsStorageConfig,
    definitions: kv::Store,
    instances: kv::Store,
    index: kv::Store,
    entities: kv::Store,
}

impl NatsStorage {
    pub async fn connect(config: NatsStorageConfig) -> Result<Self> {
        let js = connect(&config).await?;
        let keep = Duration::ZERO;
        let definitions = ensure_kv_bucket(&js, &config.bucket("definitions"), 5, keep, config.replicas).await?;
        let instances = ensure_kv_bucket(&js, &config.bucket("instances"), 5, keep, config.replicas).await?;
        let index = ensure_kv_bucket(&js, &config.bucket("instance_index"), 1, keep, config.replicas).await?;
        let entities = ensure_kv_bucket(&js, &config.bucket("entities"), 5, keep, config.replicas).await?;

        Ok(Self {
            jetstream: js,
            config,
            definitions,
            instances,
            index,
            entities,
        })
    }

    /// Open the cache bucket on the same connection
    ///
    /// `max_age` bounds every entry; per-key TTLs below it are enforced on read.
    pub async fn open_cache(&self, max_age: Duration) -> Result<NatsStateCache> {
        let store = ensure_kv_bucket(
            &self.jetstream,
            &self.config.bucket("cache"),
            1,
            max_age,
            self.config.replicas,
        )
        .await?;
        Ok(NatsStateCache { store })
    }

    /// Seed or replace an entity record
    pub async fn insert_entity(&self, id: &str, fields: Map<String, Value>) -> Result<()> {
        self.entities
            .put(kv_key(id), encode(&fields)?)
            .await
            .map_err(|e| storage_error("Failed to store entity", e))?;
        Ok(())
    }

    async fn read_definition(&self, key: &str) -> Result<Option<WorkflowDefinition>> {
        match self
            .definitions
            .get(key)
            .await
            .map_err(|e| storage_error("Failed to read definition", e))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn read_document(&self, id: &Uuid) -> Result<Option<(InstanceDocument, u64)>> {
        let entry = self
            .instances
            .entry(id.to_string())
            .await
            .map_err(|e| storage_error("Failed to read instance", e))?;
        match entry {
            Some(entry) if matches!(entry.operation, kv::Operation::Put) => {
                Ok(Some((decode(&entry.value)?, entry.revision)))
            }
            _ => Ok(None),
        }
    }

    /// Read-modify-write an instance document under its KV revision
    async fn modify_document<F>(&self, id: &Uuid, mut change: F) -> Result<InstanceDocument>
    where
        F: FnMut(&mut InstanceDocument) -> Result<()> + Send,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (mut document, revision) = self
                .read_document(id)
                .await?
                .ok_or_else(|| WorkflowError::NotFound(format!("instance {}", id)))?;
            change(&mut document)?;

            match self
                .instances
                .update(id.to_string(), encode(&document)?, revision)
                .await
            {
                Ok(_) => return Ok(document),
                Err(e) => debug!(instance_id = %id, attempt, error = %e, "Instance revision moved; retrying"),
            }
        }
        Err(storage_error(
            "Failed to update instance",
            format!("{} concurrent writers won", MAX_CAS_ATTEMPTS),
        ))
    }

    async fn read_entity(&self, id: &str) -> Result<Option<(Map<String, Value>, u64)>> {
        let entry = self
            .entities
            .entry(kv_key(id))
            .await
            .map_err(|e| storage_error("Failed to read entity", e))?;
        match entry {
            Some(entry) if matches!(entry.operation, kv::Operation::Put) => Ok(Some((decode(&entry.value)?, entry.revision))),
            _ => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl DefinitionStore for NatsStorage {
    async fn save_definition(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition> {
        self.definitions
            .put(kv_key(&definition.id), encode(&definition)?)
            .await
            .map_err(|e| storage_error("Failed to store definition", e))?;
        Ok(definition)
    }

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        self.read_definition(&kv_key(id)).await
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        let keys: Vec<String> = self
            .definitions
            .keys()
            .await
            .map_err(|e| storage_error("Failed to list definitions", e))?
            .try_collect()
            .await
            .map_err(|e| storage_error("Failed to list definitions", e))?;

        let mut definitions = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(definition) = self.read_definition(&key).await? {
                definitions.push(definition);
            }
        }
        Ok(definitions)
    }

    async fn delete_definition(&self, id: &str) -> Result<bool> {
        let key = kv_key(id);
        if self.read_definition(&key).await?.is_none() {
            return Ok(false);
        }
        self.definitions
            .delete(&key)
            .await
            .map_err(|e| storage_error("Failed to delete definition", e))?;
        Ok(true)
    }

    async fn activate_exclusive(&self, id: &str) -> Result<WorkflowDefinition> {
        let mut target = self
            .get_definition(id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("definition {}", id)))?;

        let now = Utc::now();
        for mut sibling in self.list_definitions().await? {
            if sibling.code == target.code && sibling.id != target.id && sibling.is_active {
                sibling.is_active = false;
                sibling.updated_at = now;
                self.save_definition(sibling).await?;
            }
        }

        target.is_active = true;
        target.updated_at = now;
        self.save_definition(target).await
    }
}

#[async_trait::async_trait]
impl InstanceStore for NatsStorage {
    async fn create_instance(&self, instance: WorkflowInstance) -> Result<WorkflowInstance> {
        let index_key = entity_index_key(&instance.entity_type, &instance.entity_id);

        let claim = async {
            match self.index.create(&index_key, Bytes::from(instance.id.to_string())).await {
                Ok(_) => Ok::<(), WorkflowError>(()),
                Err(e) => {
                    let existing = self
                        .index
                        .get(&index_key)
                        .await
                        .map_err(|e| storage_error("Failed to read instance index", e))?;
                    if existing.is_some() {
                        return Err(WorkflowError::AlreadyInitialized {
                            entity_type: instance.entity_type.clone(),
                            entity_id: instance.entity_id.clone(),
                        });
                    }
                    Err(storage_error("Failed to index instance", e))
                }
            }
        };
        let write = async {
            let document = InstanceDocument {
                instance: instance.clone(),
                rollbacks: Vec::new(),
            };
            self.instances
                .put(instance.id.to_string(), encode(&document)?)
                .await
                .map_err(|e| storage_error("Failed to store instance", e))?;
            Ok::<(), WorkflowError>(())
        };
        let release = async {
            debug!(key = %index_key, "Releasing instance index");
            self.index
                .delete(&index_key)
                .await
                .map_err(|e| storage_error("Failed to release instance index", e))
        };

        write_claimed(claim, write, release).await?;
        Ok(instance)
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>> {
        Ok(self.read_document(id).await?.map(|(document, _)| document.instance))
    }

    async fn find_by_entity(&self, entity_type: &str, entity_id: &str) -> Result<Option<WorkflowInstance>> {
        let index_key = entity_index_key(entity_type, entity_id);
        let Some(raw) = self
            .index
            .get(&index_key)
            .await
            .map_err(|e| storage_error("Failed to read instance index", e))?
        else {
            return Ok(None);
        };
        let id = std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| storage_error("Corrupt instance index", &index_key))?;
        self.get_instance(&id).await
    }

    async fn commit_transition(&self, id: &Uuid, commit: InstanceCommit) -> Result<WorkflowInstance> {
        let document = self
            .modify_document(id, |document| {
                let current = &document.instance.current_state;
                if current != &commit.expected_state {
                    return Err(WorkflowError::StateConflict {
                        instance_id: id.to_string(),
                        expected: commit.expected_state.to_string(),
                        actual: current.to_string(),
                    });
                }
                if let Some(record) = commit.clone().apply_to(&mut document.instance) {
                    document.rollbacks.push(record);
                }
                Ok(())
            })
            .await?;
        Ok(document.instance)
    }

    async fn update_variables(&self, id: &Uuid, variables: Variables) -> Result<()> {
        self.modify_document(id, |document| {
            document.instance.variables.extend(variables.clone());
            document.instance.updated_at = Utc::now();
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn list_rollbacks(&self, id: &Uuid) -> Result<Vec<RollbackRecord>> {
        Ok(self
            .read_document(id)
            .await?
            .map(|(document, _)| document.rollbacks)
            .unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl EntityRepository for NatsStorage {
    async fn get_entity(&self, id: &str) -> Result<Option<Map<String, Value>>> {
        Ok(self.read_entity(id).await?.map(|(fields, _)| fields))
    }

    async fn update_entity(&self, id: &str, fields: Map<String, Value>) -> Result<()> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (mut entity, revision) = self
                .read_entity(id)
                .await?
                .ok_or_else(|| WorkflowError::NotFound(format!("entity {}", id)))?;
            entity.extend(fields.clone());
            match self.entities.update(kv_key(id), encode(&entity)?, revision).await {
                Ok(_) => return Ok(()),
                Err(e) => debug!(entity_id = %id, attempt, error = %e, "Entity revision moved; retrying"),
            }
        }
        Err(storage_error("Failed to update entity", "too many concurrent writers"))
    }

    async fn compare_and_update(
        &self,
        id: &str,
        field: &str,
        expected: &Value,
        fields: Map<String, Value>,
    ) -> Result<bool> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (mut entity, revision) = self
                .read_entity(id)
                .await?
                .ok_or_else(|| WorkflowError::NotFound(format!("entity {}", id)))?;
            if entity.get(field) != Some(expected) {
                return Ok(false);
            }
            entity.extend(fields.clone());
            match self.entities.update(kv_key(id), encode(&entity)?, revision).await {
                Ok(_) => return Ok(true),
                Err(e) => debug!(entity_id = %id, attempt, error = %e, "Entity revision moved; re-checking guard"),
            }
        }
        Err(storage_error("Failed to update entity", "too many concurrent writers"))
    }
}

/// Cache value with its own expiry (unix seconds)
#[derive(Debug, Serialize, Deserialize)]
struct CacheEnvelope<T> {
    value: T,
    expires_at: i64,
}

impl<T> CacheEnvelope<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Utc::now().timestamp() + ttl.as_secs() as i64,
        }
    }

    fn is_live(&self) -> bool {
        Utc::now().timestamp() < self.expires_at
    }
}

/// [`StateCache`] on a JetStream KV bucket
pub struct NatsStateCache {
    store: kv::Store,
}

impl NatsStateCache {
    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(CacheEnvelope<T>, u64)>> {
        let entry = self
            .store
            .entry(kv_key(key))
            .await
            .map_err(|e| storage_error("Cache read failed", e))?;
        match entry {
            Some(entry) if matches!(entry.operation, kv::Operation::Put) => {
                Ok(Some((decode(&entry.value)?, entry.revision)))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl StateCache for NatsStateCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .read::<String>(key)
            .await?
            .filter(|(envelope, _)| envelope.is_live())
            .map(|(envelope, _)| envelope.value))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.store
            .put(kv_key(key), encode(&CacheEnvelope::new(value, ttl))?)
            .await
            .map_err(|e| storage_error("Cache write failed", e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store
            .delete(kv_key(key))
            .await
            .map_err(|e| storage_error("Cache delete failed", e))
    }

    async fn push_capped(&self, key: &str, value: String, cap: usize, ttl: Duration) -> Result<()> {
        let key = kv_key(key);
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.read::<Vec<String>>(&key).await?;
            let (mut items, revision) = match current {
                Some((envelope, revision)) if envelope.is_live() => (envelope.value, Some(revision)),
                Some((_, revision)) => (Vec::new(), Some(revision)),
                None => (Vec::new(), None),
            };
            items.insert(0, value.clone());
            items.truncate(cap);
            let bytes = encode(&CacheEnvelope::new(items, ttl))?;

            let written = match revision {
                Some(revision) => self.store.update(&key, bytes, revision).await.map(|_| ()).map_err(|e| e.to_string()),
                None => self.store.create(&key, bytes).await.map(|_| ()).map_err(|e| e.to_string()),
            };
            match written {
                Ok(()) => return Ok(()),
                Err(e) => debug!(key = %key, attempt, error = %e, "Cache list moved; retrying"),
            }
        }
        Err(storage_error("Cache append failed", "too many concurrent writers"))
    }

    async fn range(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .read::<Vec<String>>(key)
            .await?
            .filter(|(envelope, _)| envelope.is_live())
            .map(|(envelope, _)| envelope.value.into_iter().take(limit).collect())
            .unwrap_or_default())
    }
}
