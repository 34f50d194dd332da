// Engine configuration
// Defaults, then an optional config file, then FLOWGATE__* environment variables

//! # Configuration
//!
//! [`EngineConfig`] is loaded in layers with the `config` crate:
//!
//! 1. built-in defaults (every field is `#[serde(default)]`)
//! 2. an optional file, `flowgate.toml` / `.yaml` / `.json` by default
//! 3. environment variables prefixed `FLOWGATE__`, nested with `__`
//!    (`FLOWGATE__NATS__URL`, `FLOWGATE__STORE_TIMEOUT_MS`)
//!
//! `.env` files are applied first through `dotenv`, so they feed layer 3.

use std::collections::HashMap;
use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::Deserialize;
use tracing::debug;

use crate::engine::nats_storage::NatsStorageConfig;
use crate::models::OrderStatus;
use crate::Result;

/// Base name of the optional configuration file
pub const DEFAULT_CONFIG_FILE: &str = "flowgate";

/// Runtime settings shared by both engines and the storage backends
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Entity type bound to new instances
    pub entity_type: String,

    /// Capacity of the cache-resident history list per order
    pub history_cap: usize,

    /// Capacity of the cache-resident rollback list per order
    pub rollback_cap: usize,

    /// Capacity of the history embedded in a stored instance; 0 keeps everything
    pub instance_history_cap: usize,

    /// History length returned when a caller asks for 0 entries
    pub default_history_limit: usize,

    /// TTL of cached current status
    pub status_ttl_secs: u64,

    /// TTL of cached history and rollback lists
    pub log_ttl_secs: u64,

    pub store_timeout_ms: u64,
    pub cache_timeout_ms: u64,
    pub webhook_timeout_ms: u64,

    /// Integer status projected onto the entity record, by state id
    pub status_projection: HashMap<String, i64>,

    pub nats: NatsStorageConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            entity_type: "order".to_string(),
            history_cap: 100,
            rollback_cap: 50,
            instance_history_cap: 500,
            default_history_limit: 10,
            status_ttl_secs: 24 * 60 * 60,
            log_ttl_secs: 90 * 24 * 60 * 60,
            store_timeout_ms: 3000,
            cache_timeout_ms: 500,
            webhook_timeout_ms: 5000,
            status_projection: OrderStatus::ALL
                .iter()
                .map(|s| (s.state_id().to_string(), s.code()))
                .collect(),
            nats: NatsStorageConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `path` (extension optional) and the environment
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load(path: Option<&str>) -> Result<Self> {
        if let Err(e) = dotenv::dotenv() {
            debug!("No .env file loaded: {}", e);
        }

        let settings = Config::builder()
            .add_source(File::with_name(path.unwrap_or(DEFAULT_CONFIG_FILE)).required(false))
            .add_source(
                Environment::with_prefix("FLOWGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        debug!(?config, "Engine configuration loaded");
        Ok(config)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn log_ttl(&self) -> Duration {
        Duration::from_secs(self.log_ttl_secs)
    }

    /// Projected integer status for a state, if mapped
    pub fn status_for(&self, state: &str) -> Option<i64> {
        self.status_projection.get(state).copied()
    }

    /// Requested history length, with 0 meaning "the default"
    pub fn history_limit(&self, requested: usize) -> usize {
        if requested == 0 {
            self.default_history_limit
        } else {
            requested
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.entity_type, "order");
        assert_eq!(config.history_cap, 100);
        assert_eq!(config.rollback_cap, 50);
        assert_eq!(config.instance_history_cap, 500);
        assert_eq!(config.status_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.log_ttl(), Duration::from_secs(7_776_000));
        assert_eq!(config.status_for("production"), Some(2));
        assert_eq!(config.status_for("cancelled"), Some(4));
        assert_eq!(config.status_for("unknown"), None);
        assert_eq!(config.history_limit(0), 10);
        assert_eq!(config.history_limit(3), 3);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = EngineConfig::load(Some("/nonexistent/flowgate-test")).unwrap();
        assert!(config.cache_timeout_ms > 0);
        assert!(!config.nats.url.is_empty());
    }
}
