//! Engine configuration
//!
//! Configuration can be built in code, read from a JSON file, or taken from
//! `IPERMIT_*` environment variables.

use crate::error::{AuthzError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Where entities, resources and policies are persisted
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DataProvider {
    /// Process-local in-memory store
    #[default]
    Memory,

    /// PostgreSQL (requires the `postgres` feature)
    Postgres {
        /// PostgreSQL connection string
        #[serde(rename = "connectionString")]
        connection_string: String,
    },
}

/// Memoization of ancestor closures and compiled checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Enable memoization
    pub enabled: bool,

    /// Maximum number of entries before eviction (0 = unbounded)
    pub max_length: usize,

    /// Number of least recently used entries dropped once `max_length` is exceeded
    pub evict_batch: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_length: 10_000,
            evict_batch: 1,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PermitConfig {
    /// Persistence backend
    pub data_provider: DataProvider,

    /// Prefix for table names in the persistence backend
    pub table_prefix: String,

    /// Memo cache settings
    pub cache: CacheConfig,
}

impl PermitConfig {
    /// Load configuration from `IPERMIT_*` environment variables
    ///
    /// - `IPERMIT_DATA_PROVIDER` - `memory` (default) or `postgres`
    /// - `IPERMIT_DATABASE_URL` - connection string, required for `postgres`
    /// - `IPERMIT_TABLE_PREFIX` - table name prefix (default: empty)
    /// - `IPERMIT_CACHE_ENABLED` - `true`/`false` (default: false)
    /// - `IPERMIT_CACHE_MAX_LENGTH` - cache capacity (default: 10000)
    /// - `IPERMIT_CACHE_EVICT_BATCH` - entries evicted at once (default: 1)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        match lookup("IPERMIT_DATA_PROVIDER").as_deref() {
            None | Some("memory") => {}
            Some("postgres") => {
                let connection_string = lookup("IPERMIT_DATABASE_URL").ok_or_else(|| {
                    AuthzError::Config("IPERMIT_DATABASE_URL is required for the postgres provider".to_string())
                })?;
                config.data_provider = DataProvider::Postgres { connection_string };
            }
            Some(other) => {
                return Err(AuthzError::Config(format!("Unknown data provider: {}", other)));
            }
        }

        if let Some(prefix) = lookup("IPERMIT_TABLE_PREFIX") {
            config.table_prefix = prefix;
        }

        if let Some(enabled) = lookup("IPERMIT_CACHE_ENABLED") {
            config.cache.enabled = parse_flag("IPERMIT_CACHE_ENABLED", &enabled)?;
        }

        if let Some(max_length) = lookup("IPERMIT_CACHE_MAX_LENGTH") {
            config.cache.max_length = parse_number("IPERMIT_CACHE_MAX_LENGTH", &max_length)?;
        }

        if let Some(evict_batch) = lookup("IPERMIT_CACHE_EVICT_BATCH") {
            config.cache.evict_batch = parse_number("IPERMIT_CACHE_EVICT_BATCH", &evict_batch)?;
        }

        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(AuthzError::Config(format!("{} must be a boolean, got '{}'", key, other))),
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|e| AuthzError::Config(format!("{} must be a number: {}", key, e)))
}
