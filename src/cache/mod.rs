//! Shared expiring key/value store.
//!
//! Backs message deduplication and memoized collaborator lookups. Every
//! entry carries its own TTL; an expired entry is indistinguishable from
//! one that was never set.

pub mod memory;
pub mod nats_kv;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use memory::MemoryCache;
pub use nats_kv::NatsKvCache;

#[derive(Debug, Clone, PartialEq)]
pub enum CacheError {
    /// Backing store unreachable.
    Unavailable(String),
    /// Stored entry could not be encoded or decoded.
    Codec(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Unavailable(msg) => write!(f, "Cache unavailable: {}", msg),
            CacheError::Codec(msg) => write!(f, "Cache entry codec error: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {}

#[async_trait]
pub trait Cache: Send + Sync {
    /// Store `value` under `key`, replacing any previous entry, for `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Value of a live entry.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Key prefix isolating one user of a shared cache from another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNamespace {
    prefix: String,
}

impl CacheNamespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self, key: &str) -> String {
        format!("{}.{}", self.prefix, key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Nats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub url: String,
    pub bucket: String,
    /// Upper bound on any entry's lifetime in the NATS bucket.
    pub max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            url: std::env::var("NATS_URL")
                .unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            bucket: "INTELFLOW_CACHE".to_string(),
            max_age_secs: 7 * 24 * 60 * 60,
        }
    }
}

/// Open the configured cache backend.
///
/// Bots running in one process share `local` when the backend is in-memory.
pub async fn connect(
    config: &CacheConfig,
    local: Option<&MemoryCache>,
) -> Result<Arc<dyn Cache>, CacheError> {
    match config.backend {
        CacheBackend::Memory => Ok(Arc::new(local.cloned().unwrap_or_default())),
        CacheBackend::Nats => Ok(Arc::new(NatsKvCache::connect(config).await?)),
    }
}
