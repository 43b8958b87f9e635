//! Content-hash deduplication backed by the shared cache.
//!
//! A message's fingerprint is a SHA-256 over its kind and every field not in
//! the ignore list, visited in name order. Fingerprints of successfully
//! processed messages are kept in the cache for `ttl_secs`; a message whose
//! fingerprint is still live is acknowledged without processing.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{Cache, CacheError, CacheNamespace};
use crate::message::Message;

/// Which bots share a fingerprint namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupScope {
    /// Only this bot id sees its fingerprints.
    #[default]
    Local,
    /// One namespace across the whole pipeline.
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub scope: DedupScope,
    /// Volatile fields left out of the fingerprint.
    pub ignore_fields: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: 24 * 60 * 60,
            scope: DedupScope::Local,
            ignore_fields: vec!["time.observation".to_string()],
        }
    }
}

/// Hex SHA-256 of `message` without the `ignore` fields.
pub fn fingerprint(message: &Message, ignore: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message.kind().as_str().as_bytes());
    hasher.update([0u8]);
    for (field, value) in message.fields() {
        if ignore.iter().any(|ignored| ignored == field) {
            continue;
        }
        hasher.update(field.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.to_json().to_string().as_bytes());
        hasher.update([0x1eu8]);
    }
    format!("{:x}", hasher.finalize())
}

pub struct Deduplicator {
    cache: Arc<dyn Cache>,
    namespace: CacheNamespace,
    ttl: Duration,
    ignore_fields: Vec<String>,
}

impl Deduplicator {
    pub fn new(bot_id: &str, config: &DedupConfig, cache: Arc<dyn Cache>) -> Self {
        let namespace = match config.scope {
            DedupScope::Local => CacheNamespace::new(format!("dedup.{}", bot_id)),
            DedupScope::Global => CacheNamespace::new("dedup.global"),
        };
        Self {
            cache,
            namespace,
            ttl: Duration::from_secs(config.ttl_secs),
            ignore_fields: config.ignore_fields.clone(),
        }
    }

    pub fn key(&self, message: &Message) -> String {
        self.namespace.key(&fingerprint(message, &self.ignore_fields))
    }

    pub async fn is_duplicate(&self, message: &Message) -> Result<bool, CacheError> {
        self.cache.exists(&self.key(message)).await
    }

    /// Remember `message` as processed for the configured TTL.
    pub async fn record(&self, message: &Message) -> Result<(), CacheError> {
        self.cache.set(&self.key(message), "1", self.ttl).await
    }
}
