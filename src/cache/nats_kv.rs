//! Cache on a NATS JetStream key/value bucket.
//!
//! Entries are stored as `{"value": ..., "expires_at": <unix millis>}` so each
//! key keeps its own TTL; the bucket-wide `max_age` only bounds the longest
//! one. Keys are base64url-encoded since bucket keys allow a narrow alphabet.

use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{Cache, CacheConfig, CacheError};

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    value: String,
    expires_at: i64,
}

pub struct NatsKvCache {
    store: kv::Store,
}

fn encode_key(key: &str) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

impl NatsKvCache {
    /// Connect and open (or create) the configured bucket.
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        let js = jetstream::new(client);

        let store = match js.get_key_value(&config.bucket).await {
            Ok(store) => {
                debug!("Using existing KV bucket: {}", config.bucket);
                store
            }
            Err(_) => {
                info!("Creating KV bucket: {}", config.bucket);
                js.create_key_value(kv::Config {
                    bucket: config.bucket.clone(),
                    history: 1,
                    max_age: Duration::from_secs(config.max_age_secs),
                    ..Default::default()
                })
                .await
                .map_err(|e| CacheError::Unavailable(e.to_string()))?
            }
        };

        Ok(Self { store })
    }
}

#[async_trait]
impl Cache for NatsKvCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| CacheError::Codec(e.to_string()))?;
        let entry = StoredEntry {
            value: value.to_string(),
            expires_at: (chrono::Utc::now() + ttl).timestamp_millis(),
        };
        let bytes = serde_json::to_vec(&entry).map_err(|e| CacheError::Codec(e.to_string()))?;

        self.store
            .put(encode_key(key), bytes.into())
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let encoded = encode_key(key);
        let bytes = match self.store.get(&encoded).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(e) => return Err(CacheError::Unavailable(e.to_string())),
        };
        let entry: StoredEntry =
            serde_json::from_slice(&bytes).map_err(|e| CacheError::Codec(e.to_string()))?;

        if entry.expires_at <= chrono::Utc::now().timestamp_millis() {
            if let Err(e) = self.store.delete(&encoded).await {
                debug!("Failed to evict expired key {}: {}", key, e);
            }
            return Ok(None);
        }
        Ok(Some(entry.value))
    }
}
