use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{Cache, CacheError};

/// Minimum pause between two expiry sweeps triggered by `set`.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct Store {
    entries: HashMap<String, Entry>,
    last_sweep: Instant,
}

impl Store {
    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.last_sweep = now;
        before - self.entries.len()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }
}

/// Process-local cache. Clones share the same entries.
///
/// Expired entries are dropped when read, and `set` sweeps the whole map at
/// most once per second, so keys that are never read again do not pile up.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    store: Arc<RwLock<Store>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        self.store.write().await.sweep(Instant::now())
    }

    /// Live and not-yet-purged entries.
    pub async fn len(&self) -> usize {
        self.store.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.read().await.entries.is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut store = self.store.write().await;
        if now.duration_since(store.last_sweep) >= SWEEP_INTERVAL {
            let removed = store.sweep(now);
            if removed > 0 {
                tracing::debug!(removed, "Swept expired cache entries");
            }
        }
        store.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        {
            let store = self.store.read().await;
            match store.entries.get(key) {
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // expired, evict lazily
        let mut store = self.store.write().await;
        if store.entries.get(key).is_some_and(|entry| entry.expires_at <= now) {
            store.entries.remove(key);
        }
        Ok(None)
    }
}
