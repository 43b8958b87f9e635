//! Enrichment expert resolving one field into another through a [`Lookup`].
//!
//! Answers, including "no answer", are memoized in the shared cache under
//! `lookup.{bot_id}.{key}` for `ttl_secs`, so repeated indicators do not hit
//! the lookup source again.
//!
//! ```yaml
//! module: lookup
//! parameters:
//!   mappings:
//!     - {from: source.ip, to: source.abuse_contact}
//!     - {from: destination.ip, to: destination.abuse_contact}
//!   table:
//!     93.184.216.34: abuse@edgecast.com
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::bot::{BotContext, BotError, Processor};
use crate::cache::CacheNamespace;

/// Cached marker for a key the lookup had no answer for.
const NO_ANSWER: &str = "";

/// A source of answers for the lookup expert.
#[async_trait]
pub trait Lookup: Send + Sync {
    /// Answer for `key`, `None` when the source knows nothing about it.
    ///
    /// Errors that may clear up should be [`BotError::transient`].
    async fn lookup(&self, key: &str) -> Result<Option<String>, BotError>;
}

/// Lookup answered from a fixed table.
#[derive(Debug, Clone, Default)]
pub struct TableLookup {
    table: HashMap<String, String>,
}

impl TableLookup {
    pub fn new(table: HashMap<String, String>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl Lookup for TableLookup {
    async fn lookup(&self, key: &str) -> Result<Option<String>, BotError> {
        Ok(self.table.get(key).cloned())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldMapping {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Deserialize)]
struct LookupParams {
    mappings: Vec<FieldMapping>,
    #[serde(default)]
    table: HashMap<String, String>,
    #[serde(default = "default_ttl_secs")]
    ttl_secs: u64,
    #[serde(default)]
    overwrite: bool,
}

fn default_ttl_secs() -> u64 {
    24 * 60 * 60
}

pub struct LookupExpert {
    lookup: Box<dyn Lookup>,
    mappings: Vec<FieldMapping>,
    ttl: Duration,
    overwrite: bool,
}

impl LookupExpert {
    pub fn new(lookup: Box<dyn Lookup>, mappings: Vec<FieldMapping>, ttl: Duration) -> Self {
        Self {
            lookup,
            mappings,
            ttl,
            overwrite: false,
        }
    }

    /// Table-backed expert from bot parameters.
    pub fn from_parameters(parameters: &serde_json::Value) -> Result<Self, BotError> {
        let params: LookupParams = serde_json::from_value(parameters.clone())
            .map_err(|e| BotError::Config(format!("lookup parameters: {}", e)))?;
        let mut expert = Self::new(
            Box::new(TableLookup::new(params.table)),
            params.mappings,
            Duration::from_secs(params.ttl_secs),
        );
        expert.overwrite = params.overwrite;
        Ok(expert)
    }

    async fn resolve(&self, ctx: &BotContext, key: &str) -> Result<Option<String>, BotError> {
        let cache_key = CacheNamespace::new(format!("lookup.{}", ctx.bot_id())).key(key);
        if let Some(hit) = ctx.cache().get(&cache_key).await? {
            return Ok(Some(hit).filter(|v| v != NO_ANSWER));
        }
        let answer = self.lookup.lookup(key).await?;
        ctx.cache()
            .set(&cache_key, answer.as_deref().unwrap_or(NO_ANSWER), self.ttl)
            .await?;
        Ok(answer)
    }
}

#[async_trait]
impl Processor for LookupExpert {
    async fn process(&mut self, ctx: &mut BotContext) -> Result<(), BotError> {
        let mut event = ctx.take_message()?;

        for mapping in &self.mappings {
            let Some(key) = event.get(&mapping.from).map(|v| v.to_string()) else {
                continue;
            };
            if event.contains(&mapping.to) && !self.overwrite {
                continue;
            }
            let Some(answer) = self.resolve(ctx, &key).await? else {
                continue;
            };
            if event.contains(&mapping.to) {
                event.change(&mapping.to, answer, true)?;
            } else {
                event.add(&mapping.to, answer, true)?;
            }
        }

        ctx.send_message(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, MemoryCache};
    use crate::harmonization::HarmonizationRegistry;
    use crate::message::Message;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingLookup {
        inner: TableLookup,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Lookup for CountingLookup {
        async fn lookup(&self, key: &str) -> Result<Option<String>, BotError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.lookup(key).await
        }
    }

    fn abuse_contacts() -> TableLookup {
        TableLookup::new(HashMap::from([
            ("93.184.216.34".to_string(), "abuse@edgecast.com".to_string()),
            ("192.0.43.8".to_string(), "ops@icann.org".to_string()),
        ]))
    }

    fn mappings() -> Vec<FieldMapping> {
        vec![
            FieldMapping {
                from: "source.ip".to_string(),
                to: "source.abuse_contact".to_string(),
            },
            FieldMapping {
                from: "destination.ip".to_string(),
                to: "destination.abuse_contact".to_string(),
            },
        ]
    }

    fn context(cache: Arc<dyn Cache>) -> (BotContext, Arc<HarmonizationRegistry>) {
        let registry = Arc::new(HarmonizationRegistry::bundled().unwrap());
        let ctx = BotContext::new("abuse-expert", registry.clone(), cache, serde_json::Value::Null);
        (ctx, registry)
    }

    fn event(registry: &Arc<HarmonizationRegistry>) -> Message {
        let mut event = Message::new_event(registry.clone());
        event.add("source.ip", "93.184.216.34", true).unwrap();
        event.add("destination.ip", "192.0.43.8", true).unwrap();
        event.add("time.observation", "2015-01-01T00:00:00+00:00", true).unwrap();
        event
    }

    #[tokio::test]
    async fn test_fills_abuse_contacts() {
        let (mut ctx, registry) = context(Arc::new(MemoryCache::new()));
        let mut expert = LookupExpert::new(
            Box::new(abuse_contacts()),
            mappings(),
            Duration::from_secs(60),
        );
        ctx.reset(Some(event(&registry)));

        expert.process(&mut ctx).await.unwrap();

        let out = &ctx.pending()[0];
        assert_eq!(
            out.value("source.abuse_contact").unwrap().as_str(),
            Some("abuse@edgecast.com")
        );
        assert_eq!(
            out.value("destination.abuse_contact").unwrap().as_str(),
            Some("ops@icann.org")
        );
    }

    #[tokio::test]
    async fn test_answers_are_memoized_in_cache() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let calls = Arc::new(AtomicU32::new(0));
        let mut expert = LookupExpert::new(
            Box::new(CountingLookup {
                inner: abuse_contacts(),
                calls: calls.clone(),
            }),
            mappings(),
            Duration::from_secs(60),
        );

        let (mut ctx, registry) = context(cache.clone());
        for _ in 0..3 {
            ctx.reset(Some(event(&registry)));
            expert.process(&mut ctx).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            cache.get("lookup.abuse-expert.93.184.216.34").await.unwrap(),
            Some("abuse@edgecast.com".to_string())
        );
    }

    #[tokio::test]
    async fn test_unknown_key_leaves_event_unchanged() {
        let (mut ctx, registry) = context(Arc::new(MemoryCache::new()));
        let mut expert = LookupExpert::new(
            Box::new(TableLookup::default()),
            mappings(),
            Duration::from_secs(60),
        );
        let input = event(&registry);
        ctx.reset(Some(input.clone()));

        expert.process(&mut ctx).await.unwrap();
        assert_eq!(ctx.pending()[0], input);
    }

    #[test]
    fn test_from_parameters() {
        let expert = LookupExpert::from_parameters(&serde_json::json!({
            "mappings": [{"from": "source.ip", "to": "source.abuse_contact"}],
            "table": {"93.184.216.34": "abuse@edgecast.com"},
            "overwrite": true,
        }))
        .unwrap();
        assert!(expert.overwrite);
        assert_eq!(expert.mappings.len(), 1);
    }
}
