//! AlienVault OTX pulse parser.
//!
//! A Report's `raw` holds a JSON array of pulses, each with a list of
//! indicators. Every indicator of a supported type becomes one Event; the
//! rest are skipped.

use async_trait::async_trait;
use serde::Deserialize;

use crate::bot::{BotContext, BotError, Processor};
use crate::message::Outcome;

/// `malware.hash` prefixes by indicator type.
const HASH_PREFIXES: &[(&str, &str)] = &[
    ("FileHash-SHA256", "$5$"),
    ("FileHash-SHA1", "$sha1$"),
    ("FileHash-MD5", "$1$"),
];

#[derive(Debug, Deserialize)]
struct Pulse {
    author_name: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    indicators: Vec<serde_json::Value>,
}

/// Field receiving an indicator of the given OTX type.
fn target_field(indicator_type: &str) -> Option<&'static str> {
    match indicator_type {
        "hostname" | "domain" => Some("source.fqdn"),
        "IPv4" | "IPv6" => Some("source.ip"),
        "email" => Some("source.account"),
        "URL" | "URI" => Some("source.url"),
        "CIDR" => Some("source.network"),
        _ => None,
    }
}

/// OTX timestamps are UTC without an offset and with milliseconds.
fn source_time(created: &str) -> String {
    let seconds = created.split('.').next().unwrap_or(created);
    format!("{}+00:00", seconds.trim_end_matches('Z'))
}

#[derive(Debug, Default)]
pub struct OtxParser;

impl OtxParser {
    fn indicator(
        ctx: &BotContext,
        pulse: &Pulse,
        extra: &str,
        indicator: &serde_json::Value,
    ) -> Result<Outcome, BotError> {
        let (Some(kind), Some(value)) = (
            indicator.get("type").and_then(|v| v.as_str()),
            indicator.get("indicator").and_then(|v| v.as_str()),
        ) else {
            return Ok(Outcome::Skip("indicator without type or value".to_string()));
        };

        let mut event = ctx.new_event()?;
        if let Some((_, prefix)) = HASH_PREFIXES.iter().find(|(t, _)| *t == kind) {
            event.add("malware.hash", format!("{}{}", prefix, value), true)?;
        } else if let Some(field) = target_field(kind) {
            event.add(field, value, true)?;
        } else {
            return Ok(Outcome::Skip(format!("unsupported indicator type '{}'", kind)));
        }

        if !pulse.description.trim().is_empty() {
            event.add("comment", pulse.description.as_str(), true)?;
        }
        event.add("extra", extra, true)?;
        event.add("classification.type", "blacklist", true)?;
        if let Some(created) = indicator.get("created").and_then(|v| v.as_str()) {
            event.add("time.source", source_time(created), true)?;
        }
        event.add("raw", serde_json::to_string(indicator)?, true)?;
        Ok(Outcome::Emit(event))
    }
}

#[async_trait]
impl Processor for OtxParser {
    async fn process(&mut self, ctx: &mut BotContext) -> Result<(), BotError> {
        let Some(text) = ctx.receive_message()?.raw_text()? else {
            tracing::debug!(bot_id = %ctx.bot_id(), "Report without raw payload");
            return Ok(());
        };
        let pulses: Vec<Pulse> = serde_json::from_str(&text)?;

        for pulse in &pulses {
            let extra = serde_json::json!({
                "author": pulse.author_name,
                "pulse": pulse.name,
            })
            .to_string();
            for indicator in &pulse.indicators {
                let outcome = Self::indicator(ctx, pulse, &extra, indicator)?;
                ctx.apply(outcome);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::harmonization::HarmonizationRegistry;
    use crate::message::Message;
    use std::sync::Arc;

    const PULSES: &str = r#"[{
        "author_name": "AlienVault",
        "name": "Sample pulse",
        "description": "Infrastructure seen in phishing",
        "indicators": [
            {"type": "IPv4", "indicator": "93.184.216.34", "created": "2015-08-25T17:53:42.123"},
            {"type": "domain", "indicator": "Example.COM", "created": "2015-08-25T17:53:42.123"},
            {"type": "FileHash-MD5", "indicator": "d41d8cd98f00b204e9800998ecf8427e", "created": "2015-08-25T17:53:42.123"},
            {"type": "Mutex", "indicator": "Global\\x", "created": "2015-08-25T17:53:42.123"}
        ]
    }]"#;

    fn context() -> BotContext {
        let registry = Arc::new(HarmonizationRegistry::bundled().unwrap());
        let mut ctx = BotContext::new(
            "otx-parser",
            registry.clone(),
            Arc::new(MemoryCache::new()),
            serde_json::Value::Null,
        );
        let mut report = Message::new_report(registry);
        report.add("feed.name", "AlienVault OTX", true).unwrap();
        report.add("raw", PULSES, true).unwrap();
        ctx.reset(Some(report));
        ctx
    }

    #[tokio::test]
    async fn test_supported_indicators_become_events() {
        let mut ctx = context();
        OtxParser.process(&mut ctx).await.unwrap();

        let events = ctx.pending();
        assert_eq!(events.len(), 3);

        let ip = &events[0];
        assert_eq!(ip.value("source.ip").unwrap().as_str(), Some("93.184.216.34"));
        assert_eq!(ip.value("classification.type").unwrap().as_str(), Some("blacklist"));
        assert_eq!(ip.value("comment").unwrap().as_str(), Some("Infrastructure seen in phishing"));
        assert_eq!(ip.value("time.source").unwrap().as_str(), Some("2015-08-25T17:53:42+00:00"));
        assert_eq!(ip.value("feed.name").unwrap().as_str(), Some("AlienVault OTX"));

        let extra: serde_json::Value =
            serde_json::from_str(ip.value("extra").unwrap().as_str().unwrap()).unwrap();
        assert_eq!(extra, serde_json::json!({"author": "AlienVault", "pulse": "Sample pulse"}));

        let raw: serde_json::Value =
            serde_json::from_str(&ip.raw_text().unwrap().unwrap()).unwrap();
        assert_eq!(raw["indicator"], "93.184.216.34");

        assert_eq!(events[1].value("source.fqdn").unwrap().as_str(), Some("example.com"));
        assert_eq!(
            events[2].value("malware.hash").unwrap().as_str(),
            Some("$1$d41d8cd98f00b204e9800998ecf8427e")
        );
    }

    #[test]
    fn test_source_time() {
        assert_eq!(source_time("2015-08-25T17:53:42.123"), "2015-08-25T17:53:42+00:00");
        assert_eq!(source_time("2015-08-25T17:53:42"), "2015-08-25T17:53:42+00:00");
    }

    #[tokio::test]
    async fn test_malformed_pulses_fail_permanently() {
        let registry = Arc::new(HarmonizationRegistry::bundled().unwrap());
        let mut ctx = BotContext::new(
            "otx-parser",
            registry.clone(),
            Arc::new(MemoryCache::new()),
            serde_json::Value::Null,
        );
        let mut report = Message::new_report(registry);
        report.add("raw", "{not a list", true).unwrap();
        ctx.reset(Some(report));

        let err = OtxParser.process(&mut ctx).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
