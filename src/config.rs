//! Runtime configuration loader.
//!
//! One YAML document describes the pipeline and cache backends and every bot
//! of a deployment:
//!
//! ```yaml
//! pipeline:
//!   backend: nats
//!   max_queue_length: 10000
//! dump_dir: var/dump
//! bots:
//!   turris-parser:
//!     module: csv-columns
//!     source_queue: turris-parser-queue
//!     destination_queues: [file-output-queue]
//!     parameters:
//!       columns: [source.ip, __IGNORE__, event_description.text, __IGNORE__]
//!       classification_type: scanner
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::bot::{BotError, DedupConfig, DumpTarget, RetryPolicy};
use crate::cache::CacheConfig;
use crate::harmonization::{HarmonizationError, HarmonizationRegistry, SchemaDocument};
use crate::ingest::IngestConfig;
use crate::pipeline::{PipelineBackend, PipelineConfig};

pub const DEFAULT_CONFIG_PATH: &str = "config/intelflow.yaml";

/// Configuration of a single bot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfig {
    /// Processor kind, e.g. `csv-columns` or `file`.
    pub module: String,
    /// Absent for collectors.
    #[serde(default)]
    pub source_queue: Option<String>,
    #[serde(default)]
    pub destination_queues: Vec<String>,
    /// Free-form processor parameters.
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Minimum pause between iterations. Required for collectors.
    #[serde(default)]
    pub rate_limit_ms: u64,
    #[serde(default)]
    pub dedup: DedupConfig,
    /// Defaults to a dump file under the global `dump_dir`.
    #[serde(default)]
    pub dump: Option<DumpTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Schema document path; the bundled schema when absent.
    #[serde(default)]
    pub harmonization: Option<PathBuf>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default = "default_dump_dir")]
    pub dump_dir: PathBuf,
    #[serde(default)]
    pub bots: IndexMap<String, BotConfig>,
    /// HTTP collector settings for `intelflow-ingest`.
    #[serde(default)]
    pub ingest: Option<IngestConfig>,
}

fn default_dump_dir() -> PathBuf {
    PathBuf::from("var/dump")
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            harmonization: None,
            pipeline: PipelineConfig::default(),
            cache: CacheConfig::default(),
            dump_dir: default_dump_dir(),
            bots: IndexMap::new(),
            ingest: None,
        }
    }
}

impl RuntimeConfig {
    /// Path named by `INTELFLOW_CONFIG`, or the default location.
    pub fn config_path() -> PathBuf {
        std::env::var("INTELFLOW_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load and validate configuration from a YAML file, then apply
    /// environment overrides.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, BotError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            BotError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml_str(&contents)?;
        config.apply_env();
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, BotError> {
        let config: Self = serde_yaml::from_str(contents)
            .map_err(|e| BotError::Config(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// `NATS_URL` and `NATS_STREAM` win over the file.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("NATS_URL") {
            self.pipeline.nats.url = url.clone();
            self.cache.url = url;
        }
        if let Ok(stream) = std::env::var("NATS_STREAM") {
            self.pipeline.nats.stream_name = stream;
        }
    }

    fn validate(&self) -> Result<(), BotError> {
        for (bot_id, bot) in &self.bots {
            if bot.module.trim().is_empty() {
                return Err(BotError::Config(format!("Bot '{}' has no module", bot_id)));
            }
            if bot.source_queue.is_none() && bot.destination_queues.is_empty() {
                return Err(BotError::Config(format!(
                    "Bot '{}' has neither a source queue nor destination queues",
                    bot_id
                )));
            }
            if bot.source_queue.is_none() && bot.rate_limit_ms == 0 {
                return Err(BotError::Config(format!(
                    "Collector '{}' needs a nonzero rate_limit_ms",
                    bot_id
                )));
            }
            if let Some(source) = &bot.source_queue {
                if bot.destination_queues.contains(source) {
                    return Err(BotError::Config(format!(
                        "Bot '{}' sends to its own source queue",
                        bot_id
                    )));
                }
            }
        }
        if let Some(ingest) = &self.ingest {
            if ingest.destination_queues.is_empty() {
                return Err(BotError::Config(
                    "ingest needs at least one destination queue".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn bot(&self, bot_id: &str) -> Result<&BotConfig, BotError> {
        self.bots
            .get(bot_id)
            .ok_or_else(|| BotError::Config(format!("Unknown bot '{}'", bot_id)))
    }

    /// Settings for `intelflow-ingest`.
    ///
    /// The collector runs in its own process, so it only works on a pipeline
    /// the bot processes can also reach.
    pub fn ingest_config(&self) -> Result<&IngestConfig, BotError> {
        let ingest = self
            .ingest
            .as_ref()
            .ok_or_else(|| BotError::Config("No ingest section".to_string()))?;
        if self.pipeline.backend != PipelineBackend::Nats {
            return Err(BotError::Config(
                "ingest requires the nats pipeline backend; a memory pipeline is private to \
                 one process"
                    .to_string(),
            ));
        }
        Ok(ingest)
    }

    /// Build the harmonization registry this deployment uses.
    pub fn load_registry(&self) -> Result<HarmonizationRegistry, HarmonizationError> {
        match &self.harmonization {
            Some(path) => SchemaDocument::load_from_file(path)?.into_registry(),
            None => HarmonizationRegistry::bundled(),
        }
    }

    /// Dump target for `bot_id`, falling back to the shared dump directory.
    pub fn dump_target(&self, bot_id: &str) -> DumpTarget {
        self.bots
            .get(bot_id)
            .and_then(|bot| bot.dump.clone())
            .unwrap_or_else(|| DumpTarget::File {
                directory: self.dump_dir.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::DedupScope;
    use crate::pipeline::FullQueuePolicy;

    const SAMPLE: &str = r#"
pipeline:
  backend: memory
  max_queue_length: 500
  on_full: fail
dump_dir: /tmp/intelflow-dump
bots:
  turris-parser:
    module: csv-columns
    source_queue: turris-parser-queue
    destination_queues: [dedup-queue]
    parameters:
      columns: [source.ip, __IGNORE__, event_description.text, __IGNORE__]
      classification_type: scanner
  dedup-expert:
    module: lookup
    source_queue: dedup-queue
    destination_queues: [file-output-queue]
    dedup:
      enabled: true
      ttl_secs: 3600
      scope: global
    retry:
      max_attempts: 5
    dump:
      type: queue
      queue: errors
  file-output:
    module: file
    source_queue: file-output-queue
    parameters:
      file: /tmp/events.ndjson
"#;

    #[test]
    fn test_load_sample() {
        let config = RuntimeConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.pipeline.backend, PipelineBackend::Memory);
        assert_eq!(config.pipeline.max_queue_length, 500);
        assert_eq!(config.pipeline.on_full, FullQueuePolicy::Fail);
        assert_eq!(config.bots.len(), 3);

        let dedup = config.bot("dedup-expert").unwrap();
        assert!(dedup.dedup.enabled);
        assert_eq!(dedup.dedup.scope, DedupScope::Global);
        assert_eq!(dedup.dedup.ignore_fields, vec!["time.observation".to_string()]);
        assert_eq!(dedup.retry.max_attempts, 5);
        assert_eq!(dedup.retry.base_delay_ms, RetryPolicy::default().base_delay_ms);

        let parser = config.bot("turris-parser").unwrap();
        assert_eq!(parser.parameters["classification_type"], "scanner");
        assert!(!parser.dedup.enabled);
    }

    #[test]
    fn test_dump_target_fallback() {
        let config = RuntimeConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(
            config.dump_target("turris-parser"),
            DumpTarget::File {
                directory: PathBuf::from("/tmp/intelflow-dump")
            }
        );
        assert_eq!(
            config.dump_target("dedup-expert"),
            DumpTarget::Queue {
                queue: "errors".to_string()
            }
        );
    }

    #[test]
    fn test_rejects_unconnected_bot() {
        let err = RuntimeConfig::from_yaml_str(
            r#"
bots:
  lonely:
    module: file
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("lonely"));
    }

    #[test]
    fn test_rejects_self_loop() {
        let err = RuntimeConfig::from_yaml_str(
            r#"
bots:
  loop:
    module: lookup
    source_queue: q
    destination_queues: [q]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("own source queue"));
    }

    #[test]
    fn test_ingest_section() {
        let config = RuntimeConfig::from_yaml_str(
            r#"
ingest:
  destination_queues: [turris-parser-queue]
  feed_name: Turris Greylist
"#,
        )
        .unwrap();
        let ingest = config.ingest.unwrap();
        assert_eq!(ingest.feed_name.as_deref(), Some("Turris Greylist"));

        let err = RuntimeConfig::from_yaml_str("ingest:\n  destination_queues: []\n").unwrap_err();
        assert!(err.to_string().contains("destination queue"));
    }

    #[test]
    fn test_ingest_requires_shared_pipeline() {
        let memory = RuntimeConfig::from_yaml_str(
            r#"
pipeline:
  backend: memory
ingest:
  destination_queues: [turris-parser-queue]
"#,
        )
        .unwrap();
        let err = memory.ingest_config().unwrap_err();
        assert!(err.to_string().contains("nats"));

        let nats = RuntimeConfig::from_yaml_str(
            r#"
pipeline:
  backend: nats
ingest:
  destination_queues: [turris-parser-queue]
"#,
        )
        .unwrap();
        let ingest = nats.ingest_config().unwrap();
        assert_eq!(ingest.destination_queues, vec!["turris-parser-queue".to_string()]);

        let missing = RuntimeConfig::from_yaml_str("pipeline:\n  backend: nats\n").unwrap();
        assert!(missing.ingest_config().is_err());
    }

    #[test]
    fn test_shipped_config_runs_ingest_on_nats() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
        let config = RuntimeConfig::load_from_file(path).unwrap();
        assert!(config.ingest_config().is_ok());
    }

    #[test]
    fn test_collector_needs_rate_limit() {
        let err = RuntimeConfig::from_yaml_str(
            r#"
bots:
  feed-collector:
    module: http
    destination_queues: [parser-queue]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("rate_limit_ms"));

        let config = RuntimeConfig::from_yaml_str(
            r#"
bots:
  feed-collector:
    module: http
    destination_queues: [parser-queue]
    rate_limit_ms: 3600000
"#,
        )
        .unwrap();
        assert_eq!(config.bot("feed-collector").unwrap().rate_limit_ms, 3_600_000);
    }

    #[test]
    fn test_unknown_bot() {
        let config = RuntimeConfig::default();
        assert!(matches!(config.bot("nope"), Err(BotError::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        let err = RuntimeConfig::load_from_file("/nonexistent/intelflow.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/intelflow.yaml"));
    }

    #[test]
    fn test_bundled_registry_when_no_schema_path() {
        let registry = RuntimeConfig::default().load_registry().unwrap();
        assert!(registry.contains("source.ip"));
    }
}
