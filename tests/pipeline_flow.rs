//! End-to-end flows over the in-process pipeline and cache.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use intelflow::bot::{
    read_dump_file, BotContext, BotError, BotRuntime, DedupConfig, FileDump, IterationOutcome,
    Processor, RetryPolicy,
};
use intelflow::bots;
use intelflow::cache::{Cache, MemoryCache};
use intelflow::config::{BotConfig, RuntimeConfig};
use intelflow::harmonization::HarmonizationRegistry;
use intelflow::ingest::{build_report, IngestConfig};
use intelflow::message::{Message, MessageKind};
use intelflow::pipeline::{MemoryBroker, Pipeline, PipelineConfig};
use pretty_assertions::assert_eq;

fn registry() -> Arc<HarmonizationRegistry> {
    Arc::new(HarmonizationRegistry::bundled().unwrap())
}

fn fast_pipeline() -> PipelineConfig {
    PipelineConfig {
        poll_timeout_ms: 100,
        send_timeout_ms: 100,
        ..Default::default()
    }
}

async fn enqueue(broker: &MemoryBroker, queue: &str, message: &Message) {
    broker
        .connect("producer", fast_pipeline())
        .send(&[queue.to_string()], &message.serialize().unwrap())
        .await
        .unwrap();
}

/// Forwards every message unchanged.
struct Forward {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Processor for Forward {
    async fn process(&mut self, ctx: &mut BotContext) -> Result<(), BotError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let message = ctx.take_message()?;
        ctx.send_message(message);
        Ok(())
    }
}

/// Always fails as if a remote service were down.
struct Unreachable {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Processor for Unreachable {
    async fn process(&mut self, _ctx: &mut BotContext) -> Result<(), BotError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BotError::transient("connection refused"))
    }
}

fn forwarding_bot(
    broker: &MemoryBroker,
    consumer: &str,
    config: BotConfig,
    processor: Box<dyn Processor>,
    cache: Arc<dyn Cache>,
    dump_dir: &std::path::Path,
) -> BotRuntime {
    BotRuntime::new(
        consumer,
        config,
        registry(),
        processor,
        Box::new(broker.connect(consumer, fast_pipeline())),
        cache,
        Box::new(FileDump::new(dump_dir, consumer)),
    )
}

fn event(ip: &str, observed: &str) -> Message {
    let mut event = Message::new_event(registry());
    event.add("source.ip", ip, true).unwrap();
    event.add("time.observation", observed, true).unwrap();
    event
}

#[tokio::test]
async fn test_turris_row_becomes_one_event_in_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("events.ndjson");
    let yaml = format!(
        r#"
dump_dir: {dump}
pipeline:
  poll_timeout_ms: 100
bots:
  turris-parser:
    module: csv-columns
    source_queue: turris-parser-queue
    destination_queues: [file-output-queue]
    parameters:
      columns: [source.ip, __IGNORE__, event_description.text, __IGNORE__]
      classification_type: scanner
  file-output:
    module: file
    source_queue: file-output-queue
    parameters:
      file: {output}
"#,
        dump = dir.path().join("dump").display(),
        output = output.display(),
    );
    let config = RuntimeConfig::from_yaml_str(&yaml).unwrap();
    let broker = MemoryBroker::new();
    let cache = MemoryCache::new();

    let report = build_report(
        registry(),
        &IngestConfig::default(),
        Some("Turris Greylist"),
        "93.184.216.34,,scanning,,",
    )
    .unwrap();
    enqueue(&broker, "turris-parser-queue", &report).await;

    let mut parser = bots::build_runtime(
        &config,
        "turris-parser",
        registry(),
        Some(&broker),
        Some(&cache),
    )
    .await
    .unwrap();
    let mut writer = bots::build_runtime(
        &config,
        "file-output",
        registry(),
        Some(&broker),
        Some(&cache),
    )
    .await
    .unwrap();

    assert_eq!(parser.run_once().await.unwrap(), IterationOutcome::Processed);
    assert_eq!(broker.queue_len("file-output-queue").await, 1);
    assert_eq!(writer.run_once().await.unwrap(), IterationOutcome::Processed);
    assert_eq!(writer.run_once().await.unwrap(), IterationOutcome::Idle);

    let contents = std::fs::read_to_string(&output).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 1);

    let event = Message::deserialize(lines[0].as_bytes(), registry()).unwrap();
    assert_eq!(event.kind(), MessageKind::Event);
    assert_eq!(event.value("source.ip").unwrap().as_str(), Some("93.184.216.34"));
    assert_eq!(event.value("event_description.text").unwrap().as_str(), Some("scanning"));
    assert_eq!(event.value("classification.type").unwrap().as_str(), Some("scanner"));
    assert_eq!(event.value("feed.name").unwrap().as_str(), Some("Turris Greylist"));
    assert_eq!(
        event.value("time.observation").unwrap(),
        report.value("time.observation").unwrap()
    );
    assert_eq!(event.raw_text().unwrap().as_deref(), Some("93.184.216.34,,scanning,,"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_then_dumped_once() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    enqueue(&broker, "in", &event("93.184.216.34", "2015-01-01T00:00:00+00:00")).await;

    let calls = Arc::new(AtomicU32::new(0));
    let config = BotConfig {
        module: "test".to_string(),
        source_queue: Some("in".to_string()),
        destination_queues: vec!["out".to_string()],
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
        },
        ..Default::default()
    };
    let mut bot = forwarding_bot(
        &broker,
        "flaky-expert",
        config,
        Box::new(Unreachable { calls: calls.clone() }),
        Arc::new(MemoryCache::new()),
        dir.path(),
    );

    assert_eq!(bot.run_once().await.unwrap(), IterationOutcome::Dumped);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(bot.stats().retries, 2);
    assert_eq!(broker.queue_len("out").await, 0);
    assert_eq!(broker.queue_len("in").await, 0);
    assert_eq!(broker.in_flight_len("in").await, 0);

    let records = read_dump_file(dir.path().join("flaky-expert.dump.ndjson")).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error_kind, "retry_exhausted");
    assert_eq!(records[0].source_queue.as_deref(), Some("in"));
}

#[tokio::test(start_paused = true)]
async fn test_identical_messages_are_forwarded_once() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    // Only the observation time differs, which the fingerprint ignores.
    enqueue(&broker, "in", &event("93.184.216.34", "2015-01-01T00:00:00+00:00")).await;
    enqueue(&broker, "in", &event("93.184.216.34", "2015-01-01T00:05:00+00:00")).await;

    let calls = Arc::new(AtomicU32::new(0));
    let config = BotConfig {
        module: "test".to_string(),
        source_queue: Some("in".to_string()),
        destination_queues: vec!["out".to_string()],
        dedup: DedupConfig {
            enabled: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut bot = forwarding_bot(
        &broker,
        "dedup-expert",
        config,
        Box::new(Forward { calls: calls.clone() }),
        Arc::new(MemoryCache::new()),
        dir.path(),
    );

    assert_eq!(bot.run_once().await.unwrap(), IterationOutcome::Processed);
    assert_eq!(bot.run_once().await.unwrap(), IterationOutcome::Duplicate);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.queue_len("out").await, 1);
    assert_eq!(broker.in_flight_len("in").await, 0);
    assert_eq!(bot.stats().duplicates, 1);
}

#[tokio::test(start_paused = true)]
async fn test_dedup_window_expires() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let calls = Arc::new(AtomicU32::new(0));
    let config = BotConfig {
        module: "test".to_string(),
        source_queue: Some("in".to_string()),
        destination_queues: vec!["out".to_string()],
        dedup: DedupConfig {
            enabled: true,
            ttl_secs: 60,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut bot = forwarding_bot(
        &broker,
        "dedup-expert",
        config,
        Box::new(Forward { calls: calls.clone() }),
        Arc::new(MemoryCache::new()),
        dir.path(),
    );

    enqueue(&broker, "in", &event("192.0.43.8", "2015-01-01T00:00:00+00:00")).await;
    assert_eq!(bot.run_once().await.unwrap(), IterationOutcome::Processed);

    tokio::time::advance(Duration::from_secs(61)).await;
    enqueue(&broker, "in", &event("192.0.43.8", "2015-01-01T00:00:00+00:00")).await;
    assert_eq!(bot.run_once().await.unwrap(), IterationOutcome::Processed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(broker.queue_len("out").await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_message_is_redelivered_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    enqueue(&broker, "in", &event("93.184.216.34", "2015-01-01T00:00:00+00:00")).await;

    // A previous run of the bot took the message and died before acknowledging.
    {
        let mut crashed = broker.connect("file-output", fast_pipeline());
        assert!(crashed.receive("in").await.unwrap().is_some());
    }
    assert_eq!(broker.queue_len("in").await, 0);
    assert_eq!(broker.in_flight_len("in").await, 1);

    let calls = Arc::new(AtomicU32::new(0));
    let config = BotConfig {
        module: "test".to_string(),
        source_queue: Some("in".to_string()),
        destination_queues: vec!["out".to_string()],
        ..Default::default()
    };
    let mut bot = forwarding_bot(
        &broker,
        "file-output",
        config,
        Box::new(Forward { calls: calls.clone() }),
        Arc::new(MemoryCache::new()),
        dir.path(),
    );

    assert_eq!(bot.run_once().await.unwrap(), IterationOutcome::Processed);
    assert_eq!(bot.run_once().await.unwrap(), IterationOutcome::Idle);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.in_flight_len("in").await, 0);
    assert_eq!(broker.queue_len("out").await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shared_cache_entries_expire() {
    let local = MemoryCache::new();
    let cache = intelflow::cache::connect(&Default::default(), Some(&local))
        .await
        .unwrap();

    cache
        .set("lookup.abuse-expert.93.184.216.34", "abuse@edgecast.com", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(cache.exists("lookup.abuse-expert.93.184.216.34").await.unwrap());

    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(cache.get("lookup.abuse-expert.93.184.216.34").await.unwrap(), None);
    assert!(local.is_empty().await);
}
