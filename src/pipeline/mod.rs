//! Queue transport between bots.
//!
//! A [`Pipeline`] gives a bot at-least-once access to named queues:
//! `receive` hands out one message and keeps it in flight for this consumer
//! until `acknowledge`; a consumer that dies with a message in flight gets
//! it back on its next `receive` after restart (or, for JetStream, another
//! consumer gets it once the ack deadline passes). Several consumers on
//! one queue compete for messages.

pub mod memory;
pub mod nats;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use memory::{MemoryBroker, MemoryPipeline};
pub use nats::{NatsConfig, NatsPipeline};

/// Error type for transport operations
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Backing store unreachable or refused the operation.
    Transport(String),
    /// Destination at capacity.
    QueueFull { queue: String, max_length: usize },
    Config(String),
}

impl PipelineError {
    /// Transport failures and full queues clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Transport(_) | PipelineError::QueueFull { .. })
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Transport(msg) => write!(f, "Pipeline transport error: {}", msg),
            PipelineError::QueueFull { queue, max_length } => {
                write!(f, "Queue '{}' is full ({} messages)", queue, max_length)
            }
            PipelineError::Config(msg) => write!(f, "Pipeline configuration error: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

/// Transport contract used by the bot runtime.
#[async_trait]
pub trait Pipeline: Send {
    /// Wait up to the poll timeout for a message on `queue`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time. The returned message
    /// stays in flight for this consumer until [`Pipeline::acknowledge`].
    async fn receive(&mut self, queue: &str) -> Result<Option<Vec<u8>>, PipelineError>;

    /// Durably drop the in-flight message of `queue`. A no-op when nothing
    /// is in flight.
    async fn acknowledge(&mut self, queue: &str) -> Result<(), PipelineError>;

    /// Enqueue `payload` on every queue in `queues`.
    async fn send(&mut self, queues: &[String], payload: &[u8]) -> Result<(), PipelineError>;

    /// Number of messages waiting on `queue`.
    async fn queue_len(&mut self, queue: &str) -> Result<usize, PipelineError>;

    /// How often a long-running consumer must call [`Pipeline::keep_alive`]
    /// to keep its in-flight message. `None` when in-flight messages never
    /// time out.
    fn keep_alive_interval(&self) -> Option<Duration> {
        None
    }

    /// Reset the redelivery deadline of the in-flight message of `queue`.
    async fn keep_alive(&mut self, _queue: &str) -> Result<(), PipelineError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineBackend {
    #[default]
    Memory,
    Nats,
}

/// What `send` does when a destination is at `max_queue_length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FullQueuePolicy {
    /// Wait for space, up to `send_timeout_ms`.
    #[default]
    Block,
    /// Fail immediately with [`PipelineError::QueueFull`].
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub backend: PipelineBackend,
    #[serde(default = "default_max_queue_length")]
    pub max_queue_length: usize,
    #[serde(default)]
    pub on_full: FullQueuePolicy,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default)]
    pub nats: NatsConfig,
}

fn default_max_queue_length() -> usize {
    10_000
}

fn default_poll_timeout_ms() -> u64 {
    1_000
}

fn default_send_timeout_ms() -> u64 {
    30_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backend: PipelineBackend::default(),
            max_queue_length: default_max_queue_length(),
            on_full: FullQueuePolicy::default(),
            poll_timeout_ms: default_poll_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            nats: NatsConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Open a pipeline for `consumer_id` on the configured backend.
///
/// The in-memory backend needs the process-local `broker` every bot of
/// this process shares.
pub async fn connect(
    config: &PipelineConfig,
    consumer_id: &str,
    broker: Option<&MemoryBroker>,
) -> Result<Box<dyn Pipeline>, PipelineError> {
    match config.backend {
        PipelineBackend::Memory => {
            let broker = broker.ok_or_else(|| {
                PipelineError::Config("memory backend requires a shared broker".to_string())
            })?;
            Ok(Box::new(broker.connect(consumer_id, config.clone())))
        }
        PipelineBackend::Nats => Ok(Box::new(NatsPipeline::connect(config.clone()).await?)),
    }
}
