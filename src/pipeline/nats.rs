//! NATS JetStream pipeline backend
//!
//! Every queue maps to the subject `{subject_prefix}.{queue}` inside one
//! work-queue stream, with one durable pull consumer per queue. Bots reading
//! the same queue share that consumer and compete for messages; a message
//! fetched but not acknowledged within `ack_wait_secs` is redelivered unless
//! its holder sends a progress ack first.

use async_nats::jetstream;
use async_nats::jetstream::consumer::pull;
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{FullQueuePolicy, Pipeline, PipelineConfig, PipelineError};

type PullConsumer = jetstream::consumer::Consumer<pull::Config>;

const FULL_QUEUE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
    pub stream_name: String,
    pub subject_prefix: String,
    pub ack_wait_secs: u64,
    pub max_age_secs: u64,
    pub max_bytes: i64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("NATS_URL")
                .unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            stream_name: std::env::var("NATS_STREAM")
                .unwrap_or_else(|_| "INTELFLOW".to_string()),
            subject_prefix: "intelflow.queue".to_string(),
            ack_wait_secs: 30,
            max_age_secs: 7 * 24 * 60 * 60, // one week
            max_bytes: 1024 * 1024 * 1024,  // 1GB
        }
    }
}

impl NatsConfig {
    pub fn subject(&self, queue: &str) -> String {
        format!("{}.{}", self.subject_prefix, queue)
    }

    /// Ack deadline the consumers are created with. Zero means the server
    /// default of 30 seconds.
    pub fn ack_wait(&self) -> Duration {
        match self.ack_wait_secs {
            0 => Duration::from_secs(30),
            secs => Duration::from_secs(secs),
        }
    }

    /// Progress acks go out at half the ack deadline.
    pub fn progress_interval(&self) -> Duration {
        self.ack_wait() / 2
    }
}

/// Durable consumer names may not contain subject separators or wildcards.
fn consumer_name(queue: &str) -> String {
    queue
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' => '_',
            other => other,
        })
        .collect()
}

fn transport<E: std::fmt::Display>(context: &str) -> impl Fn(E) -> PipelineError + '_ {
    move |e| PipelineError::Transport(format!("{}: {}", context, e))
}

pub struct NatsPipeline {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    stream: jetstream::stream::Stream,
    config: PipelineConfig,
    consumers: HashMap<String, PullConsumer>,
    in_flight: HashMap<String, jetstream::Message>,
}

impl NatsPipeline {
    /// Connect to NATS and make sure the queue stream exists
    pub async fn connect(config: PipelineConfig) -> Result<Self, PipelineError> {
        let nats = &config.nats;
        let client = async_nats::connect(&nats.url)
            .await
            .map_err(transport("Failed to connect to NATS"))?;
        tracing::info!("Connected to NATS at {}", nats.url);

        let jetstream = jetstream::new(client.clone());
        let stream = jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: nats.stream_name.clone(),
                subjects: vec![format!("{}.>", nats.subject_prefix)],
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                max_age: Duration::from_secs(nats.max_age_secs),
                max_bytes: nats.max_bytes,
                storage: jetstream::stream::StorageType::File,
                num_replicas: 1,
                ..Default::default()
            })
            .await
            .map_err(transport("Failed to create stream"))?;

        tracing::info!("JetStream stream '{}' ready", nats.stream_name);

        Ok(Self {
            client,
            jetstream,
            stream,
            config,
            consumers: HashMap::new(),
            in_flight: HashMap::new(),
        })
    }

    /// Check if the NATS connection is active
    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    async fn consumer(&mut self, queue: &str) -> Result<&mut PullConsumer, PipelineError> {
        if !self.consumers.contains_key(queue) {
            let name = consumer_name(queue);
            let consumer = self
                .stream
                .get_or_create_consumer(
                    &name,
                    pull::Config {
                        durable_name: Some(name.clone()),
                        ack_policy: jetstream::consumer::AckPolicy::Explicit,
                        ack_wait: self.config.nats.ack_wait(),
                        filter_subject: self.config.nats.subject(queue),
                        ..Default::default()
                    },
                )
                .await
                .map_err(transport("Failed to create consumer"))?;
            tracing::debug!("Consumer '{}' ready for queue '{}'", name, queue);
            self.consumers.insert(queue.to_string(), consumer);
        }
        self.consumers
            .get_mut(queue)
            .ok_or_else(|| PipelineError::Transport(format!("No consumer for queue '{}'", queue)))
    }

    /// Pending plus unacknowledged messages on `queue`.
    async fn depth(&mut self, queue: &str) -> Result<usize, PipelineError> {
        let consumer = self.consumer(queue).await?;
        let info = consumer
            .info()
            .await
            .map_err(transport("Failed to read consumer info"))?;
        Ok(info.num_pending as usize + info.num_ack_pending as usize)
    }

    /// Send a progress ack for every message this consumer holds.
    async fn touch_in_flight(&self) -> Result<(), PipelineError> {
        for (queue, message) in &self.in_flight {
            message
                .ack_with(AckKind::Progress)
                .await
                .map_err(transport("Failed to extend ack deadline"))?;
            tracing::trace!("Extended ack deadline on queue '{}'", queue);
        }
        Ok(())
    }

    async fn wait_for_space(&mut self, queue: &str) -> Result<(), PipelineError> {
        let deadline = Instant::now() + self.config.send_timeout();
        let progress_interval = self.config.nats.progress_interval();
        let mut last_progress = Instant::now();
        loop {
            let depth = self.depth(queue).await?;
            if depth < self.config.max_queue_length {
                return Ok(());
            }
            let full = PipelineError::QueueFull {
                queue: queue.to_string(),
                max_length: self.config.max_queue_length,
            };
            if self.config.on_full == FullQueuePolicy::Fail || Instant::now() >= deadline {
                return Err(full);
            }
            tracing::debug!(error = %full, "Destination full, waiting for space");
            if last_progress.elapsed() >= progress_interval {
                self.touch_in_flight().await?;
                last_progress = Instant::now();
            }
            tokio::time::sleep(FULL_QUEUE_POLL).await;
        }
    }
}

#[async_trait]
impl Pipeline for NatsPipeline {
    async fn receive(&mut self, queue: &str) -> Result<Option<Vec<u8>>, PipelineError> {
        if let Some(message) = self.in_flight.get(queue) {
            return Ok(Some(message.payload.to_vec()));
        }

        let poll_timeout = self.config.poll_timeout();
        let consumer = self.consumer(queue).await?;
        let mut batch = consumer
            .fetch()
            .max_messages(1)
            .expires(poll_timeout)
            .messages()
            .await
            .map_err(transport("Failed to fetch"))?;

        match batch.next().await {
            Some(Ok(message)) => {
                let payload = message.payload.to_vec();
                self.in_flight.insert(queue.to_string(), message);
                Ok(Some(payload))
            }
            Some(Err(e)) => Err(PipelineError::Transport(format!("Failed to receive: {}", e))),
            None => Ok(None),
        }
    }

    async fn acknowledge(&mut self, queue: &str) -> Result<(), PipelineError> {
        match self.in_flight.remove(queue) {
            Some(message) => message
                .ack()
                .await
                .map_err(transport("Failed to acknowledge")),
            None => Ok(()),
        }
    }

    async fn send(&mut self, queues: &[String], payload: &[u8]) -> Result<(), PipelineError> {
        for queue in queues {
            self.wait_for_space(queue).await?;
            let subject = self.config.nats.subject(queue);

            // Publish with JetStream (durable, acknowledged)
            let ack = self
                .jetstream
                .publish(subject.clone(), payload.to_vec().into())
                .await
                .map_err(transport("Failed to publish"))?;
            ack.await.map_err(transport("Publish not acknowledged"))?;

            tracing::debug!("Published {} bytes to {}", payload.len(), subject);
        }
        Ok(())
    }

    async fn queue_len(&mut self, queue: &str) -> Result<usize, PipelineError> {
        let consumer = self.consumer(queue).await?;
        let info = consumer
            .info()
            .await
            .map_err(transport("Failed to read consumer info"))?;
        Ok(info.num_pending as usize)
    }

    fn keep_alive_interval(&self) -> Option<Duration> {
        Some(self.config.nats.progress_interval())
    }

    async fn keep_alive(&mut self, queue: &str) -> Result<(), PipelineError> {
        match self.in_flight.get(queue) {
            Some(message) => message
                .ack_with(AckKind::Progress)
                .await
                .map_err(transport("Failed to extend ack deadline")),
            None => Ok(()),
        }
    }
}
