//! In-process queue broker.
//!
//! Mirrors the layout of a shared queue store: one ordered list of pending
//! payloads per queue plus one in-flight slot per (queue, consumer). A
//! consumer that reconnects under the same id finds its unacknowledged
//! message waiting in that slot, which is how a crash-and-restart is
//! simulated in-process.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{FullQueuePolicy, Pipeline, PipelineConfig, PipelineError};

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    in_flight: HashMap<(String, String), Vec<u8>>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    changed: Notify,
}

/// Shared backing store for every [`MemoryPipeline`] connected to it.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a pipeline for one consumer.
    pub fn connect(
        &self,
        consumer_id: impl Into<String>,
        config: PipelineConfig,
    ) -> MemoryPipeline {
        MemoryPipeline {
            broker: self.clone(),
            consumer_id: consumer_id.into(),
            config,
        }
    }

    /// Pending (not in-flight) messages on `queue`.
    pub async fn queue_len(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map(|q| q.len()).unwrap_or(0)
    }

    /// Snapshot of the pending payloads on `queue`, oldest first.
    pub async fn peek_all(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.inner.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of messages held in flight across all consumers of `queue`.
    pub async fn in_flight_len(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.in_flight.keys().filter(|(q, _)| q == queue).count()
    }
}

/// One consumer's handle on a [`MemoryBroker`].
pub struct MemoryPipeline {
    broker: MemoryBroker,
    consumer_id: String,
    config: PipelineConfig,
}

impl MemoryPipeline {
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    fn slot(&self, queue: &str) -> (String, String) {
        (queue.to_string(), self.consumer_id.clone())
    }

    async fn try_receive(&self, queue: &str) -> Option<Vec<u8>> {
        let mut state = self.broker.inner.state.lock().await;
        let slot = self.slot(queue);
        if let Some(payload) = state.in_flight.get(&slot) {
            tracing::debug!(queue, consumer = %self.consumer_id, "Redelivering in-flight message");
            return Some(payload.clone());
        }
        let payload = state.queues.get_mut(queue).and_then(|q| q.pop_front())?;
        state.in_flight.insert(slot, payload.clone());
        drop(state);
        // a slot freed up for blocked senders
        self.broker.inner.changed.notify_waiters();
        Some(payload)
    }

    /// Push to every queue if all have room; otherwise report the first full one.
    async fn try_send(&self, queues: &[String], payload: &[u8]) -> Result<(), String> {
        let mut state = self.broker.inner.state.lock().await;
        let max = self.config.max_queue_length;
        if let Some(full) = queues
            .iter()
            .find(|q| state.queues.get(q.as_str()).map(|q| q.len()).unwrap_or(0) >= max)
        {
            return Err(full.clone());
        }
        for queue in queues {
            state
                .queues
                .entry(queue.clone())
                .or_default()
                .push_back(payload.to_vec());
        }
        drop(state);
        self.broker.inner.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Pipeline for MemoryPipeline {
    async fn receive(&mut self, queue: &str) -> Result<Option<Vec<u8>>, PipelineError> {
        let deadline = Instant::now() + self.config.poll_timeout();
        loop {
            let notified = self.broker.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.try_receive(queue).await {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn acknowledge(&mut self, queue: &str) -> Result<(), PipelineError> {
        let mut state = self.broker.inner.state.lock().await;
        if state.in_flight.remove(&self.slot(queue)).is_none() {
            tracing::trace!(queue, "Acknowledge with nothing in flight");
        }
        Ok(())
    }

    async fn send(&mut self, queues: &[String], payload: &[u8]) -> Result<(), PipelineError> {
        let deadline = Instant::now() + self.config.send_timeout();
        loop {
            let notified = self.broker.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let full_queue = match self.try_send(queues, payload).await {
                Ok(()) => return Ok(()),
                Err(queue) => queue,
            };
            let full = PipelineError::QueueFull {
                queue: full_queue,
                max_length: self.config.max_queue_length,
            };
            if self.config.on_full == FullQueuePolicy::Fail {
                return Err(full);
            }
            tracing::debug!(error = %full, "Destination full, waiting for space");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(full);
            }
        }
    }

    async fn queue_len(&mut self, queue: &str) -> Result<usize, PipelineError> {
        Ok(self.broker.queue_len(queue).await)
    }
}
