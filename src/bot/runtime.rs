use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BotContext, BotError, BotState, Deduplicator, DumpRecord, DumpSink, Processor};
use crate::cache::Cache;
use crate::config::BotConfig;
use crate::harmonization::HarmonizationRegistry;
use crate::message::Message;
use crate::pipeline::Pipeline;

/// What a single iteration did with its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Poll timed out with nothing to do.
    Idle,
    Processed,
    /// Seen within the dedup TTL; acknowledged unprocessed.
    Duplicate,
    /// Failed permanently; dumped and acknowledged.
    Dumped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub processed: u64,
    pub duplicates: u64,
    pub retries: u64,
    pub dumped: u64,
    /// Deliveries written to destination queues (one per message per queue).
    pub sent: u64,
}

/// Deliveries of one processing result still waiting to be written.
type Deliveries = VecDeque<(String, Vec<u8>)>;

pub struct BotRuntime {
    bot_id: String,
    config: BotConfig,
    processor: Box<dyn Processor>,
    pipeline: Box<dyn Pipeline>,
    dump: Box<dyn DumpSink>,
    dedup: Option<Deduplicator>,
    context: BotContext,
    state: BotState,
    stats: RunStats,
}

impl BotRuntime {
    pub fn new(
        bot_id: impl Into<String>,
        config: BotConfig,
        registry: Arc<HarmonizationRegistry>,
        processor: Box<dyn Processor>,
        pipeline: Box<dyn Pipeline>,
        cache: Arc<dyn Cache>,
        dump: Box<dyn DumpSink>,
    ) -> Self {
        let bot_id = bot_id.into();
        let dedup = if config.dedup.enabled && config.source_queue.is_some() {
            Some(Deduplicator::new(&bot_id, &config.dedup, cache.clone()))
        } else {
            None
        };
        let context = BotContext::new(bot_id.clone(), registry, cache, config.parameters.clone());
        Self {
            bot_id,
            config,
            processor,
            pipeline,
            dump,
            dedup,
            context,
            state: BotState::Init,
            stats: RunStats::default(),
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn state(&self) -> BotState {
        self.state
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Loop until `shutdown` is cancelled or a fatal error occurs.
    ///
    /// Cancellation is observed between iterations, during an idle poll and
    /// during the rate-limit pause; an iteration that has received a message
    /// always runs through acknowledge first.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<RunStats, BotError> {
        self.state = BotState::Running;
        info!(
            bot_id = %self.bot_id,
            source_queue = ?self.config.source_queue,
            destinations = ?self.config.destination_queues,
            "Bot started"
        );

        // Consecutive pipeline failures, for the loop-level backoff.
        let mut failures = 0u32;
        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }

            let outcome = match self.config.source_queue.clone() {
                None => self.collect().await,
                Some(queue) => {
                    self.state = BotState::Receiving;
                    let received = tokio::select! {
                        _ = shutdown.cancelled() => break Ok(()),
                        received = self.pipeline.receive(&queue) => received,
                    };
                    match received {
                        Ok(Some(payload)) => self.handle(&queue, payload).await,
                        Ok(None) => Ok(IterationOutcome::Idle),
                        Err(e) => Err(e.into()),
                    }
                }
            };

            if outcome.is_ok() {
                failures = 0;
            }
            match outcome {
                Ok(IterationOutcome::Idle) => {}
                Ok(_) => {
                    self.state = BotState::Running;
                    if self.config.rate_limit_ms > 0 {
                        let pause = Duration::from_millis(self.config.rate_limit_ms);
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    failures = failures.saturating_add(1);
                    let delay = self.config.retry.delay_for(failures);
                    warn!(
                        bot_id = %self.bot_id,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Pipeline unavailable, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    self.state = BotState::Error;
                    error!(bot_id = %self.bot_id, error = %e, "Bot stopped on fatal error");
                    break Err(e);
                }
            }
        };

        if let Err(e) = self.processor.shutdown().await {
            warn!(bot_id = %self.bot_id, error = %e, "Processor shutdown failed");
        }
        if result.is_ok() {
            self.state = BotState::Shutdown;
        }
        info!(
            bot_id = %self.bot_id,
            processed = self.stats.processed,
            duplicates = self.stats.duplicates,
            retries = self.stats.retries,
            dumped = self.stats.dumped,
            sent = self.stats.sent,
            "Bot stopped"
        );
        result.map(|()| self.stats.clone())
    }

    /// Run exactly one iteration.
    pub async fn run_once(&mut self) -> Result<IterationOutcome, BotError> {
        match self.config.source_queue.clone() {
            None => self.collect().await,
            Some(queue) => {
                self.state = BotState::Receiving;
                match self.pipeline.receive(&queue).await? {
                    Some(payload) => self.handle(&queue, payload).await,
                    None => Ok(IterationOutcome::Idle),
                }
            }
        }
    }

    async fn collect(&mut self) -> Result<IterationOutcome, BotError> {
        match self.attempt(None, None).await {
            Ok(()) => {
                self.stats.processed += 1;
                Ok(IterationOutcome::Processed)
            }
            Err(e) => {
                self.dump_message(None, &[], e).await?;
                Ok(IterationOutcome::Dumped)
            }
        }
    }

    async fn handle(
        &mut self,
        queue: &str,
        payload: Vec<u8>,
    ) -> Result<IterationOutcome, BotError> {
        self.state = BotState::Processing;
        let message = match Message::deserialize(&payload, self.context.registry().clone()) {
            Ok(message) => message,
            Err(e) => {
                self.dump_message(Some(queue), &payload, e.into()).await?;
                return Ok(IterationOutcome::Dumped);
            }
        };

        let duplicate = match &self.dedup {
            Some(dedup) => dedup.is_duplicate(&message).await,
            None => Ok(false),
        };
        match duplicate {
            Ok(true) => {
                debug!(bot_id = %self.bot_id, queue, "Duplicate message, acknowledging");
                self.acknowledge(queue).await?;
                self.stats.duplicates += 1;
                return Ok(IterationOutcome::Duplicate);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(bot_id = %self.bot_id, error = %e, "Dedup lookup failed, processing anyway");
            }
        }

        if let Err(e) = self.attempt(Some(queue), Some(message.clone())).await {
            self.dump_message(Some(queue), &payload, e).await?;
            return Ok(IterationOutcome::Dumped);
        }

        if let Some(dedup) = &self.dedup {
            if let Err(e) = dedup.record(&message).await {
                warn!(bot_id = %self.bot_id, error = %e, "Failed to record dedup fingerprint");
            }
        }
        self.acknowledge(queue).await?;
        self.stats.processed += 1;
        Ok(IterationOutcome::Processed)
    }

    /// Process and deliver, retrying transient failures with backoff.
    ///
    /// Once processing has succeeded, later attempts only resend the
    /// deliveries that have not gone out yet. The message taken from
    /// `queue` stays owned by this bot through the backoff pauses.
    async fn attempt(
        &mut self,
        queue: Option<&str>,
        message: Option<Message>,
    ) -> Result<(), BotError> {
        let policy = self.config.retry.clone();
        let mut deliveries: Option<Deliveries> = None;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.try_once(&message, &mut deliveries).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if !err.is_transient() {
                return Err(err);
            }
            if !policy.allows_retry_after(attempt) {
                return Err(BotError::RetryExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            let delay = policy.delay_for(attempt);
            warn!(
                bot_id = %self.bot_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            self.stats.retries += 1;
            self.backoff(queue, delay).await;
        }
    }

    /// Sleep for `delay`, renewing the in-flight message of `queue` as
    /// often as the pipeline requires.
    async fn backoff(&mut self, queue: Option<&str>, delay: Duration) {
        let renewal = queue
            .zip(self.pipeline.keep_alive_interval())
            .filter(|(_, interval)| !interval.is_zero());
        let Some((queue, interval)) = renewal else {
            tokio::time::sleep(delay).await;
            return;
        };
        let mut remaining = delay;
        while !remaining.is_zero() {
            if let Err(e) = self.pipeline.keep_alive(queue).await {
                warn!(
                    bot_id = %self.bot_id,
                    queue,
                    error = %e,
                    "Failed to extend in-flight message"
                );
            }
            let step = remaining.min(interval);
            tokio::time::sleep(step).await;
            remaining -= step;
        }
    }

    async fn try_once(
        &mut self,
        message: &Option<Message>,
        deliveries: &mut Option<Deliveries>,
    ) -> Result<(), BotError> {
        if deliveries.is_none() {
            self.state = BotState::Processing;
            self.context.reset(message.clone());
            self.processor.process(&mut self.context).await?;

            let mut queued = Deliveries::new();
            for output in self.context.take_outbox() {
                let bytes = output.serialize()?;
                for queue in &self.config.destination_queues {
                    queued.push_back((queue.clone(), bytes.clone()));
                }
            }
            *deliveries = Some(queued);
        }

        self.state = BotState::Sending;
        if let Some(queued) = deliveries.as_mut() {
            while let Some((queue, bytes)) = queued.front() {
                self.pipeline.send(std::slice::from_ref(queue), bytes).await?;
                queued.pop_front();
                self.stats.sent += 1;
            }
        }
        Ok(())
    }

    async fn acknowledge(&mut self, queue: &str) -> Result<(), BotError> {
        self.state = BotState::Acknowledging;
        self.pipeline.acknowledge(queue).await?;
        Ok(())
    }

    /// Record a permanent failure, then acknowledge the source message.
    ///
    /// A failing dump sink aborts before acknowledging so the message is
    /// redelivered instead of lost.
    async fn dump_message(
        &mut self,
        queue: Option<&str>,
        payload: &[u8],
        err: BotError,
    ) -> Result<(), BotError> {
        self.state = BotState::Error;
        error!(
            bot_id = %self.bot_id,
            queue = ?queue,
            error_kind = err.kind(),
            error = %err,
            "Dumping failed message"
        );
        let record = DumpRecord::new(&self.bot_id, &err, queue, payload);
        self.dump.write(&record).await?;
        self.stats.dumped += 1;
        if let Some(queue) = queue {
            self.acknowledge(queue).await?;
        }
        Ok(())
    }
}
