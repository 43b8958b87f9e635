//! Per-iteration view of the runtime handed to a [`Processor`](super::Processor).
//!
//! Messages passed to `send_message` are buffered here and only written to
//! the destination queues once processing returns successfully, so a failed
//! attempt never leaks partial output downstream.

use chrono::Utc;
use std::sync::Arc;

use super::BotError;
use crate::cache::Cache;
use crate::harmonization::HarmonizationRegistry;
use crate::message::{Message, MessageKind, Outcome};

pub struct BotContext {
    bot_id: String,
    registry: Arc<HarmonizationRegistry>,
    cache: Arc<dyn Cache>,
    parameters: serde_json::Value,
    received: Option<Message>,
    outbox: Vec<Message>,
    acknowledged: bool,
}

impl BotContext {
    pub fn new(
        bot_id: impl Into<String>,
        registry: Arc<HarmonizationRegistry>,
        cache: Arc<dyn Cache>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            bot_id: bot_id.into(),
            registry,
            cache,
            parameters,
            received: None,
            outbox: Vec::new(),
            acknowledged: false,
        }
    }

    /// Start an attempt on `message` (or none, for collectors).
    pub(crate) fn reset(&mut self, message: Option<Message>) {
        self.received = message;
        self.outbox.clear();
        self.acknowledged = false;
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn registry(&self) -> &Arc<HarmonizationRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    /// Free-form parameters from the bot's configuration.
    pub fn parameters(&self) -> &serde_json::Value {
        &self.parameters
    }

    /// The message being processed.
    pub fn receive_message(&self) -> Result<&Message, BotError> {
        self.received
            .as_ref()
            .ok_or_else(|| BotError::Other("No message received in this iteration".to_string()))
    }

    /// Take ownership of the received message, typically to mutate and forward it.
    pub fn take_message(&mut self) -> Result<Message, BotError> {
        self.received
            .take()
            .ok_or_else(|| BotError::Other("No message received in this iteration".to_string()))
    }

    /// Queue `message` for every destination queue.
    pub fn send_message(&mut self, message: Message) {
        self.outbox.push(message);
    }

    /// Mark the received message as done. The runtime acknowledges it after
    /// the outbox is delivered whether or not this was called.
    pub fn acknowledge_message(&mut self) {
        self.acknowledged = true;
    }

    pub fn acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn pending(&self) -> &[Message] {
        &self.outbox
    }

    /// New Report stamped with the current observation time.
    pub fn new_report(&self) -> Result<Message, BotError> {
        let mut report = Message::new_report(self.registry.clone());
        report.add("time.observation", Utc::now().to_rfc3339(), true)?;
        Ok(report)
    }

    /// New Event, carrying lineage when the received message is a Report.
    pub fn new_event(&self) -> Result<Message, BotError> {
        match &self.received {
            Some(message) if message.kind() == MessageKind::Report => Ok(message.derive_event()?),
            _ => Ok(Message::new_event(self.registry.clone())),
        }
    }

    /// Send an emitted message or log why an item was skipped.
    pub fn apply(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Emit(message) => self.send_message(message),
            Outcome::Skip(reason) => {
                tracing::debug!(bot_id = %self.bot_id, reason = %reason, "Skipped item");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn context() -> BotContext {
        BotContext::new(
            "test-bot",
            Arc::new(HarmonizationRegistry::bundled().unwrap()),
            Arc::new(MemoryCache::new()),
            serde_json::Value::Null,
        )
    }

    #[test]
    fn test_new_report_has_observation_time() {
        let report = context().new_report().unwrap();
        assert_eq!(report.kind(), MessageKind::Report);
        assert!(report.contains("time.observation"));
    }

    #[test]
    fn test_new_event_inherits_lineage_from_report() {
        let mut ctx = context();
        let mut report = ctx.new_report().unwrap();
        report.add("feed.name", "Turris Greylist", true).unwrap();
        ctx.reset(Some(report));

        let event = ctx.new_event().unwrap();
        assert_eq!(event.kind(), MessageKind::Event);
        assert_eq!(event.value("feed.name").unwrap().as_str(), Some("Turris Greylist"));
        assert!(event.contains("time.observation"));
    }

    #[test]
    fn test_apply_sends_emits_and_drops_skips() {
        let mut ctx = context();
        let event = ctx.new_event().unwrap();
        ctx.apply(Outcome::Emit(event));
        ctx.apply(Outcome::Skip("unknown indicator type".to_string()));
        assert_eq!(ctx.pending().len(), 1);
    }

    #[test]
    fn test_reset_clears_previous_attempt() {
        let mut ctx = context();
        let event = ctx.new_event().unwrap();
        ctx.send_message(event);
        ctx.acknowledge_message();
        ctx.reset(None);
        assert!(ctx.pending().is_empty());
        assert!(!ctx.acknowledged());
        assert!(ctx.receive_message().is_err());
    }
}
