//! Bot execution: one processing capability driven by a fixed runtime.
//!
//! A bot is a [`Processor`] plus the [`BotRuntime`] that feeds it: receive a
//! message, skip it if deduplication has seen it, process it (retrying
//! transient failures with backoff), deliver its output, acknowledge. A
//! message that fails permanently is written to the dump sink and then
//! acknowledged so it cannot block its queue.

pub mod context;
pub mod dedup;
pub mod dump;
pub mod error;
pub mod retry;
pub mod runtime;

use async_trait::async_trait;
use std::fmt;

pub use context::BotContext;
pub use dedup::{fingerprint, DedupConfig, DedupScope, Deduplicator};
pub use dump::{read_dump_file, DumpRecord, DumpSink, DumpTarget, FileDump, QueueDump};
pub use error::BotError;
pub use retry::RetryPolicy;
pub use runtime::{BotRuntime, IterationOutcome, RunStats};

/// The processing capability a bot supplies.
#[async_trait]
pub trait Processor: Send {
    /// Handle the current message (if any) in `ctx`.
    ///
    /// Messages go out through [`BotContext::send_message`]. Returning an
    /// error discards everything sent during this call.
    async fn process(&mut self, ctx: &mut BotContext) -> Result<(), BotError>;

    /// Called once when the runtime stops.
    async fn shutdown(&mut self) -> Result<(), BotError> {
        Ok(())
    }
}

/// Runtime states, reported through [`BotRuntime::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotState {
    Init,
    Running,
    Receiving,
    Processing,
    Sending,
    Acknowledging,
    Error,
    Shutdown,
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BotState::Init => "INIT",
            BotState::Running => "RUNNING",
            BotState::Receiving => "RECEIVING",
            BotState::Processing => "PROCESSING",
            BotState::Sending => "SENDING",
            BotState::Acknowledging => "ACKNOWLEDGING",
            BotState::Error => "ERROR",
            BotState::Shutdown => "SHUTDOWN",
        };
        write!(f, "{}", name)
    }
}
