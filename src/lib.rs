//! # intelflow: threat-intelligence feed pipeline
//!
//! Feeds flow through a chain of independent bots connected by named queues.
//! Collectors produce raw `Report`s, parsers turn them into harmonized
//! `Event`s, experts enrich events and outputs persist them.
//!
//! ## Features
//!
//! - **Harmonization registry**: every field name has one declared type that
//!   sanitizes and validates its values (`config/harmonization.yaml`)
//! - **Message model**: `Report`/`Event` with checked field access and a JSON
//!   wire envelope
//! - **Pipeline**: at-least-once queues, in-process or NATS JetStream
//! - **Bot runtime**: retry with exponential backoff, dump-on-failure and
//!   content-hash deduplication around a pluggable `Processor`
//! - **Cache**: TTL key/value store, in-process or JetStream key/value
//!
//! ## Example: deployment
//!
//! ```yaml
//! pipeline:
//!   backend: nats
//! bots:
//!   turris-parser:
//!     module: csv-columns
//!     source_queue: turris-parser-queue
//!     destination_queues: [file-output-queue]
//!     parameters:
//!       columns: [source.ip, __IGNORE__, event_description.text, __IGNORE__]
//!       classification_type: scanner
//!   file-output:
//!     module: file
//!     source_queue: file-output-queue
//!     parameters:
//!       file: var/events.ndjson
//! ```

// Core modules
pub mod harmonization;
pub mod message;
pub mod serialization;

// Transport and shared state
pub mod cache;
pub mod pipeline;

// Bot runtime and reference bots
pub mod bot;
pub mod bots;
pub mod config;

// HTTP collector
pub mod ingest;

// Storage schema generation
pub mod codegen;

pub use bot::{BotContext, BotError, BotRuntime, BotState, Processor, RetryPolicy, RunStats};
pub use cache::{Cache, CacheError, MemoryCache};
pub use config::{BotConfig, RuntimeConfig};
pub use harmonization::{FieldValue, HarmonizationError, HarmonizationRegistry, HarmonizationType};
pub use message::{Message, MessageError, MessageKind, Outcome};
pub use pipeline::{MemoryBroker, Pipeline, PipelineConfig, PipelineError};
