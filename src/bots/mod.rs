//! Reference bots and the wiring that turns a configured bot into a runtime.
//!
//! | module        | kind   | parameters                                   |
//! |---------------|--------|----------------------------------------------|
//! | `csv-columns` | parser | `columns`, `classification_type`, `skip_header`, `delimiter` |
//! | `otx`         | parser | none                                         |
//! | `lookup`      | expert | `mappings`, `table`, `ttl_secs`, `overwrite` |
//! | `file`        | output | `file`                                       |

pub mod experts;
pub mod outputs;
pub mod parsers;

use std::sync::Arc;

use crate::bot::{BotError, BotRuntime, DumpSink, DumpTarget, FileDump, Processor, QueueDump};
use crate::cache::{self, MemoryCache};
use crate::config::RuntimeConfig;
use crate::harmonization::HarmonizationRegistry;
use crate::pipeline::{self, MemoryBroker};

pub use experts::LookupExpert;
pub use outputs::FileOutput;
pub use parsers::{CsvColumnsParser, OtxParser};

/// Module names accepted by [`build_processor`].
pub const MODULES: &[&str] = &["csv-columns", "otx", "lookup", "file"];

pub fn build_processor(
    module: &str,
    parameters: &serde_json::Value,
) -> Result<Box<dyn Processor>, BotError> {
    match module {
        "csv-columns" => Ok(Box::new(CsvColumnsParser::from_parameters(parameters)?)),
        "otx" => Ok(Box::new(OtxParser)),
        "lookup" => Ok(Box::new(LookupExpert::from_parameters(parameters)?)),
        "file" => Ok(Box::new(FileOutput::from_parameters(parameters)?)),
        other => Err(BotError::Config(format!(
            "Unknown bot module '{}' (expected one of {})",
            other,
            MODULES.join(", ")
        ))),
    }
}

/// Assemble the runtime for `bot_id`: processor, pipeline, cache and dump sink.
///
/// `broker` and `local_cache` are the process-wide in-memory backends; they
/// are only consulted when the configuration selects the memory backends.
pub async fn build_runtime(
    config: &RuntimeConfig,
    bot_id: &str,
    registry: Arc<HarmonizationRegistry>,
    broker: Option<&MemoryBroker>,
    local_cache: Option<&MemoryCache>,
) -> Result<BotRuntime, BotError> {
    let bot = config.bot(bot_id)?;
    let processor = build_processor(&bot.module, &bot.parameters)?;
    let pipeline = pipeline::connect(&config.pipeline, bot_id, broker).await?;
    let cache = cache::connect(&config.cache, local_cache).await?;

    let dump: Box<dyn DumpSink> = match config.dump_target(bot_id) {
        DumpTarget::File { directory } => Box::new(FileDump::new(&directory, bot_id)),
        DumpTarget::Queue { queue } => {
            let dump_pipeline =
                pipeline::connect(&config.pipeline, &format!("{}.dump", bot_id), broker).await?;
            Box::new(QueueDump::new(dump_pipeline, queue))
        }
    };

    tracing::debug!(bot_id, module = %bot.module, "Bot assembled");
    Ok(BotRuntime::new(
        bot_id,
        bot.clone(),
        registry,
        processor,
        pipeline,
        cache,
        dump,
    ))
}
