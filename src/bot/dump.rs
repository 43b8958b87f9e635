//! Side channel for permanently failed messages.
//!
//! Each record keeps the original payload next to the error that sank it,
//! so it can be inspected and replayed by hand.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::BotError;
use crate::pipeline::Pipeline;
use crate::serialization::{read_ndjson, NdjsonWriter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpRecord {
    pub bot_id: String,
    pub timestamp: DateTime<Utc>,
    pub error_kind: String,
    pub error_message: String,
    pub source_queue: Option<String>,
    /// Payload as received when it is valid UTF-8, empty otherwise.
    pub payload: String,
    /// Base64 of the payload bytes when they are not valid UTF-8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_base64: Option<String>,
}

impl DumpRecord {
    pub fn new(
        bot_id: &str,
        error: &BotError,
        source_queue: Option<&str>,
        payload: &[u8],
    ) -> Self {
        let (payload, payload_base64) = match std::str::from_utf8(payload) {
            Ok(text) => (text.to_string(), None),
            Err(_) => (String::new(), Some(BASE64.encode(payload))),
        };
        Self {
            bot_id: bot_id.to_string(),
            timestamp: Utc::now(),
            error_kind: error.kind().to_string(),
            error_message: error.to_string(),
            source_queue: source_queue.map(str::to_string),
            payload,
            payload_base64,
        }
    }

    /// The original payload bytes, for replay.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, BotError> {
        match &self.payload_base64 {
            Some(encoded) => BASE64
                .decode(encoded)
                .map_err(|e| BotError::Dump(format!("Corrupt payload_base64: {}", e))),
            None => Ok(self.payload.clone().into_bytes()),
        }
    }
}

/// Where a bot writes its dump records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DumpTarget {
    /// `{directory}/{bot_id}.dump.ndjson`
    File { directory: PathBuf },
    /// JSON records sent to an error queue.
    Queue { queue: String },
}

#[async_trait]
pub trait DumpSink: Send {
    async fn write(&mut self, record: &DumpRecord) -> Result<(), BotError>;
}

pub fn dump_file_path(directory: &Path, bot_id: &str) -> PathBuf {
    directory.join(format!("{}.dump.ndjson", bot_id))
}

/// Appends records to a per-bot NDJSON file.
pub struct FileDump {
    path: PathBuf,
}

impl FileDump {
    pub fn new(directory: &Path, bot_id: &str) -> Self {
        Self {
            path: dump_file_path(directory, bot_id),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DumpSink for FileDump {
    async fn write(&mut self, record: &DumpRecord) -> Result<(), BotError> {
        let mut writer = NdjsonWriter::append_to(&self.path)
            .map_err(|e| BotError::Dump(format!("{}: {}", self.path.display(), e)))?;
        writer
            .write(record)
            .map_err(|e| BotError::Dump(format!("{}: {}", self.path.display(), e)))
    }
}

/// Sends records to an error queue through its own pipeline connection.
pub struct QueueDump {
    pipeline: Box<dyn Pipeline>,
    queues: Vec<String>,
}

impl QueueDump {
    pub fn new(pipeline: Box<dyn Pipeline>, queue: impl Into<String>) -> Self {
        Self {
            pipeline,
            queues: vec![queue.into()],
        }
    }
}

#[async_trait]
impl DumpSink for QueueDump {
    async fn write(&mut self, record: &DumpRecord) -> Result<(), BotError> {
        let payload = serde_json::to_vec(record).map_err(|e| BotError::Dump(e.to_string()))?;
        self.pipeline
            .send(&self.queues, &payload)
            .await
            .map_err(|e| BotError::Dump(e.to_string()))
    }
}

/// Load every record of a dump file.
pub fn read_dump_file<P: AsRef<Path>>(path: P) -> Result<Vec<DumpRecord>, BotError> {
    let path = path.as_ref();
    read_ndjson(path).map_err(|e| BotError::Dump(format!("{}: {}", path.display(), e)))
}
