use async_trait::async_trait;
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::bot::{BotContext, BotError, Processor};
use crate::serialization::NdjsonWriter;

#[derive(Debug, Deserialize)]
struct FileOutputParams {
    file: PathBuf,
}

/// Appends every received message to a file, one wire envelope per line.
pub struct FileOutput {
    path: PathBuf,
    writer: NdjsonWriter<File>,
}

impl FileOutput {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BotError> {
        let path = path.as_ref().to_path_buf();
        let writer = NdjsonWriter::append_to(&path)
            .map_err(|e| BotError::Config(format!("Cannot open {}: {}", path.display(), e)))?;
        Ok(Self { path, writer })
    }

    pub fn from_parameters(parameters: &serde_json::Value) -> Result<Self, BotError> {
        let params: FileOutputParams = serde_json::from_value(parameters.clone())
            .map_err(|e| BotError::Config(format!("file parameters: {}", e)))?;
        Self::open(params.file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Processor for FileOutput {
    async fn process(&mut self, ctx: &mut BotContext) -> Result<(), BotError> {
        let line = ctx.receive_message()?.serialize()?;
        self.writer
            .write_raw(&line)
            .map_err(|e| BotError::transient(format!("{}: {}", self.path.display(), e)))?;
        ctx.acknowledge_message();
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), BotError> {
        self.writer
            .flush()
            .map_err(|e| BotError::transient(format!("{}: {}", self.path.display(), e)))
    }
}
