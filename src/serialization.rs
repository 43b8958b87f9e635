/// Newline-delimited JSON files
///
/// Shared by the file output and the dump sink: one JSON document per line,
/// appended and flushed record by record so a crash loses at most the line
/// being written.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

/// Error type for serialization operations
#[derive(Debug)]
pub enum SerializationError {
    Io(std::io::Error),
    Json(serde_json::Error),
    /// A line of an NDJSON file that is not a valid record.
    BadLine { line: usize, reason: String },
}

impl std::fmt::Display for SerializationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerializationError::Io(e) => write!(f, "I/O error: {}", e),
            SerializationError::Json(e) => write!(f, "JSON error: {}", e),
            SerializationError::BadLine { line, reason } => {
                write!(f, "Invalid record on line {}: {}", line, reason)
            }
        }
    }
}

impl std::error::Error for SerializationError {}

impl From<std::io::Error> for SerializationError {
    fn from(err: std::io::Error) -> Self {
        SerializationError::Io(err)
    }
}

impl From<serde_json::Error> for SerializationError {
    fn from(err: serde_json::Error) -> Self {
        SerializationError::Json(err)
    }
}

/// NDJSON writer
pub struct NdjsonWriter<W: Write> {
    writer: W,
}

impl NdjsonWriter<File> {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn append_to<P: AsRef<Path>>(path: P) -> Result<Self, SerializationError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write> NdjsonWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one record as a line and flush it.
    pub fn write<T: Serialize + ?Sized>(&mut self, record: &T) -> Result<(), SerializationError> {
        let json = serde_json::to_string(record)?;
        writeln!(self.writer, "{}", json)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Write an already-encoded JSON document as a line.
    pub fn write_raw(&mut self, json: &[u8]) -> Result<(), SerializationError> {
        self.writer.write_all(json)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SerializationError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Read every record of an NDJSON file, skipping blank lines.
pub fn read_ndjson<T: DeserializeOwned, P: AsRef<Path>>(
    path: P,
) -> Result<Vec<T>, SerializationError> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| SerializationError::BadLine {
            line: index + 1,
            reason: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}
