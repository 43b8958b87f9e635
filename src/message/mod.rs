//! Harmonized messages: raw `Report`s and normalized `Event`s.
//!
//! Every value stored in a [`Message`] has passed its field's validation
//! rule in the [`HarmonizationRegistry`]; there is no way to insert an
//! unchecked value. The `raw` field holds the original payload and cannot
//! be changed or removed once set.

pub mod envelope;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::harmonization::{FieldValue, HarmonizationError, HarmonizationRegistry};

/// Name of the field holding the original payload.
pub const RAW_FIELD: &str = "raw";

/// Fields copied from a Report into every Event derived from it.
pub const LINEAGE_FIELDS: &[&str] = &[
    "feed.accuracy",
    "feed.code",
    "feed.documentation",
    "feed.name",
    "feed.provider",
    "feed.url",
    "rtir_id",
    "time.observation",
];

/// Error type for message operations
#[derive(Debug, Clone, PartialEq)]
pub enum MessageError {
    UnknownField(String),
    SchemaViolation {
        field: String,
        value: String,
    },
    Sanitization {
        field: String,
        type_name: &'static str,
        raw: String,
        reason: String,
    },
    MissingField(String),
    KeyExists(String),
    ImmutableField(String),
    NotAReport,
    Decode(String),
    Harmonization(HarmonizationError),
}

impl MessageError {
    /// Whether the error stems from the schema (unknown field, invalid or
    /// unsanitizable value) rather than from message state.
    pub fn is_schema_violation(&self) -> bool {
        matches!(
            self,
            MessageError::UnknownField(_)
                | MessageError::SchemaViolation { .. }
                | MessageError::Sanitization { .. }
        )
    }
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::UnknownField(field) => write!(f, "Unknown field '{}'", field),
            MessageError::SchemaViolation { field, value } => {
                write!(f, "Schema violation: '{}' is not valid for field '{}'", value, field)
            }
            MessageError::Sanitization { field, type_name, raw, reason } => write!(
                f,
                "Sanitization failed for field '{}' ({}), input '{}': {}",
                field, type_name, raw, reason
            ),
            MessageError::MissingField(field) => write!(f, "Field '{}' is not present", field),
            MessageError::KeyExists(field) => write!(f, "Field '{}' is already set", field),
            MessageError::ImmutableField(field) => write!(f, "Field '{}' is immutable", field),
            MessageError::NotAReport => write!(f, "Events can only be derived from a Report"),
            MessageError::Decode(msg) => write!(f, "Message decode error: {}", msg),
            MessageError::Harmonization(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for MessageError {}

impl From<HarmonizationError> for MessageError {
    fn from(err: HarmonizationError) -> Self {
        match err {
            HarmonizationError::UnknownField(field) => MessageError::UnknownField(field),
            HarmonizationError::SchemaViolation { field, value } => {
                MessageError::SchemaViolation { field, value }
            }
            HarmonizationError::Sanitization { field, type_name, raw, reason } => {
                MessageError::Sanitization { field, type_name, raw, reason }
            }
            other => MessageError::Harmonization(other),
        }
    }
}

/// Discriminates the two message kinds; fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Report,
    Event,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Report => "Report",
            MessageKind::Event => "Event",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of handling one item inside a processor loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Forward this message to the bot's destinations.
    Emit(Message),
    /// Item was not actionable; the reason is logged.
    Skip(String),
}

/// A harmonized record.
#[derive(Clone)]
pub struct Message {
    kind: MessageKind,
    fields: BTreeMap<String, FieldValue>,
    registry: Arc<HarmonizationRegistry>,
}

impl Message {
    pub fn new(kind: MessageKind, registry: Arc<HarmonizationRegistry>) -> Self {
        Self {
            kind,
            fields: BTreeMap::new(),
            registry,
        }
    }

    pub fn new_report(registry: Arc<HarmonizationRegistry>) -> Self {
        Self::new(MessageKind::Report, registry)
    }

    pub fn new_event(registry: Arc<HarmonizationRegistry>) -> Self {
        Self::new(MessageKind::Event, registry)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn registry(&self) -> &Arc<HarmonizationRegistry> {
        &self.registry
    }

    /// Add a new field.
    ///
    /// With `sanitize` the input is normalized by the field's type before
    /// validation; without it the caller vouches the value is already
    /// normalized and only validation runs. Fails if the field is already
    /// present.
    pub fn add(
        &mut self,
        field: &str,
        value: impl Into<FieldValue>,
        sanitize: bool,
    ) -> Result<(), MessageError> {
        if self.fields.contains_key(field) {
            if field == RAW_FIELD {
                return Err(MessageError::ImmutableField(field.to_string()));
            }
            return Err(MessageError::KeyExists(field.to_string()));
        }
        let normalized = self.normalize(field, value.into(), sanitize)?;
        self.fields.insert(field.to_string(), normalized);
        Ok(())
    }

    /// Replace the value of a field that is already present.
    pub fn change(
        &mut self,
        field: &str,
        value: impl Into<FieldValue>,
        sanitize: bool,
    ) -> Result<(), MessageError> {
        if field == RAW_FIELD {
            return Err(MessageError::ImmutableField(field.to_string()));
        }
        if !self.fields.contains_key(field) {
            return Err(MessageError::MissingField(field.to_string()));
        }
        let normalized = self.normalize(field, value.into(), sanitize)?;
        self.fields.insert(field.to_string(), normalized);
        Ok(())
    }

    pub fn remove(&mut self, field: &str) -> Result<FieldValue, MessageError> {
        if field == RAW_FIELD {
            return Err(MessageError::ImmutableField(field.to_string()));
        }
        self.fields
            .remove(field)
            .ok_or_else(|| MessageError::MissingField(field.to_string()))
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn value(&self, field: &str) -> Result<&FieldValue, MessageError> {
        self.fields
            .get(field)
            .ok_or_else(|| MessageError::MissingField(field.to_string()))
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Decoded text of the `raw` payload, if present.
    pub fn raw_text(&self) -> Result<Option<String>, MessageError> {
        let Some(encoded) = self.fields.get(RAW_FIELD) else {
            return Ok(None);
        };
        let encoded = encoded.as_str().ok_or_else(|| MessageError::SchemaViolation {
            field: RAW_FIELD.to_string(),
            value: encoded.to_string(),
        })?;
        let bytes = BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| MessageError::Decode(format!("raw is not base64: {}", e)))?;
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Create an Event carrying this Report's lineage fields.
    ///
    /// The result shares no state with the Report.
    pub fn derive_event(&self) -> Result<Message, MessageError> {
        if self.kind != MessageKind::Report {
            return Err(MessageError::NotAReport);
        }
        let mut event = Message::new_event(self.registry.clone());
        for field in LINEAGE_FIELDS {
            if let Some(value) = self.fields.get(*field) {
                if self.registry.contains(field) {
                    event.fields.insert((*field).to_string(), value.clone());
                }
            }
        }
        Ok(event)
    }

    fn normalize(
        &self,
        field: &str,
        value: FieldValue,
        sanitize: bool,
    ) -> Result<FieldValue, MessageError> {
        let value = if sanitize {
            self.registry.sanitize(field, &value)?
        } else {
            value
        };
        if !self.registry.validate(field, &value)? {
            return Err(MessageError::SchemaViolation {
                field: field.to_string(),
                value: value.to_string(),
            });
        }
        Ok(value)
    }

    /// Insert a value that has already passed validation (decoder use).
    pub(crate) fn insert_validated(&mut self, field: String, value: FieldValue) {
        self.fields.insert(field, value);
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.fields == other.fields
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("fields", &self.fields)
            .finish()
    }
}
