/// Wire envelope for messages travelling through the pipeline
///
/// A message is a flat JSON object: the `__type` discriminator plus every
/// harmonized field under its full dotted name.
///
/// ```json
/// {"__type": "Event", "source.ip": "93.184.216.34", "raw": "OTMuMTg0..."}
/// ```

use std::sync::Arc;

use super::{Message, MessageError, MessageKind};
use crate::harmonization::{FieldValue, HarmonizationRegistry};

/// Key carrying the message kind.
pub const TYPE_KEY: &str = "__type";

impl Message {
    /// Encode as wire bytes.
    pub fn serialize(&self) -> Result<Vec<u8>, MessageError> {
        let mut object = serde_json::Map::with_capacity(self.len() + 1);
        object.insert(
            TYPE_KEY.to_string(),
            serde_json::Value::String(self.kind().as_str().to_string()),
        );
        for (field, value) in self.fields() {
            object.insert(field.clone(), value.to_json());
        }
        serde_json::to_vec(&serde_json::Value::Object(object))
            .map_err(|e| MessageError::Decode(format!("Failed to encode message: {}", e)))
    }

    /// Decode wire bytes, re-validating every field against `registry`.
    pub fn deserialize(
        bytes: &[u8],
        registry: Arc<HarmonizationRegistry>,
    ) -> Result<Message, MessageError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| MessageError::Decode(format!("Invalid JSON envelope: {}", e)))?;
        let serde_json::Value::Object(object) = value else {
            return Err(MessageError::Decode("Envelope is not a JSON object".to_string()));
        };

        let kind = match object.get(TYPE_KEY).and_then(|v| v.as_str()) {
            Some("Report") => MessageKind::Report,
            Some("Event") => MessageKind::Event,
            Some(other) => {
                return Err(MessageError::Decode(format!("Unknown message type '{}'", other)))
            }
            None => {
                return Err(MessageError::Decode(format!("Envelope is missing '{}'", TYPE_KEY)))
            }
        };

        let mut message = Message::new(kind, registry.clone());
        for (field, json) in object {
            if field == TYPE_KEY {
                continue;
            }
            let value = FieldValue::from_json(&json).ok_or_else(|| {
                MessageError::Decode(format!("Field '{}' has a non-scalar value", field))
            })?;
            let valid = registry
                .validate(&field, &value)
                .map_err(|e| MessageError::Decode(e.to_string()))?;
            if !valid {
                return Err(MessageError::Decode(format!(
                    "Field '{}' holds invalid value '{}'",
                    field, value
                )));
            }
            message.insert_validated(field, value);
        }
        Ok(message)
    }
}
