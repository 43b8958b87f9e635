//! Loading the declarative harmonization schema document.
//!
//! The document maps field names to `{type, max_length?, description}`:
//!
//! ```yaml
//! fields:
//!   source.ip:
//!     type: IPAddress
//!     description: IP address of the source.
//!   source.geolocation.cc:
//!     type: String
//!     max_length: 2
//!     description: Country code.
//! ```
//!
//! JSON documents of the same shape are accepted too.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::{HarmonizationError, HarmonizationRegistry, RegistryBuilder};

const BUNDLED_SCHEMA: &str = include_str!("../../config/harmonization.yaml");

/// One field entry as written in the schema document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDecl {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, alias = "length", skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub description: String,
}

/// Parsed schema document, in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDocument {
    pub fields: IndexMap<String, FieldDecl>,
}

impl SchemaDocument {
    /// Parse a YAML (or JSON) schema document.
    pub fn from_yaml_str(contents: &str) -> Result<Self, HarmonizationError> {
        serde_yaml::from_str(contents)
            .map_err(|e| HarmonizationError::SchemaLoad(format!("Failed to parse schema: {}", e)))
    }

    /// Load a schema document from disk.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, HarmonizationError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            HarmonizationError::SchemaLoad(format!(
                "Failed to read schema file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// The schema shipped with the crate (`config/harmonization.yaml`).
    pub fn bundled() -> Result<Self, HarmonizationError> {
        Self::from_yaml_str(BUNDLED_SCHEMA)
    }

    /// Declare every field and freeze the result.
    pub fn into_registry(self) -> Result<HarmonizationRegistry, HarmonizationError> {
        let mut builder = RegistryBuilder::new();
        for (name, decl) in &self.fields {
            builder.register(name.clone(), decl)?;
        }
        Ok(builder.build())
    }
}
