//! Harmonization registry: the closed schema every stored field must obey.
//!
//! A registry is assembled once through [`RegistryBuilder`] and is
//! read-only afterwards; there is no mutating API on
//! [`HarmonizationRegistry`]. A process installs its registry with
//! [`install`] at startup and shares it as `Arc<HarmonizationRegistry>`.

pub mod schema;
pub mod types;
pub mod value;

use indexmap::IndexMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

pub use schema::{FieldDecl, SchemaDocument};
pub use types::{HarmonizationType, CLASSIFICATION_TYPES};
pub use value::FieldValue;

/// Error type for registry construction and field checks
#[derive(Debug, Clone, PartialEq)]
pub enum HarmonizationError {
    UnknownField(String),
    UnknownType {
        field: String,
        type_name: String,
    },
    DuplicateField(String),
    Sanitization {
        field: String,
        type_name: &'static str,
        raw: String,
        reason: String,
    },
    SchemaViolation {
        field: String,
        value: String,
    },
    SchemaLoad(String),
    AlreadyInstalled,
}

impl fmt::Display for HarmonizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarmonizationError::UnknownField(field) => write!(f, "Unknown field '{}'", field),
            HarmonizationError::UnknownType { field, type_name } => {
                write!(f, "Field '{}' declares unknown type '{}'", field, type_name)
            }
            HarmonizationError::DuplicateField(field) => {
                write!(f, "Field '{}' is already registered", field)
            }
            HarmonizationError::Sanitization { field, type_name, raw, reason } => write!(
                f,
                "Cannot sanitize '{}' for field '{}' ({}): {}",
                raw, field, type_name, reason
            ),
            HarmonizationError::SchemaViolation { field, value } => {
                write!(f, "Value '{}' is not valid for field '{}'", value, field)
            }
            HarmonizationError::SchemaLoad(msg) => write!(f, "Schema load error: {}", msg),
            HarmonizationError::AlreadyInstalled => {
                write!(f, "Harmonization registry is already installed")
            }
        }
    }
}

impl std::error::Error for HarmonizationError {}

/// Resolved declaration of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: HarmonizationType,
    pub max_length: Option<usize>,
    pub description: String,
}

impl FieldSpec {
    /// Enforce `max_length` on text values; non-text values always pass.
    pub fn within_length(&self, value: &FieldValue) -> bool {
        match (self.max_length, value) {
            (Some(max), FieldValue::String(s)) if self.field_type.is_text() => {
                s.chars().count() <= max
            }
            _ => true,
        }
    }
}

/// Collects field declarations before the registry is frozen.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    fields: IndexMap<String, FieldSpec>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field.
    ///
    /// Fails if `name` is already declared or the declared type is not one
    /// of the built-in types.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        decl: &FieldDecl,
    ) -> Result<&mut Self, HarmonizationError> {
        let name = name.into();
        if self.fields.contains_key(&name) {
            return Err(HarmonizationError::DuplicateField(name));
        }
        let field_type = decl.type_name.parse::<HarmonizationType>().map_err(|type_name| {
            HarmonizationError::UnknownType {
                field: name.clone(),
                type_name,
            }
        })?;

        self.fields.insert(
            name.clone(),
            FieldSpec {
                name,
                field_type,
                max_length: decl.max_length,
                description: decl.description.clone(),
            },
        );
        Ok(self)
    }

    pub fn build(self) -> HarmonizationRegistry {
        HarmonizationRegistry { fields: self.fields }
    }
}

/// Immutable mapping from field name to its declaration and type rules.
#[derive(Debug, Clone)]
pub struct HarmonizationRegistry {
    fields: IndexMap<String, FieldSpec>,
}

impl HarmonizationRegistry {
    /// Registry built from the schema document shipped with the crate.
    pub fn bundled() -> Result<Self, HarmonizationError> {
        SchemaDocument::bundled()?.into_registry()
    }

    pub fn lookup(&self, field: &str) -> Result<&FieldSpec, HarmonizationError> {
        self.fields
            .get(field)
            .ok_or_else(|| HarmonizationError::UnknownField(field.to_string()))
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Sanitize a raw value for `field`, producing its normalized form.
    pub fn sanitize(
        &self,
        field: &str,
        raw: &FieldValue,
    ) -> Result<FieldValue, HarmonizationError> {
        let spec = self.lookup(field)?;
        let field_type = spec.field_type;
        let sanitization_error = |reason: String| HarmonizationError::Sanitization {
            field: field.to_string(),
            type_name: field_type.as_str(),
            raw: raw.to_string(),
            reason,
        };

        let normalized = field_type.sanitize(raw).map_err(sanitization_error)?;
        if !spec.within_length(&normalized) {
            return Err(sanitization_error(format!(
                "longer than max_length {}",
                spec.max_length.unwrap_or_default()
            )));
        }
        Ok(normalized)
    }

    /// Check an already-normalized value against `field`'s declaration.
    pub fn validate(&self, field: &str, value: &FieldValue) -> Result<bool, HarmonizationError> {
        let spec = self.lookup(field)?;
        Ok(spec.field_type.validate(value) && spec.within_length(value))
    }

    /// Iterate declarations in document order.
    pub fn fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.values()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

static GLOBAL_REGISTRY: OnceLock<Arc<HarmonizationRegistry>> = OnceLock::new();

/// Install the process-wide registry. Succeeds exactly once per process.
pub fn install(
    registry: HarmonizationRegistry,
) -> Result<Arc<HarmonizationRegistry>, HarmonizationError> {
    let shared = Arc::new(registry);
    GLOBAL_REGISTRY
        .set(shared.clone())
        .map_err(|_| HarmonizationError::AlreadyInstalled)?;
    tracing::info!(fields = shared.len(), "Harmonization registry installed");
    Ok(shared)
}

/// The process-wide registry, if [`install`] has run.
pub fn global() -> Option<Arc<HarmonizationRegistry>> {
    GLOBAL_REGISTRY.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(type_name: &str, max_length: Option<usize>) -> FieldDecl {
        FieldDecl {
            type_name: type_name.to_string(),
            max_length,
            description: String::new(),
        }
    }

    #[test]
    fn test_register_rejects_duplicates_and_unknown_types() {
        let mut builder = RegistryBuilder::new();
        builder.register("source.ip", &decl("IPAddress", None)).unwrap();

        assert_eq!(
            builder.register("source.ip", &decl("String", None)).unwrap_err(),
            HarmonizationError::DuplicateField("source.ip".to_string())
        );
        assert!(matches!(
            builder.register("malware.name", &decl("MalwareName", None)),
            Err(HarmonizationError::UnknownType { .. })
        ));
    }

    #[test]
    fn test_lookup_unknown_field() {
        let registry = RegistryBuilder::new().build();
        assert_eq!(
            registry.lookup("nope").unwrap_err(),
            HarmonizationError::UnknownField("nope".to_string())
        );
    }

    #[test]
    fn test_sanitize_enforces_max_length() {
        let mut builder = RegistryBuilder::new();
        builder.register("source.geolocation.cc", &decl("String", Some(2))).unwrap();
        let registry = builder.build();

        assert_eq!(
            registry.sanitize("source.geolocation.cc", &FieldValue::from("AT")).unwrap(),
            FieldValue::from("AT")
        );
        assert!(matches!(
            registry.sanitize("source.geolocation.cc", &FieldValue::from("AUT")),
            Err(HarmonizationError::Sanitization { .. })
        ));
        assert!(!registry.validate("source.geolocation.cc", &FieldValue::from("AUT")).unwrap());
    }

    #[test]
    fn test_sanitization_error_names_field_and_type() {
        let registry = HarmonizationRegistry::bundled().unwrap();
        let err = registry.sanitize("source.ip", &FieldValue::from("999.1.1.1")).unwrap_err();
        match err {
            HarmonizationError::Sanitization { field, type_name, raw, .. } => {
                assert_eq!(field, "source.ip");
                assert_eq!(type_name, "IPAddress");
                assert_eq!(raw, "999.1.1.1");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_bundled_registry_declares_core_fields() {
        let registry = HarmonizationRegistry::bundled().unwrap();
        for field in ["raw", "source.ip", "time.observation", "feed.name", "classification.type"] {
            assert!(registry.contains(field), "missing {}", field);
        }
        assert_eq!(
            registry.lookup("raw").unwrap().field_type,
            HarmonizationType::Base64
        );
    }
}
