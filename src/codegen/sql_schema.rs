//! PostgreSQL `events` table generation from the harmonization registry.
//!
//! Every declared field becomes one column named after the field, in name
//! order, behind a `BIGSERIAL` primary key.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::harmonization::{FieldSpec, HarmonizationRegistry, HarmonizationType};

/// Width used for text columns without a declared `max_length`.
pub const DEFAULT_VARCHAR_LENGTH: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Varchar(usize),
    Inet,
    TimestampTz,
    Boolean,
    Integer,
    Real,
    Uuid,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Varchar(length) => write!(f, "varchar({})", length),
            ColumnType::Inet => write!(f, "inet"),
            ColumnType::TimestampTz => write!(f, "timestamp with time zone"),
            ColumnType::Boolean => write!(f, "boolean"),
            ColumnType::Integer => write!(f, "integer"),
            ColumnType::Real => write!(f, "real"),
            ColumnType::Uuid => write!(f, "UUID"),
        }
    }
}

/// Storage column for one field, or `None` when the type has no dedicated
/// mapping and falls back to bounded text.
pub fn mapped_column_type(field: &FieldSpec) -> Option<ColumnType> {
    let column = match field.field_type {
        HarmonizationType::String
        | HarmonizationType::Base64
        | HarmonizationType::Url
        | HarmonizationType::Fqdn => {
            ColumnType::Varchar(field.max_length.unwrap_or(DEFAULT_VARCHAR_LENGTH))
        }
        HarmonizationType::IpAddress | HarmonizationType::IpNetwork => ColumnType::Inet,
        HarmonizationType::DateTime => ColumnType::TimestampTz,
        HarmonizationType::Boolean => ColumnType::Boolean,
        HarmonizationType::Integer => ColumnType::Integer,
        HarmonizationType::Float => ColumnType::Real,
        HarmonizationType::Uuid => ColumnType::Uuid,
        HarmonizationType::ClassificationType | HarmonizationType::JsonBlob => return None,
    };
    Some(column)
}

/// Column type for `field`, logging a warning on fallback.
pub fn column_type(field: &FieldSpec) -> ColumnType {
    mapped_column_type(field).unwrap_or_else(|| {
        tracing::warn!(
            field = %field.name,
            type_name = field.field_type.as_str(),
            "No column mapping for type, assuming varchar({})",
            DEFAULT_VARCHAR_LENGTH
        );
        ColumnType::Varchar(DEFAULT_VARCHAR_LENGTH)
    })
}

/// Generate the `CREATE table events` statement.
pub fn generate_schema(registry: &HarmonizationRegistry) -> String {
    let mut fields: Vec<&FieldSpec> = registry.fields().collect();
    fields.sort_by(|a, b| a.name.cmp(&b.name));

    let mut columns = vec!["    \"id\" BIGSERIAL UNIQUE PRIMARY KEY".to_string()];
    for field in fields {
        columns.push(format!("    \"{}\" {}", field.name, column_type(field)));
    }
    format!("CREATE table events (\n{}\n);\n", columns.join(",\n"))
}

/// Write the generated statement to `output_path`, creating parent
/// directories as needed.
pub fn write_schema(registry: &HarmonizationRegistry, output_path: &Path) -> std::io::Result<()> {
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(output_path, generate_schema(registry))?;
    tracing::info!("Wrote events table schema to {}", output_path.display());
    Ok(())
}
