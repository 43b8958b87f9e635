//! Artifacts derived from the harmonization schema.

pub mod sql_schema;

pub use sql_schema::{column_type, generate_schema, write_schema, ColumnType};
