//! Parsers expanding Reports into Events.

pub mod csv_columns;
pub mod otx;

pub use csv_columns::CsvColumnsParser;
pub use otx::OtxParser;
