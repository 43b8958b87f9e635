pub mod lookup;

pub use lookup::{FieldMapping, Lookup, LookupExpert, TableLookup};
