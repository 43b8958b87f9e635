pub mod file;

pub use file::FileOutput;
