//! Dataset files and process exit codes for the CLI.

pub mod dataset;
pub mod exit_code;

pub use dataset::{DatasetError, Record, load_store, read_records};
pub use exit_code::ExitCode;
