//! Exit codes for CLI operations following Unix conventions.
//!
//! - `0`: Success
//! - `1`: General error
//! - `2`: Blocking error, automation should halt
//! - `3-125`: Specific recoverable errors

use crate::error::BuildError;
use crate::vector::VectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    BlockingError = 2,
    /// Command ran but found nothing (code 3)
    NotFound = 3,
    /// Dataset could not be read or parsed (code 4)
    InputError = 4,
    IoError = 5,
    ConfigError = 6,
    /// Imported or cached index failed verification (code 7)
    IndexCorrupted = 7,
    /// Another build of the same artifact is running (code 8)
    Busy = 8,
    Cancelled = 9,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}

impl ExitCode {
    /// `Success` when results were found, `NotFound` otherwise.
    pub fn from_results<T>(results: &[T]) -> Self {
        if results.is_empty() {
            ExitCode::NotFound
        } else {
            ExitCode::Success
        }
    }

    pub fn from_build_error(error: &BuildError) -> Self {
        match error {
            BuildError::Cancelled { .. } => ExitCode::Cancelled,
            BuildError::Busy { .. } => ExitCode::Busy,
            BuildError::Failed { .. } => ExitCode::BlockingError,
        }
    }

    pub fn from_vector_error(error: &VectorError) -> Self {
        match error {
            VectorError::IndexAbsent => ExitCode::NotFound,
            VectorError::IndexCorrupt { .. } | VectorError::VersionMismatch { .. } => {
                ExitCode::IndexCorrupted
            }
            VectorError::Storage(_) => ExitCode::IoError,
            VectorError::InvalidDimension { .. } => ExitCode::InputError,
            _ => ExitCode::GeneralError,
        }
    }
}
