//! Error types for build coordination
//!
//! Errors local to one vector or one query are absorbed by the vector layer.
//! The errors here describe whole builds: they are surfaced to the caller
//! that started the build and never affect readers of an already published
//! artifact.

use thiserror::Error;

use crate::build::{BuildPhase, BuildTarget};

/// Terminal error of a build job
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("The {target} build was cancelled")]
    Cancelled { target: BuildTarget },

    #[error("The {target} build failed during {phase}: {message}")]
    Failed {
        target: BuildTarget,
        phase: BuildPhase,
        message: String,
    },

    #[error(
        "A {target} build is already running\nSuggestion: Wait for it to finish or rebuild with the 'replace' policy"
    )]
    Busy { target: BuildTarget },
}

impl BuildError {
    pub fn target(&self) -> BuildTarget {
        match self {
            Self::Cancelled { target } | Self::Failed { target, .. } | Self::Busy { target } => {
                *target
            }
        }
    }

    /// Get a status code for this error
    pub fn status_code(&self) -> String {
        match self {
            Self::Cancelled { .. } => "BUILD_CANCELLED",
            Self::Failed { .. } => "BUILD_FAILED",
            Self::Busy { .. } => "BUILD_BUSY",
        }
        .to_string()
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::Cancelled { .. } => vec![
                "The previously published artifact, if any, is still in use",
                "Start the build again when ready",
            ],
            Self::Failed { .. } => vec![
                "The previously published artifact, if any, is still in use",
                "Check the input vectors for degenerate data and retry",
                "Run with RUST_LOG=debug for phase-level details",
            ],
            Self::Busy { .. } => vec![
                "Wait for the running build to finish",
                "Use the 'queue' policy to wait automatically",
                "Use the 'replace' policy to cancel the running build",
            ],
        }
    }

    /// Message with status code and recovery suggestions, as printed by the CLI.
    pub fn report(&self) -> String {
        let mut report = format!("Error [{}]: {self}", self.status_code());
        let suggestions = self.recovery_suggestions();
        if !suggestions.is_empty() {
            report.push_str("\n\nSuggestions:");
            for suggestion in suggestions {
                report.push_str("\n  • ");
                report.push_str(suggestion);
            }
        }
        report
    }
}

/// Result type alias for build operations
pub type BuildResult<T> = Result<T, BuildError>;
