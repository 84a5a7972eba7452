//! Background builds of derived artifacts.
//!
//! The [`BuildCoordinator`] owns the published index and projection,
//! serializes rebuilds per target and reports progress through
//! [`BuildHandle`]s.

mod cache;
mod coordinator;
mod handle;
mod progress;

pub use cache::{ArtifactCache, CacheError, CacheKey, FileCache, MemoryCache};
pub use coordinator::BuildCoordinator;
pub use handle::{BuildHandle, BuildOptions, ConflictPolicy, ExecutionMode};
pub use progress::{
    BuildContext, BuildPhase, BuildState, BuildStats, BuildTarget, ProgressEvent,
};
