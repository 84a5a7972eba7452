//! In-process vector analysis pipeline.
//!
//! A [`VectorStore`] holds normalized-length embeddings keyed by id. Three
//! derived artifacts are computed from it: an approximate nearest-neighbor
//! index ([`AnnIndex`]), a 3-D principal-component projection
//! ([`Projector`]) and cosine K-Means clusters ([`Clusterer`]). The
//! [`BuildCoordinator`] runs the expensive builds off the caller's thread,
//! single-flighted per artifact, cancellable and cached.

pub mod build;
pub mod config;
pub mod display;
pub mod error;
pub mod io;
pub mod logging;
pub mod vector;

// Explicit exports for better API clarity
pub use build::{
    ArtifactCache, BuildCoordinator, BuildHandle, BuildOptions, BuildPhase, BuildState,
    BuildStats, BuildTarget, ConflictPolicy, ExecutionMode, FileCache, MemoryCache, ProgressEvent,
};
pub use config::Settings;
pub use error::{BuildError, BuildResult};
pub use vector::{
    AnnIndex, Clusterer, ClusteringError, IngestReport, KMeansConfig, KMeansResult, Projection,
    Projector, Score, SearchHit, VectorError, VectorStore,
};
