//! Vector storage, nearest-neighbor search, projection and clustering.
//!
//! # Architecture
//! [`VectorStore`] owns fixed-dimension vectors keyed by stable ids. The
//! other components read a store snapshot:
//! - [`AnnIndex`]: HNSW graph over cosine distance, built in chunks,
//!   exportable as a versioned blob.
//! - [`Projector`]: power-iteration PCA down to three axes in `[-1, 1]`.
//! - [`Clusterer`]: spherical K-means with K-means++ seeding.

mod ann;
mod clustering;
mod hnsw;
mod projection;
mod store;
mod types;

// Re-export core types for public API
pub use ann::{AnnIndex, BuiltIndex, INDEX_FORMAT_VERSION, IndexParams, SearchHit, build_chunked};
pub use clustering::{
    Clusterer, ClusteringError, DEFAULT_MAX_ITERS, DEFAULT_TOLERANCE, KMeansConfig, KMeansResult,
    assign_to_nearest_centroid, cosine_similarity, kmeans, suggest_k,
};
pub use hnsw::{HnswGraph, HnswParams};
pub use projection::{
    AXES, DEFAULT_ITERATIONS, ProjectedPoint, Projection, ProjectionMeta, Projector,
};
pub use store::{IngestReport, VectorStore};
pub use types::{FitOutcome, Score, VectorDimension, VectorError, fit_to_dimension};
