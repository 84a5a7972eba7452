//! Spherical K-means clustering for spatial layout.
//!
//! Vectors are normalized up front and centroids are kept on the unit sphere,
//! so cosine distance (`1 - cos`) is the only metric. Seeding uses K-means++.
//!
//! # Algorithm Details
//! - Distance metric: Cosine distance
//! - Initialization: K-means++ (squared cosine distance weighting)
//! - Update: normalized mean of the assigned unit vectors
//! - Stops when assignments stop changing, the mean centroid movement drops
//!   below the tolerance, or `max_iters` is reached
//!
//! Both steps can only lower the total within-cluster distance, so
//! [`KMeansResult::inertia_history`] is non-increasing.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;

use super::store::VectorStore;
use crate::build::{BuildContext, BuildPhase, BuildTarget};
use crate::error::BuildError;

/// Default maximum number of assignment/update rounds.
pub const DEFAULT_MAX_ITERS: usize = 100;

/// Default convergence tolerance on mean centroid movement.
pub const DEFAULT_TOLERANCE: f32 = 1e-4;

/// Epsilon for floating-point comparisons.
const EPSILON: f32 = 1e-10;

/// Result of a K-means run.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// Cluster index in `[0, k)` for each input vector.
    pub labels: Vec<usize>,

    /// Unit-length centroids, one per cluster.
    pub centroids: Vec<Vec<f32>>,

    /// Number of assignment rounds performed.
    pub iterations: usize,

    /// Whether a stopping criterion fired before `max_iters`.
    pub converged: bool,

    /// Total within-cluster cosine distance of the final labels.
    pub inertia: f32,

    /// Inertia after every assignment round.
    pub inertia_history: Vec<f32>,
}

impl KMeansResult {
    pub fn k(&self) -> usize {
        self.centroids.len()
    }

    /// Number of vectors per cluster.
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0usize; self.k()];
        for &label in &self.labels {
            sizes[label] += 1;
        }
        sizes
    }
}

/// Errors that can occur during clustering operations.
#[derive(Error, Debug)]
pub enum ClusteringError {
    #[error(
        "Empty vector set provided for clustering\nSuggestion: Ingest vectors or select a non-empty subset before clustering"
    )]
    EmptyVectorSet,

    #[error("Invalid cluster count: {0}\nSuggestion: Use k between 1 and the number of vectors")]
    InvalidClusterCount(usize),

    #[error(
        "Dimension mismatch in vectors\nSuggestion: Cluster vectors taken from a single store"
    )]
    DimensionMismatch,

    #[error(
        "Failed to initialize centroids\nSuggestion: Check that vectors contain valid floating-point values"
    )]
    InitializationFailed,

    #[error("{0}")]
    Interrupted(#[from] BuildError),
}

/// Stopping criteria and cluster count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KMeansConfig {
    /// Cluster count; [`suggest_k`] is used when absent.
    pub k: Option<usize>,
    pub max_iters: usize,
    pub tolerance: f32,
    /// Fixes seeding; random when absent.
    pub seed: Option<u64>,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            k: None,
            max_iters: DEFAULT_MAX_ITERS,
            tolerance: DEFAULT_TOLERANCE,
            seed: None,
        }
    }
}

impl KMeansConfig {
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
}

/// Suggested cluster count for `n` vectors: `sqrt(n / 2)` bounded to [3, 24].
pub fn suggest_k(n: usize) -> usize {
    ((n as f64 / 2.0).sqrt().round() as usize).clamp(3, 24)
}

/// Clusters `vectors` into `k` groups with a random seed.
pub fn kmeans<V>(
    vectors: &[V],
    k: usize,
    max_iters: usize,
    tolerance: f32,
) -> Result<KMeansResult, ClusteringError>
where
    V: AsRef<[f32]> + Sync,
{
    let config = KMeansConfig::default()
        .with_k(k)
        .with_max_iters(max_iters)
        .with_tolerance(tolerance);
    Clusterer::new(config).cluster(vectors)
}

/// K-means runner bound to one configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Clusterer {
    config: KMeansConfig,
}

impl Clusterer {
    pub fn new(config: KMeansConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KMeansConfig {
        &self.config
    }

    /// Clusters `vectors` synchronously.
    #[must_use = "clustering results should be used or the computation is wasted"]
    pub fn cluster<V>(&self, vectors: &[V]) -> Result<KMeansResult, ClusteringError>
    where
        V: AsRef<[f32]> + Sync,
    {
        self.cluster_with(vectors, &BuildContext::detached(BuildTarget::Clustering))
    }

    /// Clusters every vector of `store` in insertion order.
    pub fn cluster_store(
        &self,
        store: &VectorStore,
        ctx: &BuildContext,
    ) -> Result<KMeansResult, ClusteringError> {
        let vectors: Vec<&[f32]> = store.iter().map(|(_, v)| v).collect();
        self.cluster_with(&vectors, ctx)
    }

    /// Clusters under `ctx`, checking for cancellation between seeds and
    /// between iterations.
    pub fn cluster_with<V>(
        &self,
        vectors: &[V],
        ctx: &BuildContext,
    ) -> Result<KMeansResult, ClusteringError>
    where
        V: AsRef<[f32]> + Sync,
    {
        if vectors.is_empty() {
            return Err(ClusteringError::EmptyVectorSet);
        }
        let n = vectors.len();
        let k = self.config.k.unwrap_or_else(|| suggest_k(n).min(n));
        if k == 0 || k > n {
            return Err(ClusteringError::InvalidClusterCount(k));
        }

        let dimension = vectors[0].as_ref().len();
        if vectors.iter().any(|v| v.as_ref().len() != dimension) {
            return Err(ClusteringError::DimensionMismatch);
        }
        let points: Vec<Vec<f32>> = vectors
            .iter()
            .map(|v| normalize_vector_copy(v.as_ref()))
            .collect();

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let mut centroids = initialize_centroids_kmeans_plus_plus(&points, k, &mut rng, ctx)?;
        let mut labels = assign_all(&points, &centroids);
        let mut inertia_history = vec![total_inertia(&points, &labels, &centroids)];
        let mut iterations = 1;
        let mut converged = false;
        ctx.report(BuildPhase::Iterate, iterations, self.config.max_iters.max(1));

        while iterations < self.config.max_iters {
            ctx.checkpoint()?;

            let new_centroids = update_centroids(&points, &labels, &centroids);
            let movement = calculate_centroid_movement(&centroids, &new_centroids);
            centroids = new_centroids;

            let new_labels = assign_all(&points, &centroids);
            let unchanged = new_labels == labels;
            labels = new_labels;
            iterations += 1;
            inertia_history.push(total_inertia(&points, &labels, &centroids));
            ctx.report(BuildPhase::Iterate, iterations, self.config.max_iters);

            if unchanged || movement < self.config.tolerance {
                converged = true;
                break;
            }
        }

        if !converged {
            tracing::debug!(
                max_iters = self.config.max_iters,
                "K-means stopped at the iteration limit"
            );
        }

        if repair_empty_clusters(&points, &mut labels, &mut centroids) {
            inertia_history.push(total_inertia(&points, &labels, &centroids));
        }
        let inertia = inertia_history.last().copied().unwrap_or_default();

        Ok(KMeansResult {
            labels,
            centroids,
            iterations,
            converged,
            inertia,
            inertia_history,
        })
    }
}

/// Index of the most similar centroid by cosine similarity.
pub fn assign_to_nearest_centroid<C: AsRef<[f32]>>(vector: &[f32], centroids: &[C]) -> usize {
    let mut best_similarity = f32::NEG_INFINITY;
    let mut best_cluster = 0;

    for (i, centroid) in centroids.iter().enumerate() {
        let similarity = cosine_similarity(vector, centroid.as_ref());
        if similarity > best_similarity {
            best_similarity = similarity;
            best_cluster = i;
        }
    }
    best_cluster
}

fn assign_all(points: &[Vec<f32>], centroids: &[Vec<f32>]) -> Vec<usize> {
    points
        .par_iter()
        .map(|p| assign_to_nearest_centroid(p, centroids))
        .collect()
}

fn total_inertia(points: &[Vec<f32>], labels: &[usize], centroids: &[Vec<f32>]) -> f32 {
    points
        .iter()
        .zip(labels)
        .map(|(p, &label)| 1.0 - cosine_similarity(p, &centroids[label]))
        .sum()
}

/// Normalized mean of each cluster's members. A cluster with no members
/// keeps its previous centroid.
fn update_centroids(points: &[Vec<f32>], labels: &[usize], previous: &[Vec<f32>]) -> Vec<Vec<f32>> {
    let dimension = points[0].len();
    let k = previous.len();
    let mut sums = vec![vec![0.0f32; dimension]; k];
    let mut sizes = vec![0usize; k];

    for (point, &label) in points.iter().zip(labels) {
        for (acc, &value) in sums[label].iter_mut().zip(point) {
            *acc += value;
        }
        sizes[label] += 1;
    }

    sums.into_iter()
        .zip(&sizes)
        .zip(previous)
        .map(|((mut sum, &size), old)| {
            if size == 0 || !normalize_vector(&mut sum) {
                old.clone()
            } else {
                sum
            }
        })
        .collect()
}

/// Gives every empty cluster the member farthest from its centroid, taken
/// from a cluster with more than one member. Returns true if anything moved.
fn repair_empty_clusters(
    points: &[Vec<f32>],
    labels: &mut [usize],
    centroids: &mut [Vec<f32>],
) -> bool {
    let k = centroids.len();
    let mut sizes = vec![0usize; k];
    for &label in labels.iter() {
        sizes[label] += 1;
    }

    let mut repaired = false;
    for empty in 0..k {
        if sizes[empty] > 0 {
            continue;
        }
        let donor = points
            .iter()
            .enumerate()
            .filter(|&(i, _)| sizes[labels[i]] > 1)
            .map(|(i, p)| (i, 1.0 - cosine_similarity(p, &centroids[labels[i]])))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        let Some((i, _)) = donor else {
            break;
        };

        sizes[labels[i]] -= 1;
        sizes[empty] += 1;
        labels[i] = empty;
        centroids[empty] = points[i].clone();
        repaired = true;
    }
    repaired
}

/// Computes cosine similarity between two vectors.
///
/// Returns a value in [-1, 1]; 0 if either vector is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

/// K-means++ seeding: the first centroid uniformly at random, each next one
/// with probability proportional to its squared cosine distance from the
/// nearest chosen centroid.
fn initialize_centroids_kmeans_plus_plus(
    points: &[Vec<f32>],
    k: usize,
    rng: &mut StdRng,
    ctx: &BuildContext,
) -> Result<Vec<Vec<f32>>, ClusteringError> {
    let n = points.len();
    let mut chosen = vec![false; n];
    let mut centroids = Vec::with_capacity(k);

    ctx.report(BuildPhase::Seed, 0, k);
    let first = rng.random_range(0..n);
    chosen[first] = true;
    centroids.push(points[first].clone());

    let mut nearest: Vec<f32> = points
        .iter()
        .map(|p| cosine_distance(p, &centroids[0]))
        .collect();

    while centroids.len() < k {
        ctx.checkpoint()?;

        let weights: Vec<f32> = nearest.iter().map(|d| d * d).collect();
        let total: f32 = weights.iter().sum();

        let next = if total < EPSILON {
            // Remaining points coincide with chosen centroids
            let remaining: Vec<usize> = (0..n).filter(|&i| !chosen[i]).collect();
            if remaining.is_empty() {
                return Err(ClusteringError::InitializationFailed);
            }
            remaining[rng.random_range(0..remaining.len())]
        } else {
            let target = rng.random::<f32>() * total;
            let mut cumulative = 0.0;
            // Fallback to the heaviest point if rounding skips the target
            let mut pick = None;
            for (i, &w) in weights.iter().enumerate() {
                cumulative += w;
                if w > 0.0 && cumulative >= target {
                    pick = Some(i);
                    break;
                }
            }
            match pick {
                Some(i) => i,
                None => weights
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i)
                    .ok_or(ClusteringError::InitializationFailed)?,
            }
        };

        chosen[next] = true;
        let centroid = points[next].clone();
        for (d, p) in nearest.iter_mut().zip(points) {
            *d = d.min(cosine_distance(p, &centroid));
        }
        centroids.push(centroid);
        ctx.report(BuildPhase::Seed, centroids.len(), k);
    }

    Ok(centroids)
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    (1.0 - cosine_similarity(a, b)).max(0.0)
}

/// Calculates the mean movement of centroids between iterations.
fn calculate_centroid_movement(old: &[Vec<f32>], new: &[Vec<f32>]) -> f32 {
    old.iter()
        .zip(new.iter())
        .map(|(old_c, new_c)| 1.0 - cosine_similarity(old_c, new_c))
        .sum::<f32>()
        / old.len() as f32
}

/// Normalizes a vector in-place; returns false (leaving it untouched) if it
/// has zero length.
fn normalize_vector(vector: &mut [f32]) -> bool {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
        true
    } else {
        false
    }
}

/// Creates a normalized copy of a vector.
fn normalize_vector_copy(vector: &[f32]) -> Vec<f32> {
    let mut copy = vector.to_vec();
    normalize_vector(&mut copy);
    copy
}
