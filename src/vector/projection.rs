//! Three-axis PCA projection for visualization.
//!
//! # Algorithm
//!
//! 1. Elementwise mean of all stored vectors.
//! 2. Upper triangle of the centered covariance matrix, divided by
//!    `max(1, n - 1)` and mirrored.
//! 3. Top three eigenvectors by power iteration: multiply by `C`, deflate
//!    against earlier components, renormalize.
//! 4. Centered dot product of every vector with each axis.
//! 5. Per-axis rescale from `[min, max]` to `[-1, 1]`.
//!
//! Power iteration starts from a random vector, so axes may flip sign between
//! runs unless a seed is configured.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::store::VectorStore;
use crate::build::{BuildContext, BuildPhase, BuildTarget};
use crate::error::BuildResult;

/// Number of projected axes.
pub const AXES: usize = 3;

/// Default power-iteration steps per component.
pub const DEFAULT_ITERATIONS: usize = 60;

const DEGENERATE_RANGE: f64 = 1e-12;

/// Position of one vector in projected space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedPoint {
    pub id: String,
    pub position: [f32; AXES],
}

/// Projection metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionMeta {
    /// Eigenvalue of each axis over the covariance trace.
    pub explained_variance: [f32; AXES],
    /// Source dimension.
    pub dimension: usize,
    pub count: usize,
    /// Raw `[min, max]` per axis before rescaling.
    pub ranges: [[f32; 2]; AXES],
    /// Principal axes, each of length `dimension`. Zero when `dimension < 3`.
    pub components: Vec<Vec<f32>>,
}

/// Mapping from id to a point in `[-1, 1]^3`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Projection {
    points: Vec<ProjectedPoint>,
    meta: ProjectionMeta,
    #[serde(skip)]
    lookup: HashMap<String, usize>,
}

impl Projection {
    fn new(points: Vec<ProjectedPoint>, meta: ProjectionMeta) -> Self {
        let lookup = points
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();
        Self {
            points,
            meta,
            lookup,
        }
    }

    /// Projection of an empty store.
    pub fn empty(dimension: usize) -> Self {
        Self::new(
            Vec::new(),
            ProjectionMeta {
                explained_variance: [0.0; AXES],
                dimension,
                count: 0,
                ranges: [[0.0; 2]; AXES],
                components: Vec::new(),
            },
        )
    }

    pub fn get(&self, id: &str) -> Option<[f32; AXES]> {
        self.lookup.get(id).map(|&i| self.points[i].position)
    }

    pub fn points(&self) -> &[ProjectedPoint] {
        &self.points
    }

    pub fn meta(&self) -> &ProjectionMeta {
        &self.meta
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let decoded: Projection = serde_json::from_str(json)?;
        Ok(Self::new(decoded.points, decoded.meta))
    }
}

/// Power-iteration PCA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Projector {
    iterations: usize,
    seed: Option<u64>,
}

impl Default for Projector {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            seed: None,
        }
    }
}

impl Projector {
    pub fn new(iterations: usize) -> Self {
        Self {
            iterations: iterations.max(1),
            seed: None,
        }
    }

    /// Fixes the power-iteration starting vectors.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Projects every vector in `store`. An empty store yields an empty
    /// projection.
    pub fn project(&self, store: &VectorStore) -> Projection {
        let ctx = BuildContext::detached(BuildTarget::Projection);
        // A detached context is never cancelled
        self.project_with(store, &ctx)
            .unwrap_or_else(|_| Projection::empty(store.dimension()))
    }

    /// Projects under `ctx`, checking for cancellation between phases.
    pub fn project_with(&self, store: &VectorStore, ctx: &BuildContext) -> BuildResult<Projection> {
        let n = store.len();
        let d = store.dimension();
        if n == 0 || d == 0 {
            return Ok(Projection::empty(d));
        }

        ctx.report(BuildPhase::Mean, 0, n);
        let mean = mean_vector(store);
        ctx.report(BuildPhase::Mean, n, n);
        ctx.checkpoint()?;

        ctx.report(BuildPhase::Covariance, 0, d);
        let centered: Vec<f64> = store
            .iter()
            .flat_map(|(_, v)| v.iter().zip(&mean).map(|(&x, &m)| x as f64 - m))
            .collect();
        let covariance = covariance_matrix(&centered, n, d);
        ctx.report(BuildPhase::Covariance, d, d);
        ctx.checkpoint()?;

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let component_count = AXES.min(d);
        let mut components: Vec<Vec<f64>> = Vec::with_capacity(AXES);
        let mut eigenvalues = [0.0f64; AXES];
        for (c, eigenvalue) in eigenvalues.iter_mut().enumerate().take(component_count) {
            ctx.report(BuildPhase::Eigen, c, component_count);
            let axis = power_iteration(&covariance, d, &components, self.iterations, &mut rng);
            *eigenvalue = rayleigh_quotient(&covariance, d, &axis);
            components.push(axis);
            ctx.checkpoint()?;
        }
        ctx.report(BuildPhase::Eigen, component_count, component_count);

        let trace: f64 = (0..d).map(|i| covariance[i * d + i]).sum();
        let mut explained_variance = [0.0f32; AXES];
        if trace > 0.0 {
            for (out, &lambda) in explained_variance.iter_mut().zip(&eigenvalues) {
                *out = (lambda.max(0.0) / trace) as f32;
            }
        }

        ctx.report(BuildPhase::Project, 0, n);
        let raw: Vec<[f64; AXES]> = centered
            .par_chunks_exact(d)
            .map(|row| {
                let mut coords = [0.0f64; AXES];
                for (coord, axis) in coords.iter_mut().zip(&components) {
                    *coord = row.iter().zip(axis).map(|(x, a)| x * a).sum();
                }
                coords
            })
            .collect();
        let mut ranges = [[f64::INFINITY, f64::NEG_INFINITY]; AXES];
        for coords in &raw {
            for (range, &value) in ranges.iter_mut().zip(coords) {
                range[0] = range[0].min(value);
                range[1] = range[1].max(value);
            }
        }
        ctx.report(BuildPhase::Project, n, n);
        ctx.checkpoint()?;

        ctx.report(BuildPhase::Scale, 0, n);
        let points: Vec<ProjectedPoint> = store
            .ids()
            .iter()
            .zip(&raw)
            .map(|(id, coords)| {
                let mut position = [0.0f32; AXES];
                for ((out, &value), range) in position.iter_mut().zip(coords).zip(&ranges) {
                    *out = rescale(value, range[0], range[1]);
                }
                ProjectedPoint {
                    id: id.clone(),
                    position,
                }
            })
            .collect();
        ctx.report(BuildPhase::Scale, n, n);

        let meta = ProjectionMeta {
            explained_variance,
            dimension: d,
            count: n,
            ranges: ranges.map(|[lo, hi]| [lo as f32, hi as f32]),
            components: (0..AXES)
                .map(|c| {
                    components
                        .get(c)
                        .map(|axis| axis.iter().map(|&x| x as f32).collect())
                        .unwrap_or_else(|| vec![0.0; d])
                })
                .collect(),
        };
        Ok(Projection::new(points, meta))
    }
}

fn mean_vector(store: &VectorStore) -> Vec<f64> {
    let d = store.dimension();
    let mut mean = vec![0.0f64; d];
    for (_, vector) in store.iter() {
        for (m, &x) in mean.iter_mut().zip(vector) {
            *m += x as f64;
        }
    }
    let n = store.len() as f64;
    mean.iter_mut().for_each(|m| *m /= n);
    mean
}

/// Full `d x d` covariance from row-major centered data.
fn covariance_matrix(centered: &[f64], n: usize, d: usize) -> Vec<f64> {
    let denom = (n.saturating_sub(1)).max(1) as f64;

    let upper: Vec<Vec<f64>> = (0..d)
        .into_par_iter()
        .map(|a| {
            let mut row = vec![0.0f64; d - a];
            for sample in centered.chunks_exact(d) {
                let ca = sample[a];
                if ca == 0.0 {
                    continue;
                }
                for (acc, &cb) in row.iter_mut().zip(&sample[a..]) {
                    *acc += ca * cb;
                }
            }
            row
        })
        .collect();

    let mut matrix = vec![0.0f64; d * d];
    for (a, row) in upper.iter().enumerate() {
        for (offset, &sum) in row.iter().enumerate() {
            let b = a + offset;
            let value = sum / denom;
            matrix[a * d + b] = value;
            matrix[b * d + a] = value;
        }
    }
    matrix
}

fn mat_vec(matrix: &[f64], d: usize, v: &[f64]) -> Vec<f64> {
    matrix
        .chunks_exact(d)
        .map(|row| row.iter().zip(v).map(|(a, b)| a * b).sum())
        .collect()
}

/// Subtracts the projection of `v` onto each (unit) component.
fn deflate(v: &mut [f64], components: &[Vec<f64>]) {
    for component in components {
        let overlap: f64 = v.iter().zip(component).map(|(a, b)| a * b).sum();
        for (x, c) in v.iter_mut().zip(component) {
            *x -= overlap * c;
        }
    }
}

/// Normalizes in place; returns false if `v` is (numerically) zero.
fn normalize(v: &mut [f64]) -> bool {
    let length = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if length <= DEGENERATE_RANGE {
        return false;
    }
    v.iter_mut().for_each(|x| *x /= length);
    true
}

fn power_iteration(
    matrix: &[f64],
    d: usize,
    found: &[Vec<f64>],
    iterations: usize,
    rng: &mut StdRng,
) -> Vec<f64> {
    let mut v: Vec<f64> = (0..d).map(|_| rng.random::<f64>() * 2.0 - 1.0).collect();
    deflate(&mut v, found);
    if !normalize(&mut v) {
        // Random start landed in the span of earlier axes; fall back to a basis vector
        v = orthogonal_basis_vector(d, found);
    }

    for _ in 0..iterations {
        let mut next = mat_vec(matrix, d, &v);
        deflate(&mut next, found);
        if !normalize(&mut next) {
            // C has no variance left outside the found axes
            break;
        }
        v = next;
    }
    v
}

fn orthogonal_basis_vector(d: usize, found: &[Vec<f64>]) -> Vec<f64> {
    for i in 0..d {
        let mut e = vec![0.0; d];
        e[i] = 1.0;
        deflate(&mut e, found);
        if normalize(&mut e) {
            return e;
        }
    }
    vec![0.0; d]
}

fn rayleigh_quotient(matrix: &[f64], d: usize, v: &[f64]) -> f64 {
    mat_vec(matrix, d, v).iter().zip(v).map(|(a, b)| a * b).sum()
}

fn rescale(value: f64, min: f64, max: f64) -> f32 {
    let range = max - min;
    if !range.is_finite() || range <= DEGENERATE_RANGE {
        return 0.0;
    }
    ((2.0 * (value - min) / range - 1.0).clamp(-1.0, 1.0)) as f32
}
