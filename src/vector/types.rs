//! Type-safe wrappers and core types for the vector pipeline.
//!
//! Newtypes here keep dimensions and similarity scores from being passed
//! around as bare primitives. All error messages carry an actionable
//! suggestion.

use serde::Serialize;
use thiserror::Error;

/// Type-safe wrapper for similarity scores.
///
/// Scores are normalized to the range [0.0, 1.0] where:
/// - 1.0 indicates perfect similarity
/// - 0.0 indicates no (or negative) similarity
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Score(f32);

impl Score {
    /// Creates a score from a raw cosine similarity, clamping into [0.0, 1.0].
    ///
    /// NaN maps to 0.0.
    #[must_use]
    pub fn saturating(similarity: f32) -> Self {
        if similarity.is_nan() {
            return Self::zero();
        }
        Self(similarity.clamp(0.0, 1.0))
    }

    /// Creates a score of 0.0 (no similarity).
    #[must_use]
    pub const fn zero() -> Self {
        Self(0.0)
    }

    /// Returns the underlying f32 value.
    #[must_use]
    pub fn get(&self) -> f32 {
        self.0
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl std::fmt::Display for Score {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

/// Type-safe wrapper for vector dimensions.
///
/// Ensures runtime validation of vector dimensions to prevent
/// mismatches during operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VectorDimension(usize);

impl VectorDimension {
    /// Creates a new `VectorDimension` with validation.
    ///
    /// Returns an error if the dimension is zero.
    pub fn new(dim: usize) -> Result<Self, VectorError> {
        if dim == 0 {
            return Err(VectorError::InvalidDimension {
                dimension: 0,
                reason: "Vector dimension cannot be zero",
            });
        }
        Ok(Self(dim))
    }

    /// Returns the underlying dimension value.
    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }
}

/// Outcome of fitting a raw vector to a canonical dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FitOutcome {
    /// Number of zero entries appended.
    pub padded: usize,
    /// Number of trailing entries dropped.
    pub truncated: usize,
    /// Number of non-finite entries replaced with 0.0.
    pub non_finite: usize,
}

/// Fits `raw` to exactly `dimension` entries: truncate, zero-pad, and coerce
/// non-finite values to 0.0.
pub fn fit_to_dimension(raw: &[f32], dimension: usize) -> (Vec<f32>, FitOutcome) {
    let mut outcome = FitOutcome::default();
    let mut fitted = Vec::with_capacity(dimension);

    for &value in raw.iter().take(dimension) {
        if value.is_finite() {
            fitted.push(value);
        } else {
            outcome.non_finite += 1;
            fitted.push(0.0);
        }
    }

    if raw.len() > dimension {
        outcome.truncated = raw.len() - dimension;
    } else {
        outcome.padded = dimension - raw.len();
        fitted.resize(dimension, 0.0);
    }

    (fitted, outcome)
}

/// Dot product of two equal-length slices.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Euclidean norm of a slice.
#[inline]
pub fn norm(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Errors that can occur during vector operations.
///
/// All error messages include actionable suggestions for resolution.
#[derive(Error, Debug)]
pub enum VectorError {
    #[error("Invalid vector dimension: {dimension}\nReason: {reason}")]
    InvalidDimension {
        dimension: usize,
        reason: &'static str,
    },

    #[error("No index has been built\nSuggestion: Build or import an index before exporting it")]
    IndexAbsent,

    #[error(
        "Index data is corrupt or incompatible: {reason}\nSuggestion: Rebuild the index from the source vectors"
    )]
    IndexCorrupt { reason: String },

    #[error(
        "Invalid index format version: expected {expected}, got {actual}\nSuggestion: Rebuild the index with this version of vecscope"
    )]
    VersionMismatch { expected: u32, actual: u32 },

    #[error(
        "Serialization error: {0}\nSuggestion: Check that vector data is valid and not corrupted"
    )]
    Serialization(String),

    #[error("Storage error: {0}\nSuggestion: Check disk space and file permissions")]
    Storage(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_saturating() {
        assert_eq!(Score::saturating(-0.4).get(), 0.0);
        assert_eq!(Score::saturating(1.000_001).get(), 1.0);
        assert_eq!(Score::saturating(f32::NAN).get(), 0.0);
        assert_eq!(Score::saturating(0.25).get(), 0.25);
    }

    #[test]
    fn test_score_ordering() {
        let mut scores = vec![Score::saturating(0.2), Score::saturating(1.0), Score::zero()];
        scores.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            scores,
            vec![Score::saturating(1.0), Score::saturating(0.2), Score::zero()]
        );
    }

    #[test]
    fn test_vector_dimension() {
        let dim = VectorDimension::new(384).unwrap();
        assert_eq!(dim.get(), 384);
        assert!(VectorDimension::new(0).is_err());
    }

    #[test]
    fn test_fit_pads_truncates_and_fixes() {
        let (fitted, outcome) = fit_to_dimension(&[1.0, f32::NAN], 4);
        assert_eq!(fitted, vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(outcome.padded, 2);
        assert_eq!(outcome.non_finite, 1);
        assert_eq!(outcome.truncated, 0);

        let (fitted, outcome) = fit_to_dimension(&[1.0, 2.0, f32::INFINITY, 4.0], 2);
        assert_eq!(fitted, vec![1.0, 2.0]);
        assert_eq!(outcome.truncated, 2);
        // Dropped entries are not inspected
        assert_eq!(outcome.non_finite, 0);
    }
}
