//! In-memory vector collection keyed by stable string ids.
//!
//! The store is the source of truth for dimension and count. Every stored
//! vector has exactly the canonical dimension and only finite values; the
//! ingestion path repairs malformed input instead of rejecting it.

use std::collections::HashMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::types::{VectorDimension, fit_to_dimension};

/// Counters describing what ingestion had to repair or drop.
///
/// `padded` and `truncated` count vectors; `non_finite_fixed` counts
/// individual values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub overwritten: usize,
    pub padded: usize,
    pub truncated: usize,
    pub non_finite_fixed: usize,
    pub dropped_empty_id: usize,
    pub dropped_empty_vector: usize,
}

impl IngestReport {
    /// Total number of inputs dropped as malformed.
    pub fn dropped(&self) -> usize {
        self.dropped_empty_id + self.dropped_empty_vector
    }

    /// True when any input was repaired or dropped.
    pub fn has_warnings(&self) -> bool {
        self.padded > 0 || self.truncated > 0 || self.non_finite_fixed > 0 || self.dropped() > 0
    }

    pub fn merge(&mut self, other: &IngestReport) {
        self.accepted += other.accepted;
        self.overwritten += other.overwritten;
        self.padded += other.padded;
        self.truncated += other.truncated;
        self.non_finite_fixed += other.non_finite_fixed;
        self.dropped_empty_id += other.dropped_empty_id;
        self.dropped_empty_vector += other.dropped_empty_vector;
    }
}

/// Owned collection of fixed-dimension vectors in insertion order.
///
/// Cloning is a deep copy. Builders hold an `Arc<VectorStore>` snapshot, so
/// callers that keep ingesting go through `Arc::make_mut`.
#[derive(Debug, Clone, Default)]
pub struct VectorStore {
    ids: Vec<String>,
    positions: HashMap<String, usize>,
    data: Vec<f32>,
    dimension: Option<VectorDimension>,
    report: IngestReport,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose canonical dimension is fixed up front.
    pub fn with_dimension(dimension: VectorDimension) -> Self {
        Self {
            dimension: Some(dimension),
            ..Self::default()
        }
    }

    /// Ingests a single vector.
    ///
    /// If no dimension has been established yet, this vector's length becomes
    /// the canonical dimension.
    pub fn ingest(&mut self, id: impl Into<String>, vector: &[f32]) -> IngestReport {
        let mut report = IngestReport::default();
        self.ingest_one(id.into(), vector, &mut report);
        self.report.merge(&report);

        if report.has_warnings() {
            tracing::debug!(
                padded = report.padded,
                truncated = report.truncated,
                non_finite = report.non_finite_fixed,
                dropped = report.dropped(),
                "ingested vector with fix-ups"
            );
        }
        report
    }

    /// Ingests a batch of vectors.
    ///
    /// On the first batch the canonical dimension is the most common vector
    /// length, with ties going to the larger length.
    pub fn ingest_batch<I, S>(&mut self, batch: I) -> IngestReport
    where
        I: IntoIterator<Item = (S, Vec<f32>)>,
        S: Into<String>,
    {
        let batch: Vec<(String, Vec<f32>)> =
            batch.into_iter().map(|(id, v)| (id.into(), v)).collect();

        if self.dimension.is_none() {
            self.dimension = modal_dimension(
                batch
                    .iter()
                    .filter(|(id, v)| !id.is_empty() && !v.is_empty())
                    .map(|(_, v)| v.len()),
            );
            if let Some(dim) = self.dimension {
                tracing::debug!(dimension = dim.get(), "resolved canonical dimension");
            }
        }

        let mut report = IngestReport::default();
        for (id, vector) in batch {
            self.ingest_one(id, &vector, &mut report);
        }
        self.report.merge(&report);

        if report.has_warnings() {
            tracing::warn!(
                accepted = report.accepted,
                padded = report.padded,
                truncated = report.truncated,
                non_finite = report.non_finite_fixed,
                dropped = report.dropped(),
                "ingestion repaired or dropped malformed vectors"
            );
        }
        report
    }

    fn ingest_one(&mut self, id: String, vector: &[f32], report: &mut IngestReport) {
        if id.is_empty() {
            report.dropped_empty_id += 1;
            return;
        }
        if vector.is_empty() {
            report.dropped_empty_vector += 1;
            return;
        }

        let dim = match self.dimension {
            Some(dim) => dim.get(),
            None => {
                // Non-empty vector, so this cannot fail
                let Ok(dim) = VectorDimension::new(vector.len()) else {
                    report.dropped_empty_vector += 1;
                    return;
                };
                self.dimension = Some(dim);
                dim.get()
            }
        };

        let (fitted, outcome) = fit_to_dimension(vector, dim);
        if outcome.padded > 0 {
            report.padded += 1;
        }
        if outcome.truncated > 0 {
            report.truncated += 1;
        }
        report.non_finite_fixed += outcome.non_finite;

        if let Some(&pos) = self.positions.get(&id) {
            self.data[pos * dim..(pos + 1) * dim].copy_from_slice(&fitted);
            report.overwritten += 1;
        } else {
            self.positions.insert(id.clone(), self.ids.len());
            self.ids.push(id);
            self.data.extend_from_slice(&fitted);
        }
        report.accepted += 1;
    }

    /// Returns the stored vector for `id`.
    pub fn get(&self, id: &str) -> Option<&[f32]> {
        self.positions.get(id).map(|&pos| self.vector_at(pos))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    /// Position of `id` in insertion order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// Vector at insertion position `pos`.
    ///
    /// # Panics
    /// Panics if `pos >= self.len()`.
    pub fn vector_at(&self, pos: usize) -> &[f32] {
        let dim = self.dimension();
        &self.data[pos * dim..(pos + 1) * dim]
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Canonical dimension, or 0 before anything has been ingested.
    pub fn dimension(&self) -> usize {
        self.dimension.map_or(0, |d| d.get())
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Iterates `(id, vector)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f32])> + '_ {
        let dim = self.dimension().max(1);
        self.ids
            .iter()
            .map(String::as_str)
            .zip(self.data.chunks_exact(dim))
    }

    /// Cumulative ingestion counters since the store was created.
    pub fn report(&self) -> IngestReport {
        self.report
    }

    /// Copies the named vectors into a new store, in the order given.
    ///
    /// Unknown and repeated ids are skipped.
    pub fn subset<'a, I>(&self, ids: I) -> VectorStore
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut subset = match self.dimension {
            Some(dim) => VectorStore::with_dimension(dim),
            None => VectorStore::new(),
        };
        for id in ids {
            if subset.contains(id) {
                continue;
            }
            if let Some(vector) = self.get(id) {
                subset.ingest_one(id.to_string(), vector, &mut IngestReport::default());
            }
        }
        subset
    }

    /// SHA-256 over dimension, ids and vector bytes, hex encoded.
    ///
    /// Two stores with the same contents in the same order share a fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.dimension() as u64).to_le_bytes());
        hasher.update((self.len() as u64).to_le_bytes());
        for (id, vector) in self.iter() {
            hasher.update((id.len() as u64).to_le_bytes());
            hasher.update(id.as_bytes());
            for value in vector {
                hasher.update(value.to_le_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Most common length, ties broken toward the larger length.
fn modal_dimension(lengths: impl Iterator<Item = usize>) -> Option<VectorDimension> {
    let mut counts: HashMap<usize, usize> = HashMap::new();
    for len in lengths {
        *counts.entry(len).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|(len_a, count_a), (len_b, count_b)| {
            count_a.cmp(count_b).then(len_a.cmp(len_b))
        })
        .and_then(|(len, _)| VectorDimension::new(len).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_lengths_resolve_to_mode() {
        let mut store = VectorStore::new();
        let report = store.ingest_batch(vec![
            ("a", vec![1.0; 64]),
            ("b", vec![1.0; 64]),
            ("c", vec![1.0; 32]),
            ("d", vec![1.0; 64]),
        ]);

        assert_eq!(store.dimension(), 64);
        assert_eq!(report.padded, 1);
        assert_eq!(report.truncated, 0);
        assert_eq!(report.accepted, 4);

        let padded = store.get("c").unwrap();
        assert_eq!(padded.len(), 64);
        assert!(padded[32..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_mode_tie_prefers_larger_length() {
        let mut store = VectorStore::new();
        let report = store.ingest_batch(vec![
            ("a", vec![1.0; 8]),
            ("b", vec![1.0; 16]),
        ]);
        assert_eq!(store.dimension(), 16);
        assert_eq!(report.padded, 1);
    }

    #[test]
    fn test_non_finite_values_coerced() {
        let mut store = VectorStore::new();
        let report = store.ingest("x", &[1.0, f32::NAN, f32::INFINITY, -2.0]);
        assert_eq!(report.non_finite_fixed, 2);
        assert_eq!(store.get("x").unwrap(), &[1.0, 0.0, 0.0, -2.0]);
        assert!(store.iter().all(|(_, v)| v.iter().all(|x| x.is_finite())));
    }

    #[test]
    fn test_empty_inputs_dropped_and_counted() {
        let mut store = VectorStore::new();
        let report = store.ingest_batch(vec![
            ("", vec![1.0, 2.0]),
            ("empty", vec![]),
            ("ok", vec![1.0, 2.0]),
        ]);
        assert_eq!(report.dropped_empty_id, 1);
        assert_eq!(report.dropped_empty_vector, 1);
        assert_eq!(report.dropped(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.dimension(), 2);
    }

    #[test]
    fn test_duplicate_ids_overwrite() {
        let mut store = VectorStore::new();
        store.ingest("a", &[1.0, 0.0]);
        let report = store.ingest("a", &[0.0, 1.0]);
        assert_eq!(report.overwritten, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap(), &[0.0, 1.0]);
    }

    #[test]
    fn test_later_vectors_fit_established_dimension() {
        let mut store = VectorStore::new();
        store.ingest("a", &[1.0, 2.0, 3.0]);
        let report = store.ingest("b", &[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(report.truncated, 1);
        assert_eq!(store.get("b").unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(store.report().accepted, 2);
    }

    #[test]
    fn test_subset_keeps_requested_order() {
        let mut store = VectorStore::new();
        store.ingest_batch(vec![
            ("a", vec![1.0, 0.0]),
            ("b", vec![0.0, 1.0]),
            ("c", vec![1.0, 1.0]),
        ]);
        let subset = store.subset(["c", "missing", "a", "c"]);
        assert_eq!(subset.ids(), &["c".to_string(), "a".to_string()]);
        assert_eq!(subset.dimension(), 2);
    }

    #[test]
    fn test_fingerprint_tracks_contents() {
        let mut a = VectorStore::new();
        a.ingest("x", &[1.0, 2.0]);
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.ingest("x", &[1.0, 2.5]);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }
}
