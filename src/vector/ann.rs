//! Approximate nearest-neighbor index over a [`VectorStore`] snapshot.
//!
//! A [`BuiltIndex`] is immutable once construction finishes. [`AnnIndex`]
//! publishes built indexes wholesale: readers clone an `Arc` and search
//! without holding the lock, so a query sees either the previous or the next
//! index, never a partially built one.
//!
//! # Export format
//! ```text
//! [0..4)    magic "VSIX"
//! [4..8)    format version, u32 little-endian
//! [8..40)   SHA-256 of the payload
//! [40..)    payload: lz4 (size-prepended) of bincode(IndexRecord)
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bincode::{Decode, Encode};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::hnsw::{GraphRecord, HnswGraph, HnswParams, unit};
use super::store::VectorStore;
use super::types::{Score, VectorError, fit_to_dimension};
use crate::build::{BuildContext, BuildPhase, BuildStats, BuildTarget};
use crate::error::BuildResult;

const INDEX_MAGIC: &[u8; 4] = b"VSIX";

/// Bumped whenever the payload layout changes. Blobs from other versions
/// are rejected.
pub const INDEX_FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 32;

/// Upper bound on the lz4 block expansion ratio.
const MAX_LZ4_RATIO: usize = 255;

/// Decode budget per encoded byte. Container headers reserve more memory
/// than they occupy on the wire; valid records stay well under this.
const DECODE_CLAIM_RATIO: usize = 16;

/// Build-time parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexParams {
    pub ef_construction: usize,
    /// Graph degree on upper layers; layer 0 allows twice as many.
    pub m: usize,
    /// Vectors inserted between cancellation checkpoints.
    pub chunk_size: usize,
    pub seed: Option<u64>,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            ef_construction: 200,
            m: 16,
            chunk_size: 1024,
            seed: None,
        }
    }
}

impl IndexParams {
    pub fn with_ef_construction(mut self, ef_construction: usize) -> Self {
        self.ef_construction = ef_construction;
        self
    }

    pub fn with_m(mut self, m: usize) -> Self {
        self.m = m;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: Score,
}

#[derive(Encode, Decode)]
struct IndexRecord {
    ids: Vec<String>,
    graph: GraphRecord,
}

/// A fully constructed, immutable index.
#[derive(Debug)]
pub struct BuiltIndex {
    ids: Vec<String>,
    positions: HashMap<String, u32>,
    graph: HnswGraph,
}

impl BuiltIndex {
    fn new(ids: Vec<String>, graph: HnswGraph) -> Self {
        let positions = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i as u32))
            .collect();
        Self {
            ids,
            positions,
            graph,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.graph.dimension()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    /// Up to `k` hits by descending similarity.
    ///
    /// Queries of the wrong length are padded or truncated to the index
    /// dimension; non-finite entries count as 0.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<SearchHit> {
        if self.is_empty() || k == 0 {
            return Vec::new();
        }
        let (fitted, _) = fit_to_dimension(query, self.dimension());
        self.search_unit(&unit(&fitted), k, ef)
    }

    fn search_unit(&self, query: &[f32], k: usize, ef: usize) -> Vec<SearchHit> {
        self.graph
            .search(query, k, ef)
            .into_iter()
            .map(|(node, similarity)| SearchHit {
                id: self.ids[node as usize].clone(),
                score: Score::saturating(similarity),
            })
            .collect()
    }

    /// Searches with the stored vector of `id`. The id itself is usually the
    /// first hit.
    pub fn search_by_id(&self, id: &str, k: usize, ef: usize) -> Option<Vec<SearchHit>> {
        let node = *self.positions.get(id)?;
        let query = self.graph.vector(node).to_vec();
        Some(self.search_unit(&query, k, ef))
    }

    /// Serializes the index into the versioned export format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, VectorError> {
        let record = IndexRecord {
            ids: self.ids.clone(),
            graph: self.graph.to_record(),
        };
        let encoded = bincode::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| VectorError::Serialization(e.to_string()))?;
        let payload = lz4_flex::compress_prepend_size(&encoded);
        let digest = Sha256::digest(&payload);

        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(INDEX_MAGIC);
        bytes.extend_from_slice(&INDEX_FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&digest);
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Parses and structurally validates an exported index.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VectorError> {
        let corrupt = |reason: &str| VectorError::IndexCorrupt {
            reason: reason.to_string(),
        };

        if bytes.len() < HEADER_LEN {
            return Err(corrupt("blob is shorter than the header"));
        }
        if &bytes[0..4] != INDEX_MAGIC {
            return Err(corrupt("missing VSIX magic bytes"));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != INDEX_FORMAT_VERSION {
            return Err(VectorError::VersionMismatch {
                expected: INDEX_FORMAT_VERSION,
                actual: version,
            });
        }

        let payload = &bytes[HEADER_LEN..];
        if Sha256::digest(payload).as_slice() != &bytes[8..HEADER_LEN] {
            return Err(corrupt("payload checksum mismatch"));
        }

        let Some(size_prefix) = payload.first_chunk::<4>() else {
            return Err(corrupt("payload is missing its size prefix"));
        };
        let declared = u32::from_le_bytes(*size_prefix) as usize;
        if declared > (payload.len() - 4).saturating_mul(MAX_LZ4_RATIO) {
            return Err(corrupt("declared payload size exceeds the compressed data"));
        }
        let encoded = lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| corrupt(&format!("decompression failed: {e}")))?;
        let (record, consumed) = decode_record(&encoded).map_err(|e| corrupt(&e))?;
        if consumed != encoded.len() {
            return Err(corrupt("trailing bytes after index record"));
        }

        let graph = HnswGraph::from_record(record.graph)?;
        if record.ids.len() != graph.len() {
            return Err(corrupt("id count does not match node count"));
        }
        let mut seen = HashSet::with_capacity(record.ids.len());
        for id in &record.ids {
            if id.is_empty() || !seen.insert(id.as_str()) {
                return Err(corrupt("ids are empty or not unique"));
            }
        }

        Ok(Self::new(record.ids, graph))
    }
}

/// Decodes an [`IndexRecord`] with a byte limit proportional to its encoded
/// size, so corrupt length prefixes fail instead of reserving huge buffers.
fn decode_record(encoded: &[u8]) -> Result<(IndexRecord, usize), String> {
    let budget = encoded.len().saturating_mul(DECODE_CLAIM_RATIO);
    let config = bincode::config::standard();
    let decoded = if budget <= 1 << 20 {
        bincode::decode_from_slice(encoded, config.with_limit::<{ 1 << 20 }>())
    } else if budget <= 1 << 24 {
        bincode::decode_from_slice(encoded, config.with_limit::<{ 1 << 24 }>())
    } else if budget <= 1 << 28 {
        bincode::decode_from_slice(encoded, config.with_limit::<{ 1 << 28 }>())
    } else if budget <= 1 << 31 {
        bincode::decode_from_slice(encoded, config.with_limit::<{ 1 << 31 }>())
    } else {
        decode_large(encoded, budget)?
    };
    decoded.map_err(|e| format!("decode failed: {e}"))
}

#[cfg(target_pointer_width = "64")]
fn decode_large(
    encoded: &[u8],
    budget: usize,
) -> Result<Result<(IndexRecord, usize), bincode::error::DecodeError>, String> {
    let config = bincode::config::standard();
    if budget <= 1 << 35 {
        Ok(bincode::decode_from_slice(encoded, config.with_limit::<{ 1 << 35 }>()))
    } else if budget <= 1 << 39 {
        Ok(bincode::decode_from_slice(encoded, config.with_limit::<{ 1 << 39 }>()))
    } else {
        Err(format!("index record of {} bytes is too large", encoded.len()))
    }
}

#[cfg(not(target_pointer_width = "64"))]
fn decode_large(
    encoded: &[u8],
    _budget: usize,
) -> Result<Result<(IndexRecord, usize), bincode::error::DecodeError>, String> {
    Err(format!("index record of {} bytes is too large", encoded.len()))
}

/// Builds an index over `store` in chunks of `params.chunk_size`.
///
/// Returns `Ok(None)` for an empty store. Cancellation is checked before every
/// chunk; a cancelled build returns `Cancelled` and nothing is kept.
pub fn build_chunked(
    store: &VectorStore,
    params: &IndexParams,
    ctx: &BuildContext,
) -> BuildResult<Option<BuiltIndex>> {
    let total = store.len();
    if total == 0 {
        ctx.report(BuildPhase::Insert, 0, 0);
        return Ok(None);
    }

    let chunk_size = params.chunk_size.max(1);
    let mut graph = HnswGraph::new(
        store.dimension(),
        HnswParams::new(params.m, params.ef_construction),
        params.seed,
    );

    ctx.report(BuildPhase::Insert, 0, total);
    for start in (0..total).step_by(chunk_size) {
        ctx.checkpoint()?;
        let end = (start + chunk_size).min(total);
        for pos in start..end {
            graph.insert(store.vector_at(pos));
        }
        ctx.report(BuildPhase::Insert, end, total);
    }

    Ok(Some(BuiltIndex::new(store.ids().to_vec(), graph)))
}

/// Published ANN index with a runtime-tunable search depth.
#[derive(Debug)]
pub struct AnnIndex {
    current: RwLock<Option<Arc<BuiltIndex>>>,
    ef_search: AtomicUsize,
    params: IndexParams,
}

impl Default for AnnIndex {
    fn default() -> Self {
        Self::new(IndexParams::default(), 64)
    }
}

impl AnnIndex {
    pub fn new(params: IndexParams, ef_search: usize) -> Self {
        Self {
            current: RwLock::new(None),
            ef_search: AtomicUsize::new(ef_search.max(1)),
            params,
        }
    }

    /// Default build parameters.
    pub fn params(&self) -> IndexParams {
        self.params
    }

    /// Builds synchronously with the default parameters and the given
    /// `ef_construction`, replacing any published index.
    pub fn build(&self, store: &VectorStore, ef_construction: usize) -> BuildResult<BuildStats> {
        let params = self.params.with_ef_construction(ef_construction);
        self.build_with(store, &params, &BuildContext::detached(BuildTarget::Index))
    }

    /// Builds under `ctx` and publishes the result.
    ///
    /// On cancellation the published index is untouched. An empty store
    /// publishes an absent index.
    pub fn build_with(
        &self,
        store: &VectorStore,
        params: &IndexParams,
        ctx: &BuildContext,
    ) -> BuildResult<BuildStats> {
        let mut stats = BuildStats::new(BuildTarget::Index);
        let built = build_chunked(store, params, ctx)?;

        stats.vectors_processed = store.len();
        stats.chunks = store.len().div_ceil(params.chunk_size.max(1));
        self.publish(built.map(Arc::new));
        stats.stop_timing();

        tracing::debug!(
            vectors = stats.vectors_processed,
            chunks = stats.chunks,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "index built"
        );
        Ok(stats)
    }

    pub(crate) fn publish(&self, index: Option<Arc<BuiltIndex>>) {
        *self.current.write() = index;
    }

    /// The currently published index.
    pub fn snapshot(&self) -> Option<Arc<BuiltIndex>> {
        self.current.read().clone()
    }

    pub fn is_built(&self) -> bool {
        self.current.read().is_some()
    }

    pub fn len(&self) -> usize {
        self.snapshot().map_or(0, |index| index.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Search depth used by queries. Takes effect on the next query.
    pub fn set_ef_search(&self, ef_search: usize) {
        self.ef_search.store(ef_search.max(1), Ordering::Relaxed);
    }

    pub fn ef_search(&self) -> usize {
        self.ef_search.load(Ordering::Relaxed)
    }

    /// Up to `k` `(id, score)` hits, most similar first. Empty when no index
    /// is published.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        match self.snapshot() {
            Some(index) => index.search(query, k, self.ef_search()),
            None => Vec::new(),
        }
    }

    /// Like [`search`](Self::search) but drops hits scoring below `threshold`.
    pub fn search_with_threshold(&self, query: &[f32], k: usize, threshold: f32) -> Vec<SearchHit> {
        self.search(query, k)
            .into_iter()
            .filter(|hit| hit.score.get() >= threshold)
            .collect()
    }

    /// Neighbors of an indexed vector. Empty if the id is not indexed.
    pub fn search_by_id(&self, id: &str, k: usize) -> Vec<SearchHit> {
        self.snapshot()
            .and_then(|index| index.search_by_id(id, k, self.ef_search()))
            .unwrap_or_default()
    }

    /// Serializes the published index.
    pub fn export(&self) -> Result<Vec<u8>, VectorError> {
        match self.snapshot() {
            Some(index) => index.to_bytes(),
            None => Err(VectorError::IndexAbsent),
        }
    }

    /// Validates `bytes` and publishes the decoded index. The published index
    /// is only replaced on success.
    pub fn try_import(&self, bytes: &[u8]) -> Result<(), VectorError> {
        let index = BuiltIndex::from_bytes(bytes)?;
        self.publish(Some(Arc::new(index)));
        Ok(())
    }

    /// [`try_import`](Self::try_import) reporting only success.
    pub fn import(&self, bytes: &[u8]) -> bool {
        match self.try_import(bytes) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "rejected index import");
                false
            }
        }
    }

    /// Drops the published index.
    pub fn clear(&self) {
        self.publish(None);
    }
}
