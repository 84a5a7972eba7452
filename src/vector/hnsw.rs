//! Hierarchical navigable small world graph over unit vectors.
//!
//! Insert assigns a random top layer, descends greedily from the entry point,
//! then wires neighbors on every layer from the node's top layer to 0 using a
//! diversity heuristic. Search descends greedily to layer 1 and runs a beam
//! search with `ef` candidates on layer 0.
//!
//! Distance is `1 - dot`, which is cosine distance because every stored
//! vector is normalized on insert.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use bincode::{Decode, Encode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::types::{VectorError, dot, norm};

/// Graph construction parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HnswParams {
    /// Max neighbors per node on upper layers.
    pub m: usize,
    /// Max neighbors per node on layer 0.
    pub m0: usize,
    pub ef_construction: usize,
    /// Level multiplier, `1 / ln(m)`.
    pub ml: f64,
}

impl HnswParams {
    pub fn new(m: usize, ef_construction: usize) -> Self {
        let m = m.max(2);
        Self {
            m,
            m0: m * 2,
            ef_construction: ef_construction.max(1),
            ml: 1.0 / (m as f64).ln(),
        }
    }
}

/// Min-heap entry for the candidate frontier.
#[derive(Clone, Copy)]
struct Candidate {
    node: u32,
    distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: smallest distance pops first
        other.distance.total_cmp(&self.distance)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap entry for the result set; the worst result sits on top.
#[derive(Clone, Copy)]
struct Found {
    node: u32,
    distance: f32,
}

impl PartialEq for Found {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Found {}

impl Ord for Found {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance.total_cmp(&other.distance)
    }
}

impl PartialOrd for Found {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Adjacency lists of one node, one list per layer it lives on.
#[derive(Debug, Clone, Encode, Decode)]
struct Node {
    layers: Vec<Vec<u32>>,
}

impl Node {
    fn new(top_layer: usize) -> Self {
        Self {
            layers: vec![Vec::new(); top_layer + 1],
        }
    }

    fn top_layer(&self) -> usize {
        self.layers.len().saturating_sub(1)
    }

    fn neighbors(&self, layer: usize) -> &[u32] {
        self.layers.get(layer).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Serialized form of a graph. The RNG is not persisted.
#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct GraphRecord {
    m: u32,
    m0: u32,
    ef_construction: u32,
    ml: f64,
    dimension: u32,
    vectors: Vec<f32>,
    nodes: Vec<Node>,
    entry_point: Option<u32>,
    max_layer: u32,
}

pub struct HnswGraph {
    params: HnswParams,
    dimension: usize,
    /// Unit vectors, flattened; node `i` owns `[i*dimension, (i+1)*dimension)`.
    vectors: Vec<f32>,
    nodes: Vec<Node>,
    entry_point: Option<u32>,
    max_layer: usize,
    rng: StdRng,
}

impl std::fmt::Debug for HnswGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswGraph")
            .field("params", &self.params)
            .field("dimension", &self.dimension)
            .field("len", &self.nodes.len())
            .field("entry_point", &self.entry_point)
            .field("max_layer", &self.max_layer)
            .finish()
    }
}

impl HnswGraph {
    pub fn new(dimension: usize, params: HnswParams, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            params,
            dimension,
            vectors: Vec::new(),
            nodes: Vec::new(),
            entry_point: None,
            max_layer: 0,
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn params(&self) -> HnswParams {
        self.params
    }

    /// Stored unit vector of node `node`.
    pub fn vector(&self, node: u32) -> &[f32] {
        let start = node as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    #[inline]
    fn distance(&self, query: &[f32], node: u32) -> f32 {
        1.0 - dot(query, self.vector(node))
    }

    fn random_layer(&mut self) -> usize {
        // random() is in [0, 1); flip it so ln never sees zero
        let r: f64 = 1.0 - self.rng.random::<f64>();
        (-r.ln() * self.params.ml).floor() as usize
    }

    /// Inserts a vector and returns its node number.
    ///
    /// The vector must already have the graph's dimension; it is normalized
    /// before being stored.
    pub fn insert(&mut self, vector: &[f32]) -> u32 {
        debug_assert_eq!(vector.len(), self.dimension);
        let node = self.nodes.len() as u32;
        let query = unit(vector);
        self.vectors.extend_from_slice(&query);

        let top_layer = self.random_layer();
        self.nodes.push(Node::new(top_layer));

        let Some(entry_point) = self.entry_point else {
            self.entry_point = Some(node);
            self.max_layer = top_layer;
            return node;
        };

        let mut current = entry_point;
        for layer in (top_layer + 1..=self.max_layer).rev() {
            current = self.greedy_closest(&query, current, layer);
        }

        let mut entry_points = vec![current];
        for layer in (0..=top_layer.min(self.max_layer)).rev() {
            let max_neighbors = self.max_neighbors(layer);
            let candidates =
                self.search_layer(&query, &entry_points, self.params.ef_construction, layer);
            let selected = self.select_neighbors(&candidates, max_neighbors);

            self.nodes[node as usize].layers[layer] = selected.iter().map(|&(n, _)| n).collect();

            for &(neighbor, _) in &selected {
                self.connect(neighbor, node, layer);
            }

            entry_points = candidates.iter().map(|&(n, _)| n).collect();
        }

        if top_layer > self.max_layer {
            self.max_layer = top_layer;
            self.entry_point = Some(node);
        }
        node
    }

    fn max_neighbors(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m0
        } else {
            self.params.m
        }
    }

    /// Adds `from -> to` on `layer`, pruning `from` back to its degree bound.
    fn connect(&mut self, from: u32, to: u32, layer: usize) {
        let max_neighbors = self.max_neighbors(layer);
        let Some(list) = self.nodes[from as usize].layers.get_mut(layer) else {
            return;
        };
        if list.contains(&to) {
            return;
        }
        list.push(to);
        if list.len() <= max_neighbors {
            return;
        }

        let base = self.vector(from).to_vec();
        let candidates: Vec<(u32, f32)> = self.nodes[from as usize].layers[layer]
            .iter()
            .map(|&n| (n, self.distance(&base, n)))
            .collect();
        let pruned = self.select_neighbors(&candidates, max_neighbors);
        self.nodes[from as usize].layers[layer] = pruned.into_iter().map(|(n, _)| n).collect();
    }

    fn greedy_closest(&self, query: &[f32], start: u32, layer: usize) -> u32 {
        self.search_layer(query, &[start], 1, layer)
            .first()
            .map_or(start, |&(n, _)| n)
    }

    /// Beam search on one layer; returns up to `ef` nodes by ascending distance.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[u32],
        ef: usize,
        layer: usize,
    ) -> Vec<(u32, f32)> {
        let ef = ef.clamp(1, self.nodes.len().max(1));
        let mut visited: HashSet<u32> =
            HashSet::with_capacity(ef.saturating_mul(4).min(self.nodes.len()));
        let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef);
        let mut results: BinaryHeap<Found> = BinaryHeap::with_capacity(ef + 1);

        for &ep in entry_points {
            if visited.insert(ep) {
                let distance = self.distance(query, ep);
                candidates.push(Candidate { node: ep, distance });
                results.push(Found { node: ep, distance });
                if results.len() > ef {
                    results.pop();
                }
            }
        }

        while let Some(current) = candidates.pop() {
            if results.len() >= ef
                && results
                    .peek()
                    .is_some_and(|worst| current.distance > worst.distance)
            {
                break;
            }

            for &neighbor in self.nodes[current.node as usize].neighbors(layer) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let distance = self.distance(query, neighbor);
                let dominated = results.len() >= ef
                    && results.peek().is_some_and(|worst| distance > worst.distance);
                if dominated {
                    continue;
                }
                candidates.push(Candidate {
                    node: neighbor,
                    distance,
                });
                results.push(Found {
                    node: neighbor,
                    distance,
                });
                if results.len() > ef {
                    results.pop();
                }
            }
        }

        let mut found: Vec<(u32, f32)> = results.into_iter().map(|r| (r.node, r.distance)).collect();
        found.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        found
    }

    /// Diversity heuristic: keep a candidate only if it is closer to the query
    /// than to every neighbor already kept, then top up with the closest rest.
    fn select_neighbors(&self, candidates: &[(u32, f32)], m: usize) -> Vec<(u32, f32)> {
        let mut sorted = candidates.to_vec();
        sorted.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let mut selected: Vec<(u32, f32)> = Vec::with_capacity(m);
        for &(candidate, distance) in &sorted {
            if selected.len() >= m {
                break;
            }
            let candidate_vec = self.vector(candidate);
            let diverse = selected
                .iter()
                .all(|&(kept, _)| 1.0 - dot(candidate_vec, self.vector(kept)) >= distance);
            if diverse {
                selected.push((candidate, distance));
            }
        }

        if selected.len() < m {
            for &(candidate, distance) in &sorted {
                if selected.len() >= m {
                    break;
                }
                if !selected.iter().any(|&(kept, _)| kept == candidate) {
                    selected.push((candidate, distance));
                }
            }
        }
        selected
    }

    /// Returns up to `k` `(node, similarity)` pairs, most similar first.
    ///
    /// `query` must be a unit vector of the graph's dimension.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(u32, f32)> {
        let Some(entry_point) = self.entry_point else {
            return Vec::new();
        };
        let k = k.min(self.nodes.len());
        if k == 0 {
            return Vec::new();
        }
        let ef = ef.max(k).min(self.nodes.len());

        let mut current = entry_point;
        for layer in (1..=self.max_layer).rev() {
            current = self.greedy_closest(query, current, layer);
        }

        self.search_layer(query, &[current], ef, 0)
            .into_iter()
            .take(k)
            .map(|(n, distance)| (n, 1.0 - distance))
            .collect()
    }

    /// Structural checks run on every imported graph.
    pub fn validate(&self) -> Result<(), VectorError> {
        let corrupt = |reason: String| Err(VectorError::IndexCorrupt { reason });
        let n = self.nodes.len();

        if self.dimension == 0 && n > 0 {
            return corrupt("graph has nodes but zero dimension".to_string());
        }
        if self.vectors.len() != n * self.dimension {
            return corrupt(format!(
                "expected {} vector values, found {}",
                n * self.dimension,
                self.vectors.len()
            ));
        }
        if self.vectors.iter().any(|v| !v.is_finite()) {
            return corrupt("vector data contains non-finite values".to_string());
        }
        if self.params.m < 2 || self.params.m0 < self.params.m || !self.params.ml.is_finite() {
            return corrupt("invalid graph parameters".to_string());
        }

        match self.entry_point {
            None if n > 0 => return corrupt("missing entry point".to_string()),
            Some(_) if n == 0 => return corrupt("entry point in empty graph".to_string()),
            Some(ep) => {
                let Some(entry) = self.nodes.get(ep as usize) else {
                    return corrupt(format!("entry point {ep} out of range"));
                };
                if entry.top_layer() != self.max_layer {
                    return corrupt("entry point is not on the top layer".to_string());
                }
            }
            None => {}
        }

        for (i, node) in self.nodes.iter().enumerate() {
            if node.layers.is_empty() || node.top_layer() > self.max_layer {
                return corrupt(format!("node {i} has invalid layer count"));
            }
            for (layer, neighbors) in node.layers.iter().enumerate() {
                if neighbors.len() > self.max_neighbors(layer) {
                    return corrupt(format!("node {i} exceeds degree bound on layer {layer}"));
                }
                for &neighbor in neighbors {
                    let Some(target) = self.nodes.get(neighbor as usize) else {
                        return corrupt(format!("node {i} links to missing node {neighbor}"));
                    };
                    if target.top_layer() < layer {
                        return corrupt(format!(
                            "node {i} links to node {neighbor} above its top layer"
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn to_record(&self) -> GraphRecord {
        GraphRecord {
            m: self.params.m as u32,
            m0: self.params.m0 as u32,
            ef_construction: self.params.ef_construction as u32,
            ml: self.params.ml,
            dimension: self.dimension as u32,
            vectors: self.vectors.clone(),
            nodes: self.nodes.clone(),
            entry_point: self.entry_point,
            max_layer: self.max_layer as u32,
        }
    }

    /// Rebuilds a graph from its record and validates it.
    pub(crate) fn from_record(record: GraphRecord) -> Result<Self, VectorError> {
        let graph = Self {
            params: HnswParams {
                m: record.m as usize,
                m0: record.m0 as usize,
                ef_construction: record.ef_construction as usize,
                ml: record.ml,
            },
            dimension: record.dimension as usize,
            vectors: record.vectors,
            nodes: record.nodes,
            entry_point: record.entry_point,
            max_layer: record.max_layer as usize,
            rng: StdRng::seed_from_u64(0),
        };
        graph.validate()?;
        Ok(graph)
    }
}

/// Normalized copy; zero vectors stay zero.
pub fn unit(vector: &[f32]) -> Vec<f32> {
    let length = norm(vector);
    if length > f32::EPSILON {
        vector.iter().map(|x| x / length).collect()
    } else {
        vec![0.0; vector.len()]
    }
}
