//! Shared fixtures for integration tests.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vecscope::VectorStore;

/// Random unit vector with components drawn from [-1, 1).
pub fn random_unit(rng: &mut StdRng, dimension: usize) -> Vec<f32> {
    let v: Vec<f32> = (0..dimension)
        .map(|_| rng.random::<f32>() * 2.0 - 1.0)
        .collect();
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(f32::EPSILON);
    v.into_iter().map(|x| x / norm).collect()
}

/// Store of `n` random unit vectors with ids `v0..v{n-1}`.
pub fn random_store(n: usize, dimension: usize, seed: u64) -> VectorStore {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut store = VectorStore::new();
    store.ingest_batch((0..n).map(|i| (format!("v{i}"), random_unit(&mut rng, dimension))));
    store
}

/// `clusters` well separated groups of `per_cluster` points around random
/// unit centers.
pub fn clustered_store(clusters: usize, per_cluster: usize, dimension: usize, seed: u64) -> VectorStore {
    let mut rng = StdRng::seed_from_u64(seed);
    let centers: Vec<Vec<f32>> = (0..clusters)
        .map(|_| random_unit(&mut rng, dimension))
        .collect();

    let mut store = VectorStore::new();
    let mut batch = Vec::with_capacity(clusters * per_cluster);
    for (c, center) in centers.iter().enumerate() {
        for i in 0..per_cluster {
            let noise = random_unit(&mut rng, dimension);
            let point: Vec<f32> = center
                .iter()
                .zip(&noise)
                .map(|(a, b)| a + 0.05 * b)
                .collect();
            batch.push((format!("c{c}-{i}"), point));
        }
    }
    store.ingest_batch(batch);
    store
}
