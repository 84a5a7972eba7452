// End-to-end behavior of the store, index, projection and clustering
// components used directly, without the coordinator.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vecscope::build::{BuildContext, BuildTarget};
use vecscope::vector::{IndexParams, suggest_k};
use vecscope::{AnnIndex, BuildError, Clusterer, KMeansConfig, Projector, VectorStore};

use crate::common::{clustered_store, random_store};

#[test]
fn self_query_returns_own_id_on_500_unit_vectors() {
    let store = random_store(500, 64, 42);
    let index = AnnIndex::new(IndexParams::default().with_seed(Some(1)), 64);
    index.build(&store, 200).unwrap();

    for id in ["v0", "v137", "v499"] {
        let hits = index.search(store.get(id).unwrap(), 10);
        assert_eq!(hits[0].id, id);
        assert!(hits[0].score.get() > 0.999, "self similarity {}", hits[0].score);
    }
}

#[test]
fn search_results_are_sorted_bounded_and_known() {
    let store = random_store(200, 16, 7);
    let index = AnnIndex::new(IndexParams::default().with_seed(Some(2)), 32);
    index.build(&store, 100).unwrap();

    let known: HashSet<&str> = store.ids().iter().map(String::as_str).collect();
    for (_, query) in store.iter().take(25) {
        let hits = index.search(query, 8);
        assert!(hits.len() <= 8);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(hits.iter().all(|h| known.contains(h.id.as_str())));
    }

    // Fewer vectors than requested
    let small = random_store(3, 16, 8);
    index.build(&small, 100).unwrap();
    assert_eq!(index.search(small.get("v1").unwrap(), 10).len(), 3);
}

#[test]
fn mixed_lengths_resolve_to_majority_dimension() {
    let mut store = VectorStore::new();
    let report = store.ingest_batch(vec![
        ("a", vec![0.5; 64]),
        ("b", vec![0.25; 64]),
        ("c", vec![1.0; 32]),
        ("d", vec![-0.5; 64]),
    ]);

    assert_eq!(store.dimension(), 64);
    assert_eq!(report.padded, 1);
    assert_eq!(report.truncated, 0);
    assert!(report.has_warnings());

    let padded = store.get("c").unwrap();
    assert_eq!(padded.len(), 64);
    assert!(padded[..32].iter().all(|&x| x == 1.0));
    assert!(padded[32..].iter().all(|&x| x == 0.0));
}

#[test]
fn malformed_input_is_repaired_or_dropped() {
    let mut store = VectorStore::new();
    store.ingest_batch(vec![
        ("ok".to_string(), vec![1.0, 2.0, 3.0]),
        (String::new(), vec![1.0, 2.0, 3.0]),
        ("empty".to_string(), Vec::new()),
        ("nan".to_string(), vec![f32::NAN, f32::INFINITY, 1.0]),
        ("long".to_string(), vec![1.0, 2.0, 3.0, 4.0]),
    ]);

    assert_eq!(store.len(), 3);
    assert!(store.iter().all(|(_, v)| v.len() == 3 && v.iter().all(|x| x.is_finite())));
    assert_eq!(store.get("nan").unwrap(), &[0.0, 0.0, 1.0]);

    let report = store.report();
    assert_eq!(report.dropped_empty_id, 1);
    assert_eq!(report.dropped_empty_vector, 1);
    assert_eq!(report.non_finite_fixed, 2);
    assert_eq!(report.truncated, 1);
}

#[test]
fn export_then_import_reproduces_results() {
    let store = random_store(300, 24, 11);
    let source = AnnIndex::new(IndexParams::default().with_seed(Some(5)), 48);
    source.build(&store, 200).unwrap();
    let bytes = source.export().unwrap();

    let restored = AnnIndex::new(IndexParams::default(), 48);
    assert!(restored.import(&bytes));
    assert_eq!(restored.len(), 300);

    for (_, query) in store.iter().step_by(17) {
        assert_eq!(source.search(query, 5), restored.search(query, 5));
    }
}

#[test]
fn corrupt_import_leaves_existing_index_untouched() {
    let store = random_store(100, 12, 13);
    let index = AnnIndex::new(IndexParams::default().with_seed(Some(6)), 32);
    index.build(&store, 100).unwrap();
    let before = index.snapshot().unwrap();
    let query = store.get("v9").unwrap();
    let expected = index.search(query, 5);

    let mut bytes = index.export().unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;

    assert!(!index.import(&bytes));
    assert!(!index.import(b"VSIX"));
    assert!(!index.import(&[]));
    assert!(Arc::ptr_eq(&before, &index.snapshot().unwrap()));
    assert_eq!(index.search(query, 5), expected);
}

#[test]
fn rebuild_keeps_top1_identity() {
    let store = clustered_store(6, 40, 32, 21);
    let first = AnnIndex::new(IndexParams::default().with_seed(Some(100)), 64);
    let second = AnnIndex::new(IndexParams::default().with_seed(Some(200)), 64);
    first.build(&store, 200).unwrap();
    second.build(&store, 200).unwrap();

    for (id, query) in store.iter().step_by(9) {
        let a = first.search(query, 1);
        let b = second.search(query, 1);
        assert_eq!(a[0].id, id);
        assert_eq!(a[0].id, b[0].id);
    }
}

#[test]
fn absent_index_returns_empty_results() {
    let index = AnnIndex::default();
    assert!(index.search(&[1.0, 0.0], 5).is_empty());

    index.build(&VectorStore::new(), 200).unwrap();
    assert!(!index.is_built());
    assert!(index.search(&[1.0, 0.0], 5).is_empty());
}

#[test]
fn cancelled_build_keeps_previous_index() {
    let store = random_store(120, 16, 31);
    let index = AnnIndex::new(IndexParams::default().with_seed(Some(9)).with_chunk_size(16), 32);
    index.build(&store, 64).unwrap();
    let before = index.snapshot().unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let ctx = BuildContext::new(BuildTarget::Index, token);
    let larger = random_store(400, 16, 32);
    let result = index.build_with(&larger, &index.params(), &ctx);

    assert_eq!(
        result.unwrap_err(),
        BuildError::Cancelled {
            target: BuildTarget::Index
        }
    );
    assert!(Arc::ptr_eq(&before, &index.snapshot().unwrap()));
    assert_eq!(index.search(store.get("v4").unwrap(), 1)[0].id, "v4");
}

#[test]
fn projection_stays_in_unit_cube() {
    let store = clustered_store(4, 30, 20, 41);
    let projection = Projector::default().project(&store);

    assert_eq!(projection.len(), store.len());
    assert_eq!(projection.meta().dimension, 20);
    assert_eq!(projection.meta().count, 120);
    for point in projection.points() {
        assert!(point.position.iter().all(|x| (-1.0..=1.0).contains(x)));
    }

    let explained = projection.meta().explained_variance;
    assert!(explained.iter().all(|v| (0.0..=1.0 + 1e-4).contains(v)));
    assert!(explained[0] + 1e-4 >= explained[1]);
}

#[test]
fn projection_of_empty_store_is_empty() {
    let projection = Projector::default().project(&VectorStore::new());
    assert!(projection.is_empty());
    assert_eq!(projection.meta().count, 0);
}

#[test]
fn cluster_100_vectors_twice_with_different_seeds() {
    let store = clustered_store(5, 20, 16, 51);
    let vectors: Vec<&[f32]> = store.iter().map(|(_, v)| v).collect();

    let runs: Vec<_> = [1, 2]
        .into_iter()
        .map(|seed| {
            let config = KMeansConfig::default().with_k(5).with_seed(Some(seed));
            Clusterer::new(config).cluster(&vectors).unwrap()
        })
        .collect();

    for result in &runs {
        assert_eq!(result.centroids.len(), 5);
        let used: HashSet<usize> = result.labels.iter().copied().collect();
        assert_eq!(used, (0..5).collect());
        assert!(
            result
                .inertia_history
                .windows(2)
                .all(|w| w[1] <= w[0] + 1e-4)
        );
    }
    assert!((runs[0].inertia - runs[1].inertia).abs() < 0.5);
}

#[test]
fn suggested_k_is_bounded() {
    assert_eq!(suggest_k(1), 3);
    assert_eq!(suggest_k(200), 10);
    assert_eq!(suggest_k(1_000_000), 24);
}
