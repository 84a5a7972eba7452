//! Performance benchmarks for index construction, search and the other
//! derived artifacts.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use vecscope::vector::IndexParams;
use vecscope::{AnnIndex, Clusterer, KMeansConfig, Projector, VectorStore};

fn create_store(count: usize, dimension: usize) -> VectorStore {
    let mut rng = StdRng::seed_from_u64(42);
    let mut store = VectorStore::new();
    store.ingest_batch((0..count).map(|i| {
        let v: Vec<f32> = (0..dimension).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect();
        (format!("v{i}"), v)
    }));
    store
}

fn bench_index_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_build");
    group.sample_size(10);
    let store = create_store(2000, 64);

    for ef_construction in [50, 200] {
        group.bench_with_input(
            BenchmarkId::from_parameter(ef_construction),
            &ef_construction,
            |b, &efc| {
                let index = AnnIndex::new(IndexParams::default().with_seed(Some(1)), 64);
                b.iter(|| index.build(black_box(&store), efc).unwrap());
            },
        );
    }
    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let store = create_store(5000, 64);
    let index = AnnIndex::new(IndexParams::default().with_seed(Some(1)), 64);
    index.build(&store, 200).unwrap();
    let queries: Vec<Vec<f32>> = store.iter().step_by(50).map(|(_, v)| v.to_vec()).collect();

    let mut group = c.benchmark_group("search_top10");
    for ef_search in [16, 64, 256] {
        index.set_ef_search(ef_search);
        group.bench_with_input(BenchmarkId::from_parameter(ef_search), &ef_search, |b, _| {
            b.iter(|| {
                for query in &queries {
                    black_box(index.search(black_box(query), 10));
                }
            });
        });
    }
    group.finish();
}

fn bench_projection_and_clustering(c: &mut Criterion) {
    let store = create_store(2000, 64);

    c.bench_function("project_2000x64", |b| {
        let projector = Projector::default().with_seed(Some(7));
        b.iter(|| black_box(projector.project(black_box(&store))));
    });

    c.bench_function("kmeans_2000x64_k8", |b| {
        let vectors: Vec<&[f32]> = store.iter().map(|(_, v)| v).collect();
        let clusterer = Clusterer::new(KMeansConfig::default().with_k(8).with_seed(Some(7)));
        b.iter(|| black_box(clusterer.cluster(black_box(&vectors)).unwrap()));
    });
}

fn bench_export_import(c: &mut Criterion) {
    let store = create_store(2000, 64);
    let index = AnnIndex::new(IndexParams::default().with_seed(Some(1)), 64);
    index.build(&store, 100).unwrap();
    let bytes = index.export().unwrap();

    c.bench_function("export_2000x64", |b| {
        b.iter(|| black_box(index.export().unwrap()));
    });
    c.bench_function("import_2000x64", |b| {
        let target = AnnIndex::default();
        b.iter(|| assert!(target.import(black_box(&bytes))));
    });
}

criterion_group!(
    benches,
    bench_index_build,
    bench_search,
    bench_projection_and_clustering,
    bench_export_import
);
criterion_main!(benches);
