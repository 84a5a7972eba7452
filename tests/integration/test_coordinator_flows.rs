// Coordinator behavior: worker and inline equivalence, cancellation,
// the persistent cache and polling status.

use std::sync::Arc;

use tempfile::TempDir;
use vecscope::build::{ArtifactCache, CacheKey, FileCache};
use vecscope::{
    BuildCoordinator, BuildError, BuildOptions, BuildPhase, BuildState, BuildTarget,
    ConflictPolicy, ExecutionMode, KMeansConfig, Settings, VectorStore,
};

use crate::common::{clustered_store, random_store};

fn settings_with_cache(dir: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.index.seed = Some(3);
    settings.index.chunk_size = 64;
    settings.projection.seed = Some(3);
    settings.cache.dir = Some(dir.path().join("cache"));
    settings
}

#[tokio::test]
async fn worker_and_inline_builds_agree() {
    let store = Arc::new(random_store(150, 16, 1));
    let mut settings = Settings::default();
    settings.index.seed = Some(10);
    settings.cache.enabled = false;

    let worker = BuildCoordinator::new(&settings);
    let inline = BuildCoordinator::new(&settings);

    worker
        .start_index_build(Arc::clone(&store), worker.options())
        .wait()
        .await
        .unwrap();
    inline
        .start_index_build(Arc::clone(&store), BuildOptions::inline().with_cache(false))
        .wait()
        .await
        .unwrap();

    for (_, query) in store.iter().step_by(11) {
        assert_eq!(worker.search(query, 5), inline.search(query, 5));
    }
}

#[tokio::test]
async fn index_progress_is_reported_per_chunk() {
    let temp_dir = TempDir::new().unwrap();
    let mut settings = settings_with_cache(&temp_dir);
    settings.cache.enabled = false;
    let coordinator = BuildCoordinator::new(&settings);

    let mut handle = coordinator.start_index_build(
        Arc::new(random_store(200, 8, 2)),
        coordinator.options(),
    );
    let mut events = handle.take_progress().unwrap();
    let stats = handle.wait().await.unwrap();
    assert_eq!(stats.chunks, 4);

    let mut inserts = Vec::new();
    while let Some(event) = events.recv().await {
        assert_eq!(event.target, BuildTarget::Index);
        if event.phase == BuildPhase::Insert {
            inserts.push(event.completed);
        }
    }
    assert_eq!(inserts, vec![0, 64, 128, 192, 200]);
}

#[tokio::test]
async fn cancel_mid_build_never_exposes_partial_index() {
    let temp_dir = TempDir::new().unwrap();
    let mut settings = settings_with_cache(&temp_dir);
    settings.cache.enabled = false;
    settings.index.chunk_size = 32;
    let coordinator = BuildCoordinator::new(&settings);

    let small = random_store(100, 16, 3);
    coordinator
        .start_index_build(Arc::new(small.clone()), coordinator.options())
        .wait()
        .await
        .unwrap();
    let probe = small.get("v7").unwrap().to_vec();
    let expected = coordinator.search(&probe, 5);

    // Superset of the small store, so v7 stays its own nearest neighbor
    let mut large = small.clone();
    large.ingest_batch(random_store(3000, 16, 4).iter().map(|(id, v)| (format!("x{id}"), v.to_vec())));

    let mut handle = coordinator.start_index_build(Arc::new(large), coordinator.options());
    let mut events = handle.take_progress().unwrap();
    let _ = events.recv().await;
    handle.cancel();

    match handle.wait().await {
        Err(BuildError::Cancelled { target }) => {
            assert_eq!(target, BuildTarget::Index);
            assert_eq!(coordinator.index().len(), 100);
            assert_eq!(coordinator.search(&probe, 5), expected);
            assert_eq!(
                coordinator.take_outcome(BuildTarget::Index),
                Some(BuildState::Cancelled)
            );
        }
        Ok(_) => {
            // Finished before the token was observed
            assert_eq!(coordinator.index().len(), 3100);
            assert_eq!(coordinator.search(&probe, 1)[0].id, "v7");
        }
        Err(other) => panic!("unexpected build error: {other}"),
    }
}

#[tokio::test]
async fn file_cache_survives_coordinator_restart() {
    let temp_dir = TempDir::new().unwrap();
    let settings = settings_with_cache(&temp_dir);
    let store = Arc::new(random_store(120, 12, 5));

    let first = BuildCoordinator::new(&settings);
    let stats = first
        .start_index_build(Arc::clone(&store), first.options())
        .wait()
        .await
        .unwrap();
    assert!(!stats.cache_hit);

    let cache = FileCache::new(settings.cache.resolved_dir());
    let key = CacheKey::for_index(&store.fingerprint(), &settings.index.params());
    assert!(cache.path_for(&key).exists());

    let second = BuildCoordinator::new(&settings);
    let stats = second
        .start_index_build(Arc::clone(&store), second.options())
        .wait()
        .await
        .unwrap();
    assert!(stats.cache_hit);

    let query = store.get("v42").unwrap();
    assert_eq!(first.search(query, 5), second.search(query, 5));
}

#[tokio::test]
async fn corrupt_cache_file_triggers_rebuild() {
    let temp_dir = TempDir::new().unwrap();
    let settings = settings_with_cache(&temp_dir);
    let store = Arc::new(random_store(60, 8, 6));

    let cache = FileCache::new(settings.cache.resolved_dir());
    let key = CacheKey::for_index(&store.fingerprint(), &settings.index.params());
    cache.store(&key, b"VSIX garbage").unwrap();

    let coordinator = BuildCoordinator::new(&settings);
    let stats = coordinator
        .start_index_build(Arc::clone(&store), coordinator.options())
        .wait()
        .await
        .unwrap();

    assert!(!stats.cache_hit);
    assert_eq!(coordinator.search(store.get("v1").unwrap(), 1)[0].id, "v1");
    let repaired = cache.load(&key).unwrap().unwrap();
    assert!(repaired.len() > 40);
}

#[tokio::test]
async fn changed_store_misses_the_cache() {
    let temp_dir = TempDir::new().unwrap();
    let settings = settings_with_cache(&temp_dir);
    let coordinator = BuildCoordinator::new(&settings);

    let mut store = Arc::new(random_store(50, 8, 7));
    let snapshot = Arc::clone(&store);
    coordinator
        .start_index_build(snapshot, coordinator.options())
        .wait()
        .await
        .unwrap();

    // The build released its snapshot, so this mutates in place or copies
    Arc::make_mut(&mut store).ingest("extra", &[1.0; 8]);
    let stats = coordinator
        .start_index_build(Arc::clone(&store), coordinator.options())
        .wait()
        .await
        .unwrap();

    assert!(!stats.cache_hit);
    assert_eq!(coordinator.index().len(), 51);
}

#[tokio::test]
async fn projection_through_coordinator_is_cached() {
    let temp_dir = TempDir::new().unwrap();
    let settings = settings_with_cache(&temp_dir);
    let store = Arc::new(clustered_store(3, 20, 10, 8));

    let first = BuildCoordinator::new(&settings);
    let mut handle = first.start_projection(Arc::clone(&store), first.options());
    let mut events = handle.take_progress().unwrap();
    handle.wait().await.unwrap();

    let mut phases = Vec::new();
    while let Some(event) = events.recv().await {
        if phases.last() != Some(&event.phase) {
            phases.push(event.phase);
        }
    }
    for phase in [
        BuildPhase::Mean,
        BuildPhase::Covariance,
        BuildPhase::Eigen,
        BuildPhase::Project,
        BuildPhase::Scale,
    ] {
        assert!(phases.contains(&phase), "missing {phase}");
    }

    let second = BuildCoordinator::new(&settings);
    let stats = second
        .start_projection(Arc::clone(&store), second.options())
        .wait()
        .await
        .unwrap();
    assert!(stats.cache_hit);
    let (a, b) = (first.projection().unwrap(), second.projection().unwrap());
    assert_eq!(a.len(), b.len());
    for (p, q) in a.points().iter().zip(b.points()) {
        assert_eq!(p.id, q.id);
        assert!(p.position.iter().zip(&q.position).all(|(x, y)| (x - y).abs() < 1e-6));
    }
}

#[tokio::test]
async fn settings_choose_mode_and_policy() {
    let mut settings = Settings::default();
    settings.cache.enabled = false;
    settings.build.mode = ExecutionMode::Inline;
    settings.build.policy = ConflictPolicy::Reject;

    let coordinator = BuildCoordinator::new(&settings);
    let options = coordinator.options();
    assert_eq!(options.mode, ExecutionMode::Inline);
    assert_eq!(options.policy, ConflictPolicy::Reject);
    assert!(!options.use_cache);

    let handle = coordinator.start_index_build(Arc::new(random_store(30, 4, 9)), options);
    assert!(handle.is_finished());
    assert_eq!(coordinator.state(BuildTarget::Index), BuildState::Ready);
}

#[tokio::test]
async fn clustering_job_can_be_cancelled() {
    let coordinator = BuildCoordinator::default();
    let store = Arc::new(clustered_store(5, 20, 16, 10));
    let config = KMeansConfig::default().with_k(5).with_seed(Some(4));

    let result = coordinator
        .start_clustering(Arc::clone(&store), config, coordinator.options())
        .wait()
        .await
        .unwrap();
    assert_eq!(result.cluster_sizes().iter().sum::<usize>(), 100);

    let token = tokio_util::sync::CancellationToken::new();
    token.cancel();
    let cancelled = coordinator
        .start_clustering(store, config, coordinator.options().with_cancel_token(token))
        .wait()
        .await;
    assert_eq!(
        cancelled.unwrap_err(),
        BuildError::Cancelled {
            target: BuildTarget::Clustering
        }
    );
}

#[tokio::test]
async fn empty_store_build_leaves_index_absent() {
    let coordinator = BuildCoordinator::default();
    coordinator
        .start_index_build(Arc::new(VectorStore::new()), coordinator.options())
        .wait()
        .await
        .unwrap();

    assert!(!coordinator.index().is_built());
    assert!(coordinator.search(&[1.0, 0.0], 3).is_empty());
    assert_eq!(coordinator.state(BuildTarget::Index), BuildState::Ready);
}
