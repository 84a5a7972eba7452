//! Single-flight build coordination for the index and the projection.
//!
//! Every build runs under a per-target gate, so at most one build mutates a
//! given artifact at a time. Artifacts are published wholesale only after a
//! build succeeds; cancellation and failures leave the previous artifact in
//! place.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;

use super::cache::{ArtifactCache, CacheKey, FileCache};
use super::handle::{BuildHandle, BuildOptions, ConflictPolicy, ExecutionMode};
use super::progress::{
    BuildContext, BuildPhase, BuildState, BuildStats, BuildTarget, ProgressEvent,
};
use crate::config::Settings;
use crate::error::{BuildError, BuildResult};
use crate::vector::{
    AnnIndex, BuiltIndex, Clusterer, ClusteringError, IndexParams, KMeansConfig, KMeansResult,
    Projection, Projector, SearchHit, VectorStore, build_chunked,
};

/// Scheduling state of one target.
#[derive(Default)]
struct TargetSlot {
    /// Held for the whole run of an exclusive build.
    gate: Mutex<()>,
    /// Builds started and not yet finished, in arrival order.
    inflight: Mutex<Vec<(u64, CancellationToken)>>,
    status: Arc<Mutex<BuildState>>,
}

struct Inner {
    index: AnnIndex,
    projection: RwLock<Option<Arc<Projection>>>,
    index_slot: TargetSlot,
    projection_slot: TargetSlot,
    clustering_slot: TargetSlot,
    cache: Option<Arc<dyn ArtifactCache>>,
    projector: Projector,
    kmeans: KMeansConfig,
    defaults: BuildOptions,
    next_job: AtomicU64,
}

/// Owns the published index and projection and serializes their rebuilds.
///
/// Cloning is cheap and yields a handle to the same coordinator.
#[derive(Clone)]
pub struct BuildCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BuildCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildCoordinator")
            .field("index", &self.inner.index)
            .field("projection", &self.inner.projection.read().is_some())
            .field("cache", &self.inner.cache.is_some())
            .finish()
    }
}

impl Default for BuildCoordinator {
    fn default() -> Self {
        Self::with_cache(&Settings::default(), None)
    }
}

impl BuildCoordinator {
    /// Creates a coordinator with a file cache when caching is enabled.
    pub fn new(settings: &Settings) -> Self {
        let cache = settings.cache.enabled.then(|| {
            Arc::new(FileCache::new(settings.cache.resolved_dir())) as Arc<dyn ArtifactCache>
        });
        Self::with_cache(settings, cache)
    }

    /// Creates a coordinator backed by `cache`.
    pub fn with_cache(settings: &Settings, cache: Option<Arc<dyn ArtifactCache>>) -> Self {
        let defaults = BuildOptions {
            mode: settings.build.mode,
            policy: settings.build.policy,
            use_cache: settings.cache.enabled,
            cancel: None,
        };
        Self {
            inner: Arc::new(Inner {
                index: AnnIndex::new(settings.index.params(), settings.index.ef_search),
                projection: RwLock::new(None),
                index_slot: TargetSlot::default(),
                projection_slot: TargetSlot::default(),
                clustering_slot: TargetSlot::default(),
                cache,
                projector: settings.projection.projector(),
                kmeans: settings.clustering.kmeans(),
                defaults,
                next_job: AtomicU64::new(1),
            }),
        }
    }

    /// Options built from the settings this coordinator was created with.
    pub fn options(&self) -> BuildOptions {
        self.inner.defaults.clone()
    }

    pub fn kmeans_config(&self) -> KMeansConfig {
        self.inner.kmeans
    }

    /// The published index. Readers may query it at any time.
    pub fn index(&self) -> &AnnIndex {
        &self.inner.index
    }

    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        self.inner.index.search(query, k)
    }

    /// The published projection.
    pub fn projection(&self) -> Option<Arc<Projection>> {
        self.inner.projection.read().clone()
    }

    /// Latest state of `target`, mirroring its progress events.
    ///
    /// Clustering jobs may overlap. Their target only turns terminal once
    /// the last of them has finished.
    pub fn state(&self, target: BuildTarget) -> BuildState {
        self.inner.slot(target).status.lock().clone()
    }

    /// Consumes a terminal state, resetting the target to `Idle`.
    pub fn take_outcome(&self, target: BuildTarget) -> Option<BuildState> {
        let mut status = self.inner.slot(target).status.lock();
        if status.is_terminal() {
            Some(std::mem::take(&mut *status))
        } else {
            None
        }
    }

    /// True while any build of `target` is running or queued.
    pub fn is_building(&self, target: BuildTarget) -> bool {
        !self.inner.slot(target).inflight.lock().is_empty()
    }

    /// Cancels every running or queued build of `target`.
    pub fn cancel(&self, target: BuildTarget) {
        for (_, token) in self.inner.slot(target).inflight.lock().iter() {
            token.cancel();
        }
    }

    /// Builds the index from `store` with the configured parameters.
    pub fn start_index_build(
        &self,
        store: Arc<VectorStore>,
        options: BuildOptions,
    ) -> BuildHandle<BuildStats> {
        let params = self.inner.index.params();
        self.start_index_build_with(store, params, options)
    }

    /// Builds the index from `store` with explicit parameters.
    pub fn start_index_build_with(
        &self,
        store: Arc<VectorStore>,
        params: IndexParams,
        options: BuildOptions,
    ) -> BuildHandle<BuildStats> {
        let use_cache = options.use_cache;
        self.launch(BuildTarget::Index, options, true, move |inner, ctx| {
            inner.build_index(&store, &params, use_cache, ctx)
        })
    }

    /// Computes and publishes the projection of `store`.
    pub fn start_projection(
        &self,
        store: Arc<VectorStore>,
        options: BuildOptions,
    ) -> BuildHandle<BuildStats> {
        let use_cache = options.use_cache;
        self.launch(BuildTarget::Projection, options, true, move |inner, ctx| {
            inner.build_projection(&store, use_cache, ctx)
        })
    }

    /// Clusters `store`. Clustering results are returned, not published, so
    /// these jobs are not serialized against each other.
    pub fn start_clustering(
        &self,
        store: Arc<VectorStore>,
        config: KMeansConfig,
        options: BuildOptions,
    ) -> BuildHandle<KMeansResult> {
        self.launch(BuildTarget::Clustering, options, false, move |_, ctx| {
            Clusterer::new(config)
                .cluster_store(&store, ctx)
                .map_err(|e| clustering_failure(e, ctx))
        })
    }

    fn launch<T, F>(
        &self,
        target: BuildTarget,
        options: BuildOptions,
        exclusive: bool,
        job: F,
    ) -> BuildHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner, &BuildContext) -> BuildResult<T> + Send + 'static,
    {
        let token = options
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let (tx, rx) = unbounded_channel();
        let job_id = self.inner.next_job.fetch_add(1, Ordering::Relaxed);

        {
            let mut inflight = self.inner.slot(target).inflight.lock();
            if exclusive {
                match options.policy {
                    ConflictPolicy::Reject if !inflight.is_empty() => {
                        tracing::debug!(%target, "rejecting build while another is in flight");
                        return BuildHandle::ready(
                            target,
                            token,
                            Some(rx),
                            Err(BuildError::Busy { target }),
                        );
                    }
                    ConflictPolicy::Replace => {
                        for (_, running) in inflight.iter() {
                            running.cancel();
                        }
                    }
                    _ => {}
                }
            }
            inflight.push((job_id, token.clone()));
        }

        let inner = Arc::clone(&self.inner);
        let job_token = token.clone();
        let run = move || inner.run(target, job_id, exclusive, job_token, tx, job);

        if options.mode == ExecutionMode::Worker {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    return BuildHandle::running(target, token, Some(rx), runtime.spawn_blocking(run));
                }
                Err(_) => {
                    tracing::warn!(%target, "no async runtime available, building inline");
                }
            }
        }
        BuildHandle::ready(target, token, Some(rx), run())
    }
}

impl Inner {
    fn slot(&self, target: BuildTarget) -> &TargetSlot {
        match target {
            BuildTarget::Index => &self.index_slot,
            BuildTarget::Projection => &self.projection_slot,
            BuildTarget::Clustering => &self.clustering_slot,
        }
    }

    /// Runs one job to completion and records its terminal state.
    fn run<T, F>(
        &self,
        target: BuildTarget,
        job_id: u64,
        exclusive: bool,
        token: CancellationToken,
        progress: UnboundedSender<ProgressEvent>,
        job: F,
    ) -> BuildResult<T>
    where
        F: FnOnce(&Inner, &BuildContext) -> BuildResult<T>,
    {
        let slot = self.slot(target);
        let _gate = exclusive.then(|| slot.gate.lock());

        let ctx = BuildContext::new(target, token)
            .with_progress(progress)
            .with_status(Arc::clone(&slot.status));
        let started = Instant::now();

        let result = if ctx.is_cancelled() {
            Err(BuildError::Cancelled { target })
        } else {
            tracing::info!(%target, job = job_id, "build started");
            catch_unwind(AssertUnwindSafe(|| job(self, &ctx))).unwrap_or_else(|panic| {
                Err(BuildError::Failed {
                    target,
                    phase: ctx.phase().unwrap_or(target.initial_phase()),
                    message: panic_message(panic.as_ref()),
                })
            })
        };

        {
            let mut inflight = slot.inflight.lock();
            inflight.retain(|(id, _)| *id != job_id);
            // Overlapping jobs share one status; the last one out sets it.
            if exclusive || inflight.is_empty() {
                *slot.status.lock() = match &result {
                    Ok(_) => BuildState::Ready,
                    Err(BuildError::Failed { phase, message, .. }) => BuildState::Failed {
                        phase: *phase,
                        message: message.clone(),
                    },
                    Err(BuildError::Cancelled { .. } | BuildError::Busy { .. }) => {
                        BuildState::Cancelled
                    }
                };
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::info!(%target, job = job_id, elapsed_ms, "build finished"),
            Err(BuildError::Failed { phase, message, .. }) => {
                tracing::error!(%target, job = job_id, %phase, %message, "build failed")
            }
            Err(e) => tracing::info!(%target, job = job_id, elapsed_ms, "{e}"),
        }
        result
    }

    fn build_index(
        &self,
        store: &VectorStore,
        params: &IndexParams,
        use_cache: bool,
        ctx: &BuildContext,
    ) -> BuildResult<BuildStats> {
        let mut stats = BuildStats::new(BuildTarget::Index);
        stats.vectors_processed = store.len();

        let cache = self.cache.as_deref().filter(|_| use_cache && !store.is_empty());
        let key = cache.map(|_| CacheKey::for_index(&store.fingerprint(), params));

        if let (Some(cache), Some(key)) = (cache, &key) {
            ctx.report(BuildPhase::CacheLookup, 0, 1);
            let cached = load_cached(cache, key, |bytes| {
                BuiltIndex::from_bytes(bytes).map_err(|e| e.to_string())
            });
            ctx.report(BuildPhase::CacheLookup, 1, 1);
            if let Some(index) = cached {
                self.index.publish(Some(Arc::new(index)));
                stats.cache_hit = true;
                stats.stop_timing();
                return Ok(stats);
            }
            ctx.checkpoint()?;
        }

        let built = build_chunked(store, params, ctx)?.map(Arc::new);
        stats.chunks = store.len().div_ceil(params.chunk_size.max(1));
        self.index.publish(built.clone());

        if let (Some(cache), Some(key), Some(index)) = (cache, &key, &built) {
            ctx.report(BuildPhase::CacheWrite, 0, 1);
            match index.to_bytes() {
                Ok(bytes) => write_cached(cache, key, &bytes),
                Err(e) => tracing::warn!(%key, error = %e, "could not serialize index for cache"),
            }
            ctx.report(BuildPhase::CacheWrite, 1, 1);
        }

        stats.stop_timing();
        Ok(stats)
    }

    fn build_projection(
        &self,
        store: &VectorStore,
        use_cache: bool,
        ctx: &BuildContext,
    ) -> BuildResult<BuildStats> {
        let mut stats = BuildStats::new(BuildTarget::Projection);
        stats.vectors_processed = store.len();

        let cache = self.cache.as_deref().filter(|_| use_cache && !store.is_empty());
        let key = cache.map(|_| CacheKey::for_projection(&store.fingerprint(), &self.projector));

        if let (Some(cache), Some(key)) = (cache, &key) {
            ctx.report(BuildPhase::CacheLookup, 0, 1);
            let cached = load_cached(cache, key, |bytes| {
                let json = std::str::from_utf8(bytes).map_err(|e| e.to_string())?;
                Projection::from_json(json).map_err(|e| e.to_string())
            });
            ctx.report(BuildPhase::CacheLookup, 1, 1);
            if let Some(projection) = cached {
                *self.projection.write() = Some(Arc::new(projection));
                stats.cache_hit = true;
                stats.stop_timing();
                return Ok(stats);
            }
            ctx.checkpoint()?;
        }

        let projection = Arc::new(self.projector.project_with(store, ctx)?);
        *self.projection.write() = Some(Arc::clone(&projection));

        if let (Some(cache), Some(key)) = (cache, &key) {
            ctx.report(BuildPhase::CacheWrite, 0, 1);
            match projection.to_json() {
                Ok(json) => write_cached(cache, key, json.as_bytes()),
                Err(e) => {
                    tracing::warn!(%key, error = %e, "could not serialize projection for cache")
                }
            }
            ctx.report(BuildPhase::CacheWrite, 1, 1);
        }

        stats.stop_timing();
        Ok(stats)
    }
}

/// Loads and decodes a cache entry. Misses, I/O errors and undecodable
/// entries all fall through to a rebuild.
fn load_cached<A>(
    cache: &dyn ArtifactCache,
    key: &CacheKey,
    decode: impl FnOnce(&[u8]) -> Result<A, String>,
) -> Option<A> {
    match cache.load(key) {
        Ok(Some(bytes)) => match decode(&bytes) {
            Ok(artifact) => {
                tracing::debug!(%key, "cache hit");
                Some(artifact)
            }
            Err(reason) => {
                tracing::warn!(%key, %reason, "discarding unreadable cache entry");
                None
            }
        },
        Ok(None) => {
            tracing::debug!(%key, "cache miss");
            None
        }
        Err(e) => {
            tracing::warn!(%key, error = %e, "cache lookup failed");
            None
        }
    }
}

fn write_cached(cache: &dyn ArtifactCache, key: &CacheKey, bytes: &[u8]) {
    match cache.store(key, bytes) {
        Ok(()) => tracing::debug!(%key, bytes = bytes.len(), "cached artifact"),
        Err(e) => tracing::warn!(%key, error = %e, "cache write-back failed"),
    }
}

fn clustering_failure(error: ClusteringError, ctx: &BuildContext) -> BuildError {
    match error {
        ClusteringError::Interrupted(inner) => inner,
        other => BuildError::Failed {
            target: BuildTarget::Clustering,
            phase: ctx.phase().unwrap_or(BuildPhase::Seed),
            message: other.to_string(),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "build panicked".to_string()
    }
}
