//! Build phases, progress events and the per-job context.
//!
//! A [`BuildContext`] is handed to every long-running computation. Its
//! [`checkpoint`](BuildContext::checkpoint) is called between chunks, phases
//! and iterations; [`report`](BuildContext::report) emits a progress event
//! and mirrors it into the polled status.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::error::BuildError;

/// Artifact a build produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildTarget {
    Index,
    Projection,
    Clustering,
}

impl BuildTarget {
    /// First compute phase of this target's builds.
    pub fn initial_phase(self) -> BuildPhase {
        match self {
            Self::Index => BuildPhase::Insert,
            Self::Projection => BuildPhase::Mean,
            Self::Clustering => BuildPhase::Seed,
        }
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Index => "index",
            Self::Projection => "projection",
            Self::Clustering => "clustering",
        };
        f.write_str(name)
    }
}

/// Discrete step of a build. Every phase boundary is a cancellation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    CacheLookup,
    Insert,
    Mean,
    Covariance,
    Eigen,
    Project,
    Scale,
    Seed,
    Iterate,
    CacheWrite,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CacheLookup => "cache lookup",
            Self::Insert => "insert",
            Self::Mean => "mean",
            Self::Covariance => "covariance",
            Self::Eigen => "eigen",
            Self::Project => "project",
            Self::Scale => "scale",
            Self::Seed => "seed",
            Self::Iterate => "iterate",
            Self::CacheWrite => "cache write",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub target: BuildTarget,
    pub phase: BuildPhase,
    pub completed: usize,
    pub total: usize,
}

impl ProgressEvent {
    /// Completion of the current phase in percent.
    pub fn percent(&self) -> f32 {
        if self.total == 0 {
            return 100.0;
        }
        (self.completed.min(self.total) as f32 / self.total as f32) * 100.0
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {}/{} ({:.0}%)",
            self.target,
            self.phase,
            self.completed,
            self.total,
            self.percent()
        )
    }
}

/// Polled state of one build target.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BuildState {
    #[default]
    Idle,
    Building {
        phase: BuildPhase,
        completed: usize,
        total: usize,
    },
    Ready,
    Cancelled,
    Failed {
        phase: BuildPhase,
        message: String,
    },
}

impl BuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Cancelled | Self::Failed { .. })
    }

    pub fn is_building(&self) -> bool {
        matches!(self, Self::Building { .. })
    }
}

/// Cancellation, progress and status plumbing for one running job.
pub struct BuildContext {
    target: BuildTarget,
    cancel: CancellationToken,
    progress: Option<UnboundedSender<ProgressEvent>>,
    status: Option<Arc<Mutex<BuildState>>>,
    phase: Mutex<Option<BuildPhase>>,
}

impl BuildContext {
    pub fn new(target: BuildTarget, cancel: CancellationToken) -> Self {
        Self {
            target,
            cancel,
            progress: None,
            status: None,
            phase: Mutex::new(None),
        }
    }

    /// A context nobody observes or cancels, for direct synchronous calls.
    pub fn detached(target: BuildTarget) -> Self {
        Self::new(target, CancellationToken::new())
    }

    pub fn with_progress(mut self, sender: UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn with_status(mut self, status: Arc<Mutex<BuildState>>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn target(&self) -> BuildTarget {
        self.target
    }

    /// Last phase reported, if any.
    pub fn phase(&self) -> Option<BuildPhase> {
        *self.phase.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns `Cancelled` once the job's token has fired.
    pub fn checkpoint(&self) -> Result<(), BuildError> {
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled {
                target: self.target,
            });
        }
        Ok(())
    }

    /// Records progress within `phase` and forwards it to any listener.
    pub fn report(&self, phase: BuildPhase, completed: usize, total: usize) {
        *self.phase.lock() = Some(phase);
        if let Some(status) = &self.status {
            *status.lock() = BuildState::Building {
                phase,
                completed,
                total,
            };
        }
        if let Some(progress) = &self.progress {
            // Receiver may have been dropped; progress is advisory
            let _ = progress.send(ProgressEvent {
                target: self.target,
                phase,
                completed,
                total,
            });
        }
    }
}

/// Statistics collected during a build.
#[derive(Debug, Clone)]
pub struct BuildStats {
    pub target: BuildTarget,

    /// Number of vectors consumed by the build
    pub vectors_processed: usize,

    /// Number of insertion chunks (index builds only)
    pub chunks: usize,

    /// Whether the artifact came from the cache
    pub cache_hit: bool,

    pub elapsed: Duration,

    start_time: Option<Instant>,
}

impl BuildStats {
    /// Create new stats and start timing
    pub fn new(target: BuildTarget) -> Self {
        Self {
            target,
            vectors_processed: 0,
            chunks: 0,
            cache_hit: false,
            elapsed: Duration::ZERO,
            start_time: Some(Instant::now()),
        }
    }

    /// Stop timing and record elapsed time
    pub fn stop_timing(&mut self) {
        if let Some(start) = self.start_time.take() {
            self.elapsed = start.elapsed();
        }
    }

    /// Vectors per second, zero if nothing was timed.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.vectors_processed as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for BuildStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Build Complete ({}):", self.target)?;
        writeln!(f, "  Vectors: {}", self.vectors_processed)?;
        if self.chunks > 0 {
            writeln!(f, "  Chunks: {}", self.chunks)?;
        }
        writeln!(f, "  Cache hit: {}", if self.cache_hit { "yes" } else { "no" })?;
        write!(f, "  Time elapsed: {:.2}s", self.elapsed.as_secs_f64())?;
        if !self.cache_hit && self.vectors_processed > 0 && self.throughput() > 0.0 {
            write!(f, "\n  Performance: {:.0} vectors/second", self.throughput())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_handles_empty_total() {
        let event = ProgressEvent {
            target: BuildTarget::Index,
            phase: BuildPhase::Insert,
            completed: 0,
            total: 0,
        };
        assert_eq!(event.percent(), 100.0);

        let half = ProgressEvent {
            completed: 512,
            total: 1024,
            ..event
        };
        assert_eq!(half.percent(), 50.0);
    }

    #[test]
    fn test_checkpoint_observes_cancellation() {
        let token = CancellationToken::new();
        let ctx = BuildContext::new(BuildTarget::Projection, token.clone());
        assert!(ctx.checkpoint().is_ok());

        token.cancel();
        assert_eq!(
            ctx.checkpoint(),
            Err(BuildError::Cancelled {
                target: BuildTarget::Projection
            })
        );
    }

    #[test]
    fn test_report_updates_status_and_channel() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let status = Arc::new(Mutex::new(BuildState::Idle));
        let ctx = BuildContext::detached(BuildTarget::Index)
            .with_progress(tx)
            .with_status(status.clone());

        ctx.report(BuildPhase::Insert, 3, 10);

        assert_eq!(ctx.phase(), Some(BuildPhase::Insert));
        assert_eq!(
            *status.lock(),
            BuildState::Building {
                phase: BuildPhase::Insert,
                completed: 3,
                total: 10
            }
        );
        let event = rx.try_recv().unwrap();
        assert_eq!(event.completed, 3);
        assert_eq!(event.to_string(), "index insert: 3/10 (30%)");
    }

    #[test]
    fn test_report_survives_dropped_receiver() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        let ctx = BuildContext::detached(BuildTarget::Index).with_progress(tx);
        ctx.report(BuildPhase::Insert, 1, 2);
    }

    #[test]
    fn test_stats_display() {
        let mut stats = BuildStats::new(BuildTarget::Index);
        stats.vectors_processed = 2048;
        stats.chunks = 2;
        stats.elapsed = Duration::from_secs(2);

        let text = stats.to_string();
        assert!(text.contains("Vectors: 2048"));
        assert!(text.contains("Chunks: 2"));
        assert!(text.contains("1024 vectors/second"));
    }
}
