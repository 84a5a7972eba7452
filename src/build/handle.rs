//! Execution modes, conflict policies and the awaitable build handle.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::progress::{BuildTarget, ProgressEvent};
use crate::error::{BuildError, BuildResult};

/// Where a build runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// On the caller's thread; the handle is resolved on return.
    Inline,
    /// On tokio's blocking pool. Falls back to inline outside a runtime.
    #[default]
    Worker,
}

/// What a build request does while another build of the same target is in
/// flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Wait for the running build, then run.
    #[default]
    Queue,
    /// Cancel every in-flight build of the target, then run.
    Replace,
    /// Fail immediately with [`BuildError::Busy`].
    Reject,
}

/// Per-request build options.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub mode: ExecutionMode,
    pub policy: ConflictPolicy,
    /// Consult and populate the artifact cache.
    pub use_cache: bool,
    /// Parent token; cancelling it cancels the build.
    pub cancel: Option<CancellationToken>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            policy: ConflictPolicy::default(),
            use_cache: true,
            cancel: None,
        }
    }
}

impl BuildOptions {
    pub fn inline() -> Self {
        Self::default().with_mode(ExecutionMode::Inline)
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

enum Outcome<T> {
    Ready(BuildResult<T>),
    Running(JoinHandle<BuildResult<T>>),
}

/// Handle to one build: await its result, cancel it, or read its progress.
pub struct BuildHandle<T> {
    target: BuildTarget,
    cancel: CancellationToken,
    progress: Option<UnboundedReceiver<ProgressEvent>>,
    outcome: Outcome<T>,
}

impl<T> std::fmt::Debug for BuildHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildHandle")
            .field("target", &self.target)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<T> BuildHandle<T> {
    pub(crate) fn ready(
        target: BuildTarget,
        cancel: CancellationToken,
        progress: Option<UnboundedReceiver<ProgressEvent>>,
        result: BuildResult<T>,
    ) -> Self {
        Self {
            target,
            cancel,
            progress,
            outcome: Outcome::Ready(result),
        }
    }

    pub(crate) fn running(
        target: BuildTarget,
        cancel: CancellationToken,
        progress: Option<UnboundedReceiver<ProgressEvent>>,
        join: JoinHandle<BuildResult<T>>,
    ) -> Self {
        Self {
            target,
            cancel,
            progress,
            outcome: Outcome::Running(join),
        }
    }

    pub fn target(&self) -> BuildTarget {
        self.target
    }

    /// Requests cooperative cancellation. The build stops at its next
    /// checkpoint and resolves to [`BuildError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Takes the progress stream. Inline builds have already queued every
    /// event by the time the handle is returned.
    pub fn take_progress(&mut self) -> Option<UnboundedReceiver<ProgressEvent>> {
        self.progress.take()
    }

    pub fn is_finished(&self) -> bool {
        match &self.outcome {
            Outcome::Ready(_) => true,
            Outcome::Running(join) => join.is_finished(),
        }
    }

    /// Waits for the build to finish.
    pub async fn wait(self) -> BuildResult<T> {
        match self.outcome {
            Outcome::Ready(result) => result,
            Outcome::Running(join) => match join.await {
                Ok(result) => result,
                Err(e) => Err(BuildError::Failed {
                    target: self.target,
                    phase: self.target.initial_phase(),
                    message: format!("build task did not complete: {e}"),
                }),
            },
        }
    }
}
