//! Build orchestration.
//!
//! This module provides:
//!
//! - [`BuildExecutor`]: submit a build execution and read its status
//! - [`BuildOrchestrator`]: drive one execution to a terminal state
//! - [`kaniko::KanikoExecutor`]: executor running cluster jobs
//! - [`memory::InMemoryBuildExecutor`]: scriptable executor for testing
//!
//! The orchestrator never retries. Executor failures, timeouts and lost
//! executions all become a [`BuildFailure`] that the reconciler records.

pub mod descriptor;
pub mod kaniko;
pub mod memory;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use dockyard_core::{ArtifactIdentity, StorageBackend};

use crate::error::{Error, Result};
use crate::metrics::PipelineMetrics;
use crate::template::image_ref;

use descriptor::find_descriptor;

/// Consecutive status errors tolerated before the execution is given up.
const MAX_STATUS_ERRORS: u32 = 3;

/// Largest archive downloaded to locate its build descriptor (256 MiB).
pub const DEFAULT_PROBE_LIMIT: u64 = 256 * 1024 * 1024;

/// Describes one build for the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTask {
    /// Artifact being built.
    pub identity: ArtifactIdentity,
    /// Object path in the bucket.
    pub source_path: String,
    /// Fully qualified archive location the executor fetches.
    pub source_url: String,
    /// `<application>:<version>`.
    pub image_tag: String,
    /// Destination, `<registry>/<application>:<version>`.
    pub image_ref: String,
    /// Directory inside the archive holding the build descriptor, if not the root.
    pub context_sub_path: Option<String>,
    /// Build descriptor file name when it is not exactly `Dockerfile`.
    pub dockerfile: Option<String>,
}

impl BuildTask {
    /// Creates a task for `identity`, with the archive at `source_url`.
    #[must_use]
    pub fn new(identity: &ArtifactIdentity, registry_url: &str, source_url: impl Into<String>) -> Self {
        Self {
            identity: identity.clone(),
            source_path: identity.source_path().to_string(),
            source_url: source_url.into(),
            image_tag: identity.image_tag(),
            image_ref: image_ref(registry_url, identity),
            context_sub_path: None,
            dockerfile: None,
        }
    }
}

/// Opaque reference to a submitted execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionHandle(pub String);

impl std::fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status reported by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Not finished.
    Running,
    /// Image pushed.
    Succeeded,
    /// Execution failed.
    Failed {
        /// Executor-supplied reason.
        reason: String,
    },
}

/// The out-of-process system that turns an archive into a pushed image.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Submits an execution for `task`.
    async fn submit(&self, task: &BuildTask) -> Result<ExecutionHandle>;

    /// Reads the status of a submitted execution.
    async fn status(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus>;
}

/// A build that finished successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    /// Pushed image reference.
    pub image_ref: String,
    /// Execution that produced it.
    pub execution: ExecutionHandle,
}

/// A build that did not produce an image.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct BuildFailure {
    /// Human-readable reason, recorded as the ledger's `lastError`.
    pub reason: String,
}

impl BuildFailure {
    /// Creates a failure.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Timing settings for [`BuildOrchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildSettings {
    /// Delay between status polls.
    pub poll_interval: Duration,
    /// Overall deadline from submission to terminal status.
    pub timeout: Duration,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Submits builds and polls them to completion.
#[derive(Clone)]
pub struct BuildOrchestrator {
    executor: Arc<dyn BuildExecutor>,
    source: Option<Arc<dyn StorageBackend>>,
    probe_limit: u64,
    settings: BuildSettings,
    metrics: PipelineMetrics,
}

impl std::fmt::Debug for BuildOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOrchestrator")
            .field("settings", &self.settings)
            .field("probes_descriptor", &self.source.is_some())
            .field("probe_limit", &self.probe_limit)
            .finish_non_exhaustive()
    }
}

impl BuildOrchestrator {
    /// Creates an orchestrator that submits straight to `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn BuildExecutor>, settings: BuildSettings) -> Self {
        Self {
            executor,
            source: None,
            probe_limit: DEFAULT_PROBE_LIMIT,
            settings,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Downloads each archive from `source` before submission to locate its
    /// build descriptor.
    #[must_use]
    pub fn with_descriptor_probe(mut self, source: Arc<dyn StorageBackend>) -> Self {
        self.source = Some(source);
        self
    }

    /// Archives larger than `bytes` are not downloaded; their build context
    /// is the archive root.
    #[must_use]
    pub const fn with_probe_limit(mut self, bytes: u64) -> Self {
        self.probe_limit = bytes;
        self
    }

    /// Runs one build to a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`BuildFailure`] when the archive has no build descriptor, the
    /// executor rejects or fails the execution, or the timeout elapses.
    pub async fn build(&self, mut task: BuildTask) -> std::result::Result<BuildResult, BuildFailure> {
        if let Some(source) = &self.source {
            self.locate_descriptor(source.as_ref(), &mut task).await?;
        }

        let started = Instant::now();
        let handle = self
            .executor
            .submit(&task)
            .await
            .map_err(|e| BuildFailure::new(format!("build submission failed: {e}")))?;
        tracing::info!(execution = %handle, image = %task.image_ref, "build submitted");

        let (outcome, result) =
            match tokio::time::timeout(self.settings.timeout, self.await_terminal(&handle)).await {
                Ok(Ok(())) => (
                    "success",
                    Ok(BuildResult {
                        image_ref: task.image_ref.clone(),
                        execution: handle,
                    }),
                ),
                Ok(Err(failure)) => ("failure", Err(failure)),
                Err(_) => (
                    "timeout",
                    Err(BuildFailure::new(format!(
                        "build {handle} did not finish within {}s",
                        self.settings.timeout.as_secs()
                    ))),
                ),
            };
        self.metrics.observe_build_duration(outcome, started.elapsed());
        result
    }

    async fn locate_descriptor(
        &self,
        source: &dyn StorageBackend,
        task: &mut BuildTask,
    ) -> std::result::Result<(), BuildFailure> {
        let path = task.source_path.clone();
        let download_failed = |e: &dyn std::fmt::Display| {
            BuildFailure::new(format!("failed to download {path}: {e}"))
        };

        let size = match source.head(&path).await {
            Ok(Some(meta)) => meta.size,
            Ok(None) => return Err(download_failed(&"object not found")),
            Err(e) => return Err(download_failed(&e)),
        };
        if size > self.probe_limit {
            tracing::warn!(
                size,
                limit = self.probe_limit,
                "archive too large to probe; building from its root"
            );
            return Ok(());
        }

        let archive = source.get(&path).await.map_err(|e| download_failed(&e))?;
        let location = find_descriptor(&archive, task.identity.archive_kind())?;
        tracing::debug!(sub_path = ?location.sub_path, file = %location.file_name, "build descriptor located");
        task.context_sub_path = location.sub_path;
        if location.file_name != descriptor::DESCRIPTOR_NAME {
            task.dockerfile = Some(location.file_name);
        }
        Ok(())
    }

    async fn await_terminal(&self, handle: &ExecutionHandle) -> std::result::Result<(), BuildFailure> {
        let mut status_errors = 0;
        loop {
            match self.executor.status(handle).await {
                Ok(ExecutionStatus::Succeeded) => {
                    tracing::info!(execution = %handle, "build succeeded");
                    return Ok(());
                }
                Ok(ExecutionStatus::Failed { reason }) => {
                    tracing::warn!(execution = %handle, reason = %reason, "build failed");
                    return Err(BuildFailure::new(format!("build {handle} failed: {reason}")));
                }
                Ok(ExecutionStatus::Running) => status_errors = 0,
                Err(Error::Executor { message }) => {
                    return Err(BuildFailure::new(format!("build {handle} lost: {message}")));
                }
                Err(e) => {
                    status_errors += 1;
                    tracing::warn!(execution = %handle, error = %e, attempt = status_errors, "build status unavailable");
                    if status_errors >= MAX_STATUS_ERRORS {
                        return Err(BuildFailure::new(format!(
                            "build {handle} status unavailable: {e}"
                        )));
                    }
                }
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}
