//! Bucket watcher: turns a bucket listing into work items.
//!
//! A poll lists every object, identifies each path and asks the ledger whether
//! the identity should be processed. The watcher never writes the ledger;
//! claiming happens in the dispatcher.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::Instrument;

use dockyard_core::observability::poll_span;
use dockyard_core::{identify, ArtifactIdentity, ArtifactKey, CorrelationId, StorageBackend};

use crate::error::{Error, Result};
use crate::ledger::{Eligibility, Ledger};
use crate::metrics::PipelineMetrics;

/// A request to run one pipeline attempt for an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// The artifact to process.
    pub identity: ArtifactIdentity,
    /// When the watcher saw it.
    pub discovered_at: DateTime<Utc>,
    /// Tags the logs of the attempt this emission starts.
    pub correlation_id: CorrelationId,
}

impl WorkItem {
    /// Creates a work item discovered now.
    #[must_use]
    pub fn new(identity: ArtifactIdentity) -> Self {
        Self {
            identity,
            discovered_at: Utc::now(),
            correlation_id: CorrelationId::generate(),
        }
    }
}

/// Outcome of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Work items to dispatch, in path order.
    pub items: Vec<WorkItem>,
    /// Objects listed.
    pub listed: usize,
    /// Objects that did not identify as artifacts.
    pub invalid: usize,
    /// Identities skipped because they are in flight, done or exhausted.
    pub skipped: usize,
    /// Identities that exhausted their attempts.
    pub exhausted: usize,
}

/// Periodically consulted by the service loop to discover new artifacts.
pub struct BucketWatcher {
    storage: Arc<dyn StorageBackend>,
    ledger: Arc<Ledger>,
    bucket: String,
    metrics: PipelineMetrics,
    warned_paths: Mutex<HashSet<String>>,
    reported_exhausted: Mutex<HashSet<ArtifactKey>>,
}

impl std::fmt::Debug for BucketWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketWatcher")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl BucketWatcher {
    /// Creates a watcher over `storage`. `bucket` is only used in logs.
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        ledger: Arc<Ledger>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            ledger,
            bucket: bucket.into(),
            metrics: PipelineMetrics::new(),
            warned_paths: Mutex::new(HashSet::new()),
            reported_exhausted: Mutex::new(HashSet::new()),
        }
    }

    /// Lists the bucket once and returns the work items to dispatch.
    ///
    /// When both `<app>/<v>.tar` and `<app>/<v>.tar.gz` exist, only the first in
    /// path order is emitted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Listing`] if the bucket cannot be listed. Nothing else
    /// fails a poll.
    pub async fn poll(&self) -> Result<PollReport> {
        self.poll_inner().instrument(poll_span(&self.bucket)).await
    }

    async fn poll_inner(&self) -> Result<PollReport> {
        let objects = match self.storage.list("").await {
            Ok(objects) => objects,
            Err(source) => {
                self.metrics.record_poll("failure");
                tracing::warn!(error = %source, "bucket listing failed; retrying next tick");
                return Err(Error::Listing {
                    message: format!("failed to list {}", self.bucket),
                    source,
                });
            }
        };

        let mut paths: Vec<String> = objects.into_iter().map(|meta| meta.path).collect();
        paths.sort();

        let mut report = PollReport {
            listed: paths.len(),
            ..PollReport::default()
        };
        let mut seen = HashSet::new();
        let mut invalid_now = HashSet::new();
        let mut exhausted_now = HashSet::new();

        for path in paths {
            let identity = match identify(&path) {
                Ok(identity) => identity,
                Err(invalid) => {
                    report.invalid += 1;
                    self.metrics.record_invalid_path();
                    self.log_invalid(&path, &invalid);
                    invalid_now.insert(path);
                    continue;
                }
            };

            let key = identity.key();
            if !seen.insert(key.clone()) {
                tracing::debug!(path = %path, "duplicate archive for an identity already considered");
                continue;
            }

            match self.ledger.eligibility(&key).await {
                Eligibility::New | Eligibility::Retry { .. } => {
                    self.metrics.record_work_item_emitted();
                    report.items.push(WorkItem::new(identity));
                }
                Eligibility::InFlight(phase) => {
                    tracing::debug!(key = %key, phase = %phase, "skipping in-flight identity");
                    report.skipped += 1;
                }
                Eligibility::Succeeded => report.skipped += 1,
                Eligibility::Exhausted { attempts } => {
                    report.skipped += 1;
                    report.exhausted += 1;
                    self.report_exhausted(&key, attempts).await;
                    exhausted_now.insert(key);
                }
            }
        }
        self.forget_resolved(&invalid_now, &exhausted_now);

        self.metrics.record_poll("success");
        self.metrics.set_terminal_failures(report.exhausted);
        tracing::debug!(
            listed = report.listed,
            emitted = report.items.len(),
            invalid = report.invalid,
            skipped = report.skipped,
            "poll complete"
        );
        Ok(report)
    }

    fn log_invalid(&self, path: &str, invalid: &dockyard_core::InvalidPath) {
        let first_time = self
            .warned_paths
            .lock()
            .map_or(true, |mut warned| warned.insert(path.to_string()));
        if first_time {
            tracing::warn!(path = %path, reason = %invalid, "ignoring object that is not an artifact");
        } else {
            tracing::debug!(path = %path, reason = %invalid, "ignoring object that is not an artifact");
        }
    }

    /// Drops paths and keys that this poll no longer saw as invalid or
    /// exhausted, so they are reported again if they come back.
    fn forget_resolved(&self, invalid: &HashSet<String>, exhausted: &HashSet<ArtifactKey>) {
        if let Ok(mut warned) = self.warned_paths.lock() {
            warned.retain(|path| invalid.contains(path));
        }
        if let Ok(mut reported) = self.reported_exhausted.lock() {
            reported.retain(|key| exhausted.contains(key));
        }
    }

    async fn report_exhausted(&self, key: &ArtifactKey, attempts: u32) {
        let first_time = self
            .reported_exhausted
            .lock()
            .map_or(true, |mut reported| reported.insert(key.clone()));
        if !first_time {
            return;
        }
        let last_error = self
            .ledger
            .entry(key)
            .await
            .and_then(|entry| entry.last_error)
            .unwrap_or_default();
        tracing::error!(
            key = %key,
            attempts,
            last_error = %last_error,
            "artifact exhausted its attempts; needs operator attention"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dockyard_core::{MemoryBackend, WritePrecondition};

    use crate::ledger::ClaimOutcome;

    async fn setup(paths: &[&str]) -> (MemoryBackend, Arc<Ledger>, BucketWatcher) {
        let bucket = MemoryBackend::new();
        for path in paths {
            bucket
                .put(path, Bytes::from_static(b"archive"), WritePrecondition::None)
                .await
                .expect("put");
        }
        let ledger = Arc::new(
            Ledger::open(Arc::new(MemoryBackend::new()), 2)
                .await
                .expect("ledger"),
        );
        let watcher = BucketWatcher::new(Arc::new(bucket.clone()), Arc::clone(&ledger), "test");
        (bucket, ledger, watcher)
    }

    #[tokio::test]
    async fn emits_new_identities_and_ignores_invalid_paths() {
        let (_, _, watcher) = setup(&[
            "widgets/v1.0.tar",
            "widgets/v1.1.zip",
            "README.md",
            "team/widgets/v1.tar",
            "gadgets/v3.tar.gz",
        ])
        .await;

        let report = watcher.poll().await.expect("poll");
        assert_eq!(report.listed, 5);
        assert_eq!(report.invalid, 3);
        let emitted: Vec<&str> = report
            .items
            .iter()
            .map(|item| item.identity.source_path())
            .collect();
        assert_eq!(emitted, ["gadgets/v3.tar.gz", "widgets/v1.0.tar"]);
    }

    #[tokio::test]
    async fn polling_does_not_write_the_ledger() {
        let (_, ledger, watcher) = setup(&["widgets/v1.0.tar"]).await;
        watcher.poll().await.expect("poll");
        watcher.poll().await.expect("poll");
        assert!(ledger.entries().await.is_empty());
    }

    #[tokio::test]
    async fn in_flight_and_succeeded_are_skipped() {
        let (_, ledger, watcher) = setup(&["widgets/v1.0.tar", "widgets/v2.0.tar"]).await;
        let v1 = identify("widgets/v1.0.tar").expect("valid");
        let v2 = identify("widgets/v2.0.tar").expect("valid");

        assert!(matches!(ledger.claim(&v1).await.expect("claim"), ClaimOutcome::Claimed(_)));
        ledger.claim(&v2).await.expect("claim");
        ledger.begin_build(&v2.key()).await.expect("build");
        ledger.begin_deploy(&v2.key()).await.expect("deploy");
        ledger.succeed(&v2.key()).await.expect("succeed");

        let report = watcher.poll().await.expect("poll");
        assert!(report.items.is_empty());
        assert_eq!(report.skipped, 2);
    }

    #[tokio::test]
    async fn tar_and_tar_gz_twins_emit_once() {
        let (_, _, watcher) = setup(&["widgets/v1.0.tar", "widgets/v1.0.tar.gz"]).await;
        let report = watcher.poll().await.expect("poll");
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].identity.source_path(), "widgets/v1.0.tar");
    }

    #[tokio::test]
    async fn exhausted_identities_are_counted_not_emitted() {
        let (_, ledger, watcher) = setup(&["widgets/v2.0.tar"]).await;
        let identity = identify("widgets/v2.0.tar").expect("valid");
        for _ in 0..2 {
            ledger.claim(&identity).await.expect("claim");
            ledger.begin_build(&identity.key()).await.expect("build");
            ledger.fail(&identity.key(), "boom").await.expect("fail");
        }

        let report = watcher.poll().await.expect("poll");
        assert!(report.items.is_empty());
        assert_eq!(report.exhausted, 1);
    }

    #[tokio::test]
    async fn listing_failure_is_reported_and_recoverable() {
        let (bucket, _, watcher) = setup(&["widgets/v1.0.tar"]).await;
        bucket.set_listing_failure(Some("permission denied"));
        assert!(matches!(watcher.poll().await, Err(Error::Listing { .. })));

        bucket.set_listing_failure(None);
        assert_eq!(watcher.poll().await.expect("poll").items.len(), 1);
    }

    #[tokio::test]
    async fn each_emission_gets_a_fresh_correlation_id() {
        let (_, _, watcher) = setup(&["widgets/v1.0.tar"]).await;
        let first = watcher.poll().await.expect("poll");
        let second = watcher.poll().await.expect("poll");
        assert_ne!(first.items[0].correlation_id, second.items[0].correlation_id);
    }

    #[tokio::test]
    async fn reported_paths_and_keys_are_forgotten_once_resolved() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("widgets")).expect("mkdir");
        std::fs::write(dir.path().join("README.md"), b"notes").expect("write");
        std::fs::write(dir.path().join("widgets/v2.0.tar"), b"archive").expect("write");

        let bucket = dockyard_core::ObjectStoreBackend::from_location(
            dockyard_core::BucketLocation::Local(dir.path().to_path_buf()),
        )
        .expect("bucket");
        let ledger = Arc::new(
            Ledger::open(Arc::new(MemoryBackend::new()), 1)
                .await
                .expect("ledger"),
        );
        let watcher = BucketWatcher::new(Arc::new(bucket), Arc::clone(&ledger), "test");

        let identity = identify("widgets/v2.0.tar").expect("valid");
        ledger.claim(&identity).await.expect("claim");
        ledger.begin_build(&identity.key()).await.expect("build");
        ledger.fail(&identity.key(), "boom").await.expect("fail");

        let report = watcher.poll().await.expect("poll");
        assert_eq!(report.invalid, 1);
        assert_eq!(report.exhausted, 1);
        assert_eq!(watcher.warned_paths.lock().expect("lock").len(), 1);
        assert_eq!(watcher.reported_exhausted.lock().expect("lock").len(), 1);

        std::fs::remove_file(dir.path().join("README.md")).expect("remove");
        ledger.reset_attempts(&identity.key()).await.expect("reset");

        let report = watcher.poll().await.expect("poll");
        assert_eq!(report.invalid, 0);
        assert_eq!(report.items.len(), 1);
        assert!(watcher.warned_paths.lock().expect("lock").is_empty());
        assert!(watcher.reported_exhausted.lock().expect("lock").is_empty());
    }
}
