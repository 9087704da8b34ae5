//! Per-identity pipeline: build, render, apply.
//!
//! ```text
//! PENDING ──▶ BUILDING ──▶ DEPLOYING ──▶ SUCCEEDED
//!                │             │
//!                └─────────────┴──▶ FAILED
//! ```
//!
//! Build and apply failures never escape [`Reconciler::run`]; they become a
//! `FAILED` entry carrying the reason. Only ledger errors are returned, and the
//! entry is still released for the next poll (see [`Ledger::abandon`]).

use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use dockyard_core::observability::pipeline_span;
use dockyard_core::{ArtifactKey, BucketLocation};

use crate::apply::ManifestApplier;
use crate::build::{BuildOrchestrator, BuildTask};
use crate::error::{Error, Result};
use crate::ledger::{Ledger, LedgerEntry, Phase};
use crate::template::{render, DeploymentSettings};
use crate::watcher::WorkItem;

/// Tries at marking an aborted entry `FAILED` before stranding it.
const ABANDON_ATTEMPTS: u32 = 3;

/// Backoff between those tries, multiplied by the try number.
const ABANDON_BACKOFF: Duration = Duration::from_millis(100);

/// Drives one claimed work item to a terminal phase.
#[derive(Debug, Clone)]
pub struct Reconciler {
    ledger: Arc<Ledger>,
    builds: BuildOrchestrator,
    applier: ManifestApplier,
    deployment: DeploymentSettings,
    source: BucketLocation,
}

impl Reconciler {
    /// Creates a reconciler. `source` is where uploads live; build executors
    /// receive object URLs under it.
    #[must_use]
    pub fn new(
        ledger: Arc<Ledger>,
        builds: BuildOrchestrator,
        applier: ManifestApplier,
        deployment: DeploymentSettings,
        source: BucketLocation,
    ) -> Self {
        Self {
            ledger,
            builds,
            applier,
            deployment,
            source,
        }
    }

    /// Returns the deployment settings manifests are rendered with.
    #[must_use]
    pub const fn deployment(&self) -> &DeploymentSettings {
        &self.deployment
    }

    /// Runs one attempt for a work item whose entry is `PENDING`.
    ///
    /// Returns the terminal phase reached, `SUCCEEDED` or `FAILED`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry is not `PENDING` or a ledger write fails.
    /// An in-flight entry is then marked `FAILED` so the next poll retries it;
    /// if even that write fails the key is stranded in the ledger and released
    /// by a later tick.
    pub async fn run(&self, item: WorkItem) -> Result<Phase> {
        let key = item.identity.key();
        let result = self.attempt(item).await;
        if let Err(e) = &result {
            self.abandon(&key, e).await;
        }
        result
    }

    async fn attempt(&self, item: WorkItem) -> Result<Phase> {
        let key = item.identity.key();
        let entry = self.ledger.begin_build(&key).await?;
        let span = pipeline_span(
            item.identity.application_name(),
            item.identity.version(),
            entry.attempts,
            &item.correlation_id.to_string(),
        );
        self.drive(&item, &entry).instrument(span).await
    }

    async fn drive(&self, item: &WorkItem, entry: &LedgerEntry) -> Result<Phase> {
        let identity = &item.identity;
        let key = identity.key();
        tracing::info!(source = %identity.source_path(), "pipeline started");

        let task = BuildTask::new(
            identity,
            &self.deployment.registry_url,
            self.source.object_url(identity.source_path()),
        );
        let built = match self.builds.build(task).await {
            Ok(built) => built,
            Err(failure) => {
                self.record_failure(entry, "build", &failure.reason);
                self.ledger.fail(&key, failure.reason).await?;
                return Ok(Phase::Failed);
            }
        };

        self.ledger.begin_deploy(&key).await?;
        let manifests = render(identity, &self.deployment);
        if let Err(failure) = self.applier.apply(&manifests).await {
            let reason = failure.to_string();
            self.record_failure(entry, "deploy", &reason);
            self.ledger.fail(&key, reason).await?;
            return Ok(Phase::Failed);
        }

        self.ledger.succeed(&key).await?;
        tracing::info!(
            image = %built.image_ref,
            url = %manifests.public_url(),
            "deployment applied"
        );
        Ok(Phase::Succeeded)
    }

    async fn abandon(&self, key: &ArtifactKey, error: &Error) {
        let reason = format!("ledger write failed: {error}");
        for attempt in 1..=ABANDON_ATTEMPTS {
            match self.ledger.abandon(key, reason.as_str()).await {
                Ok(Some(entry)) => {
                    tracing::warn!(
                        key = %key,
                        attempts = entry.attempts,
                        error = %error,
                        "pipeline aborted; entry marked FAILED for retry"
                    );
                    return;
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(key = %key, attempt, error = %e, "could not release aborted entry");
                    if attempt < ABANDON_ATTEMPTS {
                        tokio::time::sleep(ABANDON_BACKOFF * attempt).await;
                    }
                }
            }
        }
        tracing::error!(key = %key, error = %error, "aborted entry stranded until the next tick");
        self.ledger.strand(key, reason).await;
    }

    fn record_failure(&self, entry: &LedgerEntry, stage: &str, reason: &str) {
        let max_attempts = self.ledger.max_attempts();
        if entry.attempts >= max_attempts {
            tracing::error!(
                stage,
                reason,
                attempts = entry.attempts,
                max_attempts,
                "pipeline failed; retry ceiling reached"
            );
        } else {
            tracing::warn!(
                stage,
                reason,
                attempts = entry.attempts,
                max_attempts,
                "pipeline failed; will retry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_core::{identify, MemoryBackend};

    use crate::build::memory::{InMemoryBuildExecutor, ScriptedOutcome};
    use crate::build::BuildSettings;
    use crate::cluster::memory::InMemoryCluster;
    use crate::cluster::ResourceKind;
    use crate::ledger::ClaimOutcome;
    use crate::Error;

    struct Harness {
        ledger: Arc<Ledger>,
        executor: Arc<InMemoryBuildExecutor>,
        cluster: Arc<InMemoryCluster>,
        reconciler: Reconciler,
    }

    async fn harness() -> Harness {
        let ledger = Arc::new(
            Ledger::open(Arc::new(MemoryBackend::new()), 3)
                .await
                .expect("open"),
        );
        let executor = Arc::new(InMemoryBuildExecutor::new());
        let cluster = Arc::new(InMemoryCluster::new());
        let builds = BuildOrchestrator::new(
            executor.clone(),
            BuildSettings {
                poll_interval: std::time::Duration::from_millis(1),
                timeout: std::time::Duration::from_secs(5),
            },
        );
        let reconciler = Reconciler::new(
            ledger.clone(),
            builds,
            ManifestApplier::new(cluster.clone()),
            DeploymentSettings::new("gcr.io/acme", "apps", "example.com", 8080),
            BucketLocation::parse("gs://uploads").expect("bucket"),
        );
        Harness {
            ledger,
            executor,
            cluster,
            reconciler,
        }
    }

    async fn claimed(ledger: &Ledger, path: &str) -> WorkItem {
        let identity = identify(path).expect("valid");
        let outcome = ledger.claim(&identity).await.expect("claim");
        assert!(matches!(outcome, ClaimOutcome::Claimed(_)));
        WorkItem::new(identity)
    }

    #[tokio::test]
    async fn success_reaches_succeeded() {
        let h = harness().await;
        let item = claimed(&h.ledger, "widgets/v1.0.tar").await;
        let key = item.identity.key();

        let phase = h.reconciler.run(item).await.expect("run");
        assert_eq!(phase, Phase::Succeeded);

        let entry = h.ledger.entry(&key).await.expect("entry");
        assert_eq!(entry.phase, Phase::Succeeded);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_error, None);
        assert_eq!(
            h.executor.submissions()[0].source_url,
            "gs://uploads/widgets/v1.0.tar"
        );
        assert_eq!(h.cluster.names(ResourceKind::Ingress), ["widgets-v1.0"]);
    }

    #[tokio::test]
    async fn build_failure_is_recorded_not_returned() {
        let h = harness().await;
        h.executor
            .script("widgets", "v2.0", ScriptedOutcome::Fail("exit code 1".into()));
        let item = claimed(&h.ledger, "widgets/v2.0.tar").await;
        let key = item.identity.key();

        assert_eq!(h.reconciler.run(item).await.expect("run"), Phase::Failed);
        let entry = h.ledger.entry(&key).await.expect("entry");
        assert_eq!(entry.phase, Phase::Failed);
        assert!(entry
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("exit code 1")));
        assert!(h.cluster.is_empty());
    }

    #[tokio::test]
    async fn apply_failure_is_recorded_not_returned() {
        let h = harness().await;
        h.cluster
            .fail_kind(ResourceKind::Ingress, Some("ingress controller unavailable"));
        let item = claimed(&h.ledger, "widgets/v1.0.tar").await;
        let key = item.identity.key();

        assert_eq!(h.reconciler.run(item).await.expect("run"), Phase::Failed);
        let entry = h.ledger.entry(&key).await.expect("entry");
        assert!(entry
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("Ingress")));
        assert_eq!(h.cluster.names(ResourceKind::Deployment), ["widgets-v1.0"]);
    }

    #[tokio::test]
    async fn unclaimed_item_is_rejected() {
        let h = harness().await;
        let item = WorkItem::new(identify("widgets/v1.0.tar").expect("valid"));
        let result = h.reconciler.run(item).await;
        assert!(matches!(result, Err(Error::EntryNotFound { .. })));
        assert!(h.executor.submissions().is_empty());
    }
}
