//! End-to-end pipeline scenarios over in-memory storage, executor and cluster.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use dockyard_core::{
    identify, ArtifactKey, BucketLocation, MemoryBackend, ObjectMeta, StorageBackend,
    WritePrecondition, WriteResult,
};
use dockyard_flow::prelude::*;

const MAX_ATTEMPTS: u32 = 3;

struct Pipeline {
    bucket: MemoryBackend,
    ledger: Arc<Ledger>,
    executor: Arc<InMemoryBuildExecutor>,
    cluster: Arc<InMemoryCluster>,
    watcher: BucketWatcher,
    dispatcher: Dispatcher,
}

/// Ledger storage whose puts numbered in `failing` (from 1) return an error.
struct FlakyStorage {
    inner: MemoryBackend,
    puts: AtomicUsize,
    failing: RangeInclusive<usize>,
}

impl FlakyStorage {
    fn failing(failing: RangeInclusive<usize>) -> Self {
        Self {
            inner: MemoryBackend::new(),
            puts: AtomicUsize::new(0),
            failing,
        }
    }
}

#[async_trait]
impl StorageBackend for FlakyStorage {
    async fn get(&self, path: &str) -> dockyard_core::Result<Bytes> {
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> dockyard_core::Result<WriteResult> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.contains(&n) {
            return Err(dockyard_core::Error::storage(format!("put #{n} timed out")));
        }
        self.inner.put(path, data, precondition).await
    }

    async fn list(&self, prefix: &str) -> dockyard_core::Result<Vec<ObjectMeta>> {
        self.inner.list(prefix).await
    }

    async fn head(&self, path: &str) -> dockyard_core::Result<Option<ObjectMeta>> {
        self.inner.head(path).await
    }
}

impl Pipeline {
    async fn new(executor: InMemoryBuildExecutor) -> Self {
        Self::with_ledger_storage(executor, Arc::new(MemoryBackend::new())).await
    }

    async fn with_ledger_storage(
        executor: InMemoryBuildExecutor,
        ledger_storage: Arc<dyn StorageBackend>,
    ) -> Self {
        let bucket = MemoryBackend::new();
        let ledger = Arc::new(
            Ledger::open(ledger_storage, MAX_ATTEMPTS)
                .await
                .expect("open ledger"),
        );
        let executor = Arc::new(executor);
        let cluster = Arc::new(InMemoryCluster::new());

        let builds = BuildOrchestrator::new(
            executor.clone(),
            BuildSettings {
                poll_interval: Duration::from_millis(2),
                timeout: Duration::from_secs(5),
            },
        )
        .with_descriptor_probe(Arc::new(bucket.clone()));
        let reconciler = Reconciler::new(
            ledger.clone(),
            builds,
            ManifestApplier::new(cluster.clone()),
            DeploymentSettings::new("gcr.io/acme", "apps", "example.com", 8080),
            BucketLocation::parse("gs://uploads").expect("bucket"),
        );
        let dispatcher = Dispatcher::new(ledger.clone(), reconciler, 4).expect("dispatcher");
        let watcher = BucketWatcher::new(Arc::new(bucket.clone()), ledger.clone(), "uploads");

        Self {
            bucket,
            ledger,
            executor,
            cluster,
            watcher,
            dispatcher,
        }
    }

    async fn upload(&self, path: &str) {
        self.bucket
            .put(path, Bytes::from(archive_with_dockerfile()), WritePrecondition::None)
            .await
            .expect("upload");
    }

    /// One poll tick, then wait for the pipelines it started.
    async fn tick(&self) -> DispatchSummary {
        let summary = self.dispatcher.tick(&self.watcher).await.expect("tick");
        self.dispatcher.wait_idle().await;
        summary
    }

    async fn entry(&self, app: &str, version: &str) -> Option<LedgerEntry> {
        self.ledger
            .entry(&ArtifactKey::new(app, version).expect("key"))
            .await
    }
}

fn archive_with_dockerfile() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, body) in [
        ("Dockerfile", &b"FROM python:3.12-slim\nCOPY . /app\n"[..]),
        ("app.py", &b"print('hello')\n"[..]),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, body).expect("append");
    }
    builder.into_inner().expect("finish")
}

#[tokio::test]
async fn scenario_upload_is_built_and_deployed() {
    let pipeline = Pipeline::new(InMemoryBuildExecutor::new().with_polls_before_completion(1)).await;
    pipeline.upload("widgets/v1.0.tar").await;

    let summary = pipeline.tick().await;
    assert_eq!(summary.started, 1);

    let entry = pipeline.entry("widgets", "v1.0").await.expect("entry");
    assert_eq!(entry.phase, Phase::Succeeded);
    assert_eq!(entry.attempts, 1);

    let submissions = pipeline.executor.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].image_ref, "gcr.io/acme/widgets:v1.0");
    assert_eq!(submissions[0].context_sub_path, None);

    assert_eq!(pipeline.cluster.names(ResourceKind::Deployment), ["widgets-v1.0"]);
    assert_eq!(pipeline.cluster.names(ResourceKind::Ingress), ["widgets-v1.0"]);
    assert_eq!(pipeline.cluster.names(ResourceKind::Service).len(), 1);
    let route = pipeline
        .cluster
        .object(ResourceKind::Ingress, "apps", "widgets-v1.0")
        .expect("route");
    assert_eq!(route["spec"]["rules"][0]["host"], "widgets-v1.0.example.com");
    assert_eq!(route["spec"]["tls"][0]["hosts"][0], "widgets-v1.0.example.com");
}

#[tokio::test]
async fn scenario_reupload_of_succeeded_identity_is_ignored() {
    let pipeline = Pipeline::new(InMemoryBuildExecutor::new()).await;
    pipeline.upload("widgets/v1.0.tar").await;
    pipeline.tick().await;

    pipeline.upload("widgets/v1.0.tar").await;
    let summary = pipeline.tick().await;

    assert_eq!(summary, DispatchSummary::default());
    assert_eq!(pipeline.executor.submissions().len(), 1);
    assert_eq!(pipeline.cluster.apply_count(ResourceKind::Deployment), 1);
}

#[tokio::test]
async fn scenario_unsupported_extension_creates_nothing() {
    let pipeline = Pipeline::new(InMemoryBuildExecutor::new()).await;
    pipeline.upload("widgets/v1.1.zip").await;

    let report = pipeline.watcher.poll().await.expect("poll");
    assert_eq!(report.invalid, 1);
    assert!(report.items.is_empty());

    pipeline.tick().await;
    assert!(pipeline.ledger.entries().await.is_empty());
    assert!(pipeline.executor.submissions().is_empty());
    assert!(pipeline.cluster.is_empty());
}

#[tokio::test]
async fn scenario_failures_retry_up_to_the_ceiling() {
    let pipeline = Pipeline::new(InMemoryBuildExecutor::new()).await;
    for _ in 0..MAX_ATTEMPTS {
        pipeline
            .executor
            .script("widgets", "v2.0", ScriptedOutcome::Fail("step 3/7 exited 1".into()));
    }
    pipeline.upload("widgets/v2.0.tar").await;

    for attempt in 1..=MAX_ATTEMPTS {
        let summary = pipeline.tick().await;
        assert_eq!(summary.started, 1, "attempt {attempt} should be emitted");
        let entry = pipeline.entry("widgets", "v2.0").await.expect("entry");
        assert_eq!(entry.phase, Phase::Failed);
        assert_eq!(entry.attempts, attempt);
        assert!(entry
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("step 3/7 exited 1")));
    }

    let report = pipeline.watcher.poll().await.expect("poll");
    assert!(report.items.is_empty());
    assert_eq!(report.exhausted, 1);
    pipeline.tick().await;
    assert_eq!(
        pipeline.executor.submission_count("widgets", "v2.0"),
        MAX_ATTEMPTS as usize
    );
}

#[tokio::test]
async fn failing_version_leaves_other_versions_alone() {
    let pipeline = Pipeline::new(InMemoryBuildExecutor::new()).await;
    pipeline.upload("widgets/v1.0.tar").await;
    pipeline.tick().await;
    let v1_before = pipeline.entry("widgets", "v1.0").await.expect("v1");
    let v1_workload = pipeline
        .cluster
        .object(ResourceKind::Deployment, "apps", "widgets-v1.0");

    pipeline
        .executor
        .script("widgets", "v2.0", ScriptedOutcome::Fail("broken".into()));
    pipeline.upload("widgets/v2.0.tar.gz").await;
    pipeline.tick().await;

    assert_eq!(pipeline.entry("widgets", "v1.0").await, Some(v1_before));
    assert_eq!(
        pipeline
            .cluster
            .object(ResourceKind::Deployment, "apps", "widgets-v1.0"),
        v1_workload
    );
    assert_eq!(
        pipeline.entry("widgets", "v2.0").await.expect("v2").phase,
        Phase::Failed
    );
    assert_eq!(pipeline.cluster.names(ResourceKind::Deployment), ["widgets-v1.0"]);
}

#[tokio::test]
async fn overlapping_ticks_start_one_pipeline_per_identity() {
    let pipeline = Pipeline::new(InMemoryBuildExecutor::new().with_polls_before_completion(20)).await;
    pipeline.upload("widgets/v1.0.tar").await;

    let first = pipeline
        .dispatcher
        .tick(&pipeline.watcher)
        .await
        .expect("first tick");
    let second = pipeline
        .dispatcher
        .tick(&pipeline.watcher)
        .await
        .expect("second tick");
    assert_eq!(first.started, 1);
    assert_eq!(second.started, 0);

    pipeline.dispatcher.wait_idle().await;
    assert_eq!(pipeline.executor.submission_count("widgets", "v1.0"), 1);
    assert_eq!(
        pipeline.entry("widgets", "v1.0").await.expect("entry").attempts,
        1
    );
}

#[tokio::test]
async fn twin_archives_are_one_identity() {
    let pipeline = Pipeline::new(InMemoryBuildExecutor::new()).await;
    pipeline.upload("widgets/v1.0.tar").await;
    pipeline.upload("widgets/v1.0.tar.gz").await;

    let summary = pipeline.tick().await;
    assert_eq!(summary.started, 1);
    let submissions = pipeline.executor.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].source_url, "gs://uploads/widgets/v1.0.tar");
}

#[tokio::test]
async fn listing_failure_is_retried_next_tick() {
    let pipeline = Pipeline::new(InMemoryBuildExecutor::new()).await;
    pipeline.upload("widgets/v1.0.tar").await;

    pipeline.bucket.set_listing_failure(Some("permission denied"));
    let err = pipeline
        .dispatcher
        .tick(&pipeline.watcher)
        .await
        .expect_err("listing fails");
    assert!(matches!(err, Error::Listing { .. }));
    assert!(pipeline.ledger.entries().await.is_empty());

    pipeline.bucket.set_listing_failure(None);
    assert_eq!(pipeline.tick().await.started, 1);
    assert_eq!(
        pipeline.entry("widgets", "v1.0").await.expect("entry").phase,
        Phase::Succeeded
    );
}

#[tokio::test]
async fn reset_attempts_makes_exhausted_identity_eligible() {
    let pipeline = Pipeline::new(InMemoryBuildExecutor::new()).await;
    for _ in 0..MAX_ATTEMPTS {
        pipeline
            .executor
            .script("widgets", "v3.0", ScriptedOutcome::Fail("oom".into()));
    }
    pipeline.upload("widgets/v3.0.tar").await;
    for _ in 0..MAX_ATTEMPTS {
        pipeline.tick().await;
    }
    assert_eq!(pipeline.tick().await.started, 0);

    let key = identify("widgets/v3.0.tar").expect("valid").key();
    pipeline.ledger.reset_attempts(&key).await.expect("reset");

    assert_eq!(pipeline.tick().await.started, 1);
    let entry = pipeline.ledger.entry(&key).await.expect("entry");
    assert_eq!(entry.phase, Phase::Succeeded);
    assert_eq!(entry.attempts, 1);
}

#[tokio::test]
async fn ledger_write_failure_is_retried_on_the_next_tick() {
    // Put 1 claims the entry; put 2 is the BUILDING write.
    let storage = Arc::new(FlakyStorage::failing(2..=2));
    let pipeline = Pipeline::with_ledger_storage(InMemoryBuildExecutor::new(), storage).await;
    pipeline.upload("widgets/v1.0.tar").await;

    assert_eq!(pipeline.tick().await.started, 1);
    let entry = pipeline.entry("widgets", "v1.0").await.expect("entry");
    assert_eq!(entry.phase, Phase::Failed);
    assert_eq!(entry.attempts, 0);
    assert!(entry
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("ledger write failed")));
    assert!(pipeline.executor.submissions().is_empty());

    assert_eq!(pipeline.tick().await.started, 1);
    let entry = pipeline.entry("widgets", "v1.0").await.expect("entry");
    assert_eq!(entry.phase, Phase::Succeeded);
    assert_eq!(entry.attempts, 1);
}

#[tokio::test]
async fn stranded_entry_is_released_by_a_later_tick() {
    // The BUILDING write and every retry of the FAILED write fail.
    let storage = Arc::new(FlakyStorage::failing(2..=5));
    let pipeline = Pipeline::with_ledger_storage(InMemoryBuildExecutor::new(), storage).await;
    pipeline.upload("widgets/v1.0.tar").await;

    assert_eq!(pipeline.tick().await.started, 1);
    let key = ArtifactKey::new("widgets", "v1.0").expect("key");
    assert_eq!(pipeline.ledger.stranded().await, [key.clone()]);
    assert_eq!(
        pipeline.ledger.entry(&key).await.expect("entry").phase,
        Phase::Pending
    );

    assert_eq!(pipeline.tick().await.started, 1);
    assert!(pipeline.ledger.stranded().await.is_empty());
    let entry = pipeline.ledger.entry(&key).await.expect("entry");
    assert_eq!(entry.phase, Phase::Succeeded);
    assert_eq!(entry.attempts, 1);
}
