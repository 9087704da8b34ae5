//! The long-running manager: poll loop, health state and shutdown.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;

use dockyard_core::{BucketLocation, ObjectStoreBackend, StorageBackend};
use dockyard_flow::apply::ManifestApplier;
use dockyard_flow::build::kaniko::KanikoExecutor;
use dockyard_flow::build::{BuildExecutor, BuildOrchestrator};
use dockyard_flow::cluster::rest::KubeRestClient;
use dockyard_flow::cluster::ClusterApi;
use dockyard_flow::dispatcher::{DispatchSummary, Dispatcher};
use dockyard_flow::ledger::Ledger;
use dockyard_flow::reconciler::Reconciler;
use dockyard_flow::watcher::BucketWatcher;

use crate::config::ManagerConfig;
use crate::error::Result;

/// How long shutdown waits for in-flight pipelines.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

fn unix_now() -> u64 {
    Utc::now().timestamp().try_into().unwrap_or_default()
}

/// Poll-loop health, read by `/ready`.
#[derive(Debug)]
pub struct PollHealth {
    ready: AtomicBool,
    last_successful_poll_ts: AtomicU64,
    successful_polls: AtomicU64,
    failed_polls: AtomicU64,
    unhealthy_threshold_secs: u64,
}

impl PollHealth {
    /// Creates health state that turns unhealthy after `unhealthy_threshold`
    /// without a successful poll.
    #[must_use]
    pub fn new(unhealthy_threshold: Duration) -> Self {
        Self {
            ready: AtomicBool::new(false),
            last_successful_poll_ts: AtomicU64::new(0),
            successful_polls: AtomicU64::new(0),
            failed_polls: AtomicU64::new(0),
            unhealthy_threshold_secs: unhealthy_threshold.as_secs(),
        }
    }

    /// Marks startup as complete.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Records a poll that listed the bucket.
    pub fn record_success(&self) {
        self.last_successful_poll_ts
            .store(unix_now(), Ordering::Release);
        self.successful_polls.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a poll that could not list the bucket.
    pub fn record_failure(&self) {
        self.failed_polls.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true once startup completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Ready, and the last successful poll is within the threshold.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        if !self.is_ready() {
            return false;
        }
        let last = self.last_successful_poll_ts.load(Ordering::Acquire);
        if last == 0 {
            return false;
        }
        unix_now().saturating_sub(last) < self.unhealthy_threshold_secs
    }

    /// Time of the last successful poll.
    #[must_use]
    pub fn last_successful_poll(&self) -> Option<DateTime<Utc>> {
        let ts = self.last_successful_poll_ts.load(Ordering::Acquire);
        if ts == 0 {
            return None;
        }
        DateTime::from_timestamp(i64::try_from(ts).ok()?, 0)
    }

    /// Number of successful polls.
    #[must_use]
    pub fn successful_polls(&self) -> u64 {
        self.successful_polls.load(Ordering::Relaxed)
    }

    /// Number of failed polls.
    #[must_use]
    pub fn failed_polls(&self) -> u64 {
        self.failed_polls.load(Ordering::Relaxed)
    }

    /// Threshold in seconds.
    #[must_use]
    pub const fn unhealthy_threshold_secs(&self) -> u64 {
        self.unhealthy_threshold_secs
    }
}

/// External systems the manager talks to.
pub struct Components {
    /// The upload bucket.
    pub bucket: Arc<dyn StorageBackend>,
    /// Where the bucket lives, for URLs handed to build jobs.
    pub bucket_location: BucketLocation,
    /// Storage holding the ledger.
    pub ledger_storage: Arc<dyn StorageBackend>,
    /// Runs image builds.
    pub executor: Arc<dyn BuildExecutor>,
    /// Receives rendered manifests.
    pub cluster: Arc<dyn ClusterApi>,
}

impl Components {
    /// Connects to the bucket, ledger store and cluster named by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a location cannot be parsed or a client cannot be built.
    pub fn connect(config: &ManagerConfig) -> Result<Self> {
        let bucket_location = BucketLocation::parse(&config.bucket)?;
        let bucket = ObjectStoreBackend::from_location(bucket_location.clone())?;
        let ledger_storage = ObjectStoreBackend::from_bucket(&config.ledger_url)?;

        let cluster: Arc<dyn ClusterApi> = Arc::new(KubeRestClient::new(config.kube_config()?)?);
        let executor = KanikoExecutor::new(cluster.clone(), config.kaniko_settings());

        Ok(Self {
            bucket: Arc::new(bucket),
            bucket_location,
            ledger_storage: Arc::new(ledger_storage),
            executor: Arc::new(executor),
            cluster,
        })
    }
}

/// Watcher, dispatcher and ledger wired together.
pub struct Manager {
    ledger: Arc<Ledger>,
    watcher: BucketWatcher,
    dispatcher: Dispatcher,
    health: Arc<PollHealth>,
    poll_interval: Duration,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("watcher", &self.watcher)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Opens the ledger (recovering interrupted entries) and wires the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be loaded or the settings are unusable.
    pub async fn assemble(config: &ManagerConfig, components: Components) -> Result<Self> {
        let ledger = Arc::new(Ledger::open(components.ledger_storage, config.max_attempts).await?);

        let builds = BuildOrchestrator::new(components.executor, config.build_settings())
            .with_descriptor_probe(components.bucket.clone())
            .with_probe_limit(config.descriptor_probe_limit);
        let reconciler = Reconciler::new(
            ledger.clone(),
            builds,
            ManifestApplier::new(components.cluster),
            config.deployment_settings(),
            components.bucket_location,
        );
        let dispatcher =
            Dispatcher::new(ledger.clone(), reconciler, config.max_concurrent_pipelines)?;
        let watcher = BucketWatcher::new(components.bucket, ledger.clone(), config.bucket.clone());

        tracing::info!(
            bucket = %config.bucket,
            ledger = %config.ledger_url,
            entries = ledger.entries().await.len(),
            max_concurrent = config.max_concurrent_pipelines,
            "manager assembled"
        );

        Ok(Self {
            ledger,
            watcher,
            dispatcher,
            health: Arc::new(PollHealth::new(config.unhealthy_threshold)),
            poll_interval: config.poll_interval,
        })
    }

    /// The ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Poll-loop health.
    #[must_use]
    pub fn health(&self) -> &Arc<PollHealth> {
        &self.health
    }

    /// Pipelines currently holding a slot or waiting for one.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Polls once and dispatches what was found, without waiting for the pipelines.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket cannot be listed.
    pub async fn tick(&self) -> Result<DispatchSummary> {
        match self.dispatcher.tick(&self.watcher).await {
            Ok(summary) => {
                self.health.record_success();
                if summary.started > 0 || summary.errors > 0 {
                    tracing::info!(
                        started = summary.started,
                        skipped = summary.skipped,
                        errors = summary.errors,
                        "tick dispatched work"
                    );
                }
                Ok(summary)
            }
            Err(e) => {
                self.health.record_failure();
                Err(e.into())
            }
        }
    }

    /// Polls once and waits for every dispatched pipeline to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket cannot be listed.
    pub async fn run_once(&self) -> Result<DispatchSummary> {
        self.health.mark_ready();
        let summary = self.tick().await?;
        self.dispatcher.wait_idle().await;
        Ok(summary)
    }

    /// Polls every interval until `shutdown` resolves, then drains.
    ///
    /// A failed poll is logged and retried on the next tick.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        self.health.mark_ready();
        tracing::info!(
            interval_secs = self.poll_interval.as_secs(),
            "manager ready, starting poll loop"
        );

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "poll failed");
                    }
                }
            }
        }

        tracing::info!(in_flight = self.in_flight(), "shutdown requested; discovery stopped");
        self.drain(SHUTDOWN_GRACE).await;
    }

    /// Waits up to `grace` for in-flight pipelines. Returns true if they all finished.
    ///
    /// Pipelines still running are abandoned and recovered on the next start.
    pub async fn drain(&self, grace: Duration) -> bool {
        if tokio::time::timeout(grace, self.dispatcher.wait_idle())
            .await
            .is_ok()
        {
            tracing::info!("all pipelines finished");
            true
        } else {
            tracing::warn!(
                in_flight = self.in_flight(),
                grace_secs = grace.as_secs(),
                "pipelines still running at shutdown; they will be recovered on restart"
            );
            false
        }
    }
}
