//! Bounded-concurrency pipeline dispatcher.
//!
//! The dispatcher claims each work item in the ledger and spawns one task per
//! claimed identity. Tasks wait for a permit before running, so at most
//! `max_concurrent` pipelines touch the build executor and the cluster at once;
//! items beyond the bound queue as `PENDING` instead of being dropped.
//!
//! Discovery never waits on pipelines: [`Dispatcher::dispatch`] returns as soon
//! as the claim is written and the task is spawned.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::ledger::{ClaimOutcome, Eligibility, Ledger};
use crate::metrics::PipelineMetrics;
use crate::reconciler::Reconciler;
use crate::watcher::{BucketWatcher, WorkItem};

/// What happened to one work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Claimed and handed to a pipeline task.
    Started,
    /// Not eligible when claimed; nothing was spawned.
    Skipped(Eligibility),
}

/// Counts for a batch of work items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Items that started a pipeline.
    pub started: usize,
    /// Items skipped at claim time.
    pub skipped: usize,
    /// Items whose claim could not be written.
    pub errors: usize,
}

/// Decrements the in-flight count when a pipeline task ends, panics included.
struct InFlight {
    count: Arc<AtomicUsize>,
    metrics: PipelineMetrics,
}

impl InFlight {
    fn enter(count: &Arc<AtomicUsize>, metrics: &PipelineMetrics) -> Self {
        let now = count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics.set_pipelines_in_flight(now);
        Self {
            count: Arc::clone(count),
            metrics: metrics.clone(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let now = self.count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        self.metrics.set_pipelines_in_flight(now);
    }
}

/// Spawns reconciler runs with a concurrency bound.
pub struct Dispatcher {
    ledger: Arc<Ledger>,
    reconciler: Arc<Reconciler>,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    in_flight: Arc<AtomicUsize>,
    max_concurrent: usize,
    metrics: PipelineMetrics,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("max_concurrent", &self.max_concurrent)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher running at most `max_concurrent` pipelines.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `max_concurrent` is zero.
    pub fn new(ledger: Arc<Ledger>, reconciler: Reconciler, max_concurrent: usize) -> Result<Self> {
        if max_concurrent == 0 {
            return Err(Error::configuration("max concurrent pipelines must be at least 1"));
        }
        Ok(Self {
            ledger,
            reconciler: Arc::new(reconciler),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            tasks: Mutex::new(JoinSet::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_concurrent,
            metrics: PipelineMetrics::new(),
        })
    }

    /// Returns the number of claimed pipelines that have not finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Claims `item` and, if eligible, spawns its pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the claim cannot be written to the ledger.
    pub async fn dispatch(&self, item: WorkItem) -> Result<Dispatched> {
        let claim = self.ledger.claim(&item.identity).await?;
        if let ClaimOutcome::Skipped(eligibility) = claim {
            tracing::debug!(key = %item.identity.key(), ?eligibility, "work item no longer eligible");
            return Ok(Dispatched::Skipped(eligibility));
        }

        let guard = InFlight::enter(&self.in_flight, &self.metrics);
        let permits = Arc::clone(&self.permits);
        let reconciler = Arc::clone(&self.reconciler);

        let mut tasks = self.tasks.lock().await;
        reap(&mut tasks);
        tasks.spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let key = item.identity.key();
            match reconciler.run(item).await {
                Ok(phase) => tracing::debug!(key = %key, phase = %phase, "pipeline finished"),
                Err(e) => tracing::error!(key = %key, error = %e, "pipeline aborted"),
            }
        });
        drop(tasks);
        Ok(Dispatched::Started)
    }

    /// Dispatches a batch in order. Claim errors are logged and counted.
    pub async fn dispatch_all(&self, items: Vec<WorkItem>) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        for item in items {
            let key = item.identity.key();
            match self.dispatch(item).await {
                Ok(Dispatched::Started) => summary.started += 1,
                Ok(Dispatched::Skipped(_)) => summary.skipped += 1,
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(key = %key, error = %e, "failed to claim work item");
                }
            }
        }
        summary
    }

    /// Releases stranded ledger entries, then polls `watcher` once and
    /// dispatches what it emits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Listing`] if the bucket could not be listed.
    pub async fn tick(&self, watcher: &BucketWatcher) -> Result<DispatchSummary> {
        self.ledger.recover_stranded().await;
        let report = watcher.poll().await?;
        Ok(self.dispatch_all(report.items).await)
    }

    /// Waits until every spawned pipeline has finished.
    pub async fn wait_idle(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
    }
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.try_join_next() {
        log_join(joined);
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "pipeline task panicked; entry is recovered on restart");
    }
}
