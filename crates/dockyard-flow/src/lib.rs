//! # dockyard-flow
//!
//! The upload-to-deployment pipeline.
//!
//! An archive uploaded to `<application>/<version>.tar[.gz]` is built into a
//! container image and exposed as a Deployment, Service and TLS Ingress:
//!
//! - **Ledger**: durable per-identity processing state and the only
//!   "has this been seen" record
//! - **Watcher**: lists the bucket and emits work items for eligible identities
//! - **Dispatcher**: claims work items and runs pipelines with bounded concurrency
//! - **Reconciler**: the per-identity state machine, build then deploy
//! - **Build**: executor abstraction, kaniko jobs, status polling with a deadline
//! - **Template** and **Apply**: pure manifest rendering and ordered idempotent upserts
//!
//! ## Guarantees
//!
//! - **At most one in flight**: claiming an identity and writing `PENDING` is atomic
//! - **Idempotent**: a `SUCCEEDED` identity is never rebuilt, re-uploads included
//! - **Bounded retries**: failed identities are re-emitted until the attempt ceiling
//! - **Crash-safe**: interrupted pipelines are failed on restart and retried
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use dockyard_core::{BucketLocation, MemoryBackend};
//! use dockyard_flow::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<()> {
//! let bucket = Arc::new(MemoryBackend::new());
//! let ledger = Arc::new(Ledger::open(Arc::new(MemoryBackend::new()), 3).await?);
//!
//! let reconciler = Reconciler::new(
//!     ledger.clone(),
//!     BuildOrchestrator::new(Arc::new(InMemoryBuildExecutor::new()), BuildSettings::default()),
//!     ManifestApplier::new(Arc::new(InMemoryCluster::new())),
//!     DeploymentSettings::new("gcr.io/acme", "apps", "example.com", 8080),
//!     BucketLocation::Memory,
//! );
//! let dispatcher = Dispatcher::new(ledger.clone(), reconciler, 4)?;
//! let watcher = BucketWatcher::new(bucket, ledger, "uploads");
//!
//! let summary = dispatcher.tick(&watcher).await?;
//! assert_eq!(summary.started, 0);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod apply;
pub mod build;
pub mod cluster;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod reconciler;
pub mod template;
pub mod watcher;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::apply::{Applied, ApplyFailure, ManifestApplier};
    pub use crate::build::kaniko::{KanikoExecutor, KanikoSettings};
    pub use crate::build::memory::{InMemoryBuildExecutor, ScriptedOutcome};
    pub use crate::build::{
        BuildExecutor, BuildFailure, BuildOrchestrator, BuildResult, BuildSettings, BuildTask,
        ExecutionHandle, ExecutionStatus,
    };
    pub use crate::cluster::memory::InMemoryCluster;
    pub use crate::cluster::rest::{KubeConfig, KubeRestClient, TokenSource};
    pub use crate::cluster::{ClusterApi, Manifest, ResourceKind};
    pub use crate::dispatcher::{DispatchSummary, Dispatched, Dispatcher};
    pub use crate::error::{Error, Result};
    pub use crate::ledger::{ClaimOutcome, Eligibility, Ledger, LedgerEntry, Phase};
    pub use crate::metrics::PipelineMetrics;
    pub use crate::reconciler::Reconciler;
    pub use crate::template::{render, DeploymentSettings, RenderedManifestSet};
    pub use crate::watcher::{BucketWatcher, PollReport, WorkItem};
}

pub use error::{Error, Result};
