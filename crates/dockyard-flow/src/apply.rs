//! Manifest applier.
//!
//! Applies the workload, then the endpoint, then the route. The first failure
//! stops the sequence; resources already applied stay in place and are
//! completed by the next successful attempt for the same identity.

use std::sync::Arc;

use crate::cluster::{ClusterApi, ResourceKind};
use crate::metrics::PipelineMetrics;
use crate::template::RenderedManifestSet;

/// A resource could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to apply {kind} {name}: {reason}")]
pub struct ApplyFailure {
    /// Kind of the resource that failed.
    pub kind: ResourceKind,
    /// Name of the resource that failed.
    pub name: String,
    /// Cluster error.
    pub reason: String,
    /// Resources applied before the failure, in order.
    pub applied_before: Vec<ResourceKind>,
}

/// All three resources were applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// `(kind, name)` of each applied resource, in order.
    pub resources: Vec<(ResourceKind, String)>,
}

/// Idempotent create-or-update of rendered manifests.
#[derive(Clone)]
pub struct ManifestApplier {
    cluster: Arc<dyn ClusterApi>,
    metrics: PipelineMetrics,
}

impl std::fmt::Debug for ManifestApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestApplier").finish_non_exhaustive()
    }
}

impl ManifestApplier {
    /// Creates an applier over `cluster`.
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            cluster,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Applies the set in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyFailure`] naming the resource that failed.
    pub async fn apply(&self, manifests: &RenderedManifestSet) -> Result<Applied, ApplyFailure> {
        let mut resources = Vec::with_capacity(3);
        for manifest in manifests.in_apply_order() {
            if let Err(e) = self.cluster.apply(manifest).await {
                self.metrics.record_apply(manifest.kind.kind(), "failure");
                tracing::warn!(kind = %manifest.kind, name = %manifest.name, error = %e, "apply failed");
                return Err(ApplyFailure {
                    kind: manifest.kind,
                    name: manifest.name.clone(),
                    reason: e.to_string(),
                    applied_before: resources.iter().map(|(kind, _)| *kind).collect(),
                });
            }
            self.metrics.record_apply(manifest.kind.kind(), "success");
            tracing::debug!(kind = %manifest.kind, name = %manifest.name, "applied");
            resources.push((manifest.kind, manifest.name.clone()));
        }
        Ok(Applied { resources })
    }
}
