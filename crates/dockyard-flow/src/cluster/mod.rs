//! Cluster API abstraction.
//!
//! This module provides:
//!
//! - [`ClusterApi`]: create-or-update and read of namespaced resources
//! - [`Manifest`]: one resource document with its routing information
//! - [`rest::KubeRestClient`]: REST client using server-side apply
//! - [`memory::InMemoryCluster`]: in-memory cluster for testing

pub mod memory;
pub mod rest;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Resource kinds the pipeline manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Workload (`apps/v1` Deployment).
    Deployment,
    /// Network endpoint (`v1` Service).
    Service,
    /// Route (`networking.k8s.io/v1` Ingress).
    Ingress,
    /// Build execution (`batch/v1` Job).
    Job,
}

impl ResourceKind {
    /// Returns the `apiVersion` field value.
    #[must_use]
    pub const fn api_version(self) -> &'static str {
        match self {
            Self::Deployment => "apps/v1",
            Self::Service => "v1",
            Self::Ingress => "networking.k8s.io/v1",
            Self::Job => "batch/v1",
        }
    }

    /// Returns the `kind` field value.
    #[must_use]
    pub const fn kind(self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::Service => "Service",
            Self::Ingress => "Ingress",
            Self::Job => "Job",
        }
    }

    /// Returns the lowercase plural used in API paths.
    #[must_use]
    pub const fn plural(self) -> &'static str {
        match self {
            Self::Deployment => "deployments",
            Self::Service => "services",
            Self::Ingress => "ingresses",
            Self::Job => "jobs",
        }
    }

    /// Returns the API path prefix of the kind's group and version.
    #[must_use]
    pub const fn api_prefix(self) -> &'static str {
        match self {
            Self::Service => "/api/v1",
            Self::Deployment => "/apis/apps/v1",
            Self::Ingress => "/apis/networking.k8s.io/v1",
            Self::Job => "/apis/batch/v1",
        }
    }

    /// Returns the path of a named resource, relative to the API server root.
    #[must_use]
    pub fn resource_path(self, namespace: &str, name: &str) -> String {
        format!(
            "{}/namespaces/{namespace}/{}/{name}",
            self.api_prefix(),
            self.plural()
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// A rendered resource document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Target namespace.
    pub namespace: String,
    /// Resource name.
    pub name: String,
    /// Full document including `apiVersion`, `kind` and `metadata`.
    pub body: Value,
}

/// Access to the cluster API.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Creates the resource if absent, otherwise updates it to match.
    ///
    /// Applying the same manifest twice has no further effect.
    async fn apply(&self, manifest: &Manifest) -> Result<()>;

    /// Reads a resource, including its status. Returns `None` if absent.
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<Value>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_paths() {
        assert_eq!(
            ResourceKind::Deployment.resource_path("apps", "widgets-v1.0"),
            "/apis/apps/v1/namespaces/apps/deployments/widgets-v1.0"
        );
        assert_eq!(
            ResourceKind::Service.resource_path("apps", "widgets-v1-0"),
            "/api/v1/namespaces/apps/services/widgets-v1-0"
        );
        assert_eq!(
            ResourceKind::Job.resource_path("apps", "build-x"),
            "/apis/batch/v1/namespaces/apps/jobs/build-x"
        );
    }
}
