//! In-memory cluster for testing.
//!
//! Objects are keyed by `(kind, namespace, name)`; applying replaces the stored
//! document while keeping any status set through [`InMemoryCluster::set_status`].
//! Failures can be injected per kind.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use super::{ClusterApi, Manifest, ResourceKind};
use crate::error::{Error, Result};

type ObjectKey = (ResourceKind, String, String);

#[derive(Debug, Default)]
struct ClusterState {
    objects: BTreeMap<ObjectKey, Value>,
    applies: HashMap<ResourceKind, usize>,
    failures: HashMap<ResourceKind, String>,
}

/// In-memory [`ClusterApi`] implementation.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: RwLock<ClusterState>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::cluster("in-memory cluster lock poisoned")
}

impl InMemoryCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every apply of `kind` fail with `message` until cleared with `None`.
    pub fn fail_kind(&self, kind: ResourceKind, message: Option<&str>) {
        if let Ok(mut state) = self.state.write() {
            match message {
                Some(message) => state.failures.insert(kind, message.to_string()),
                None => state.failures.remove(&kind),
            };
        }
    }

    /// Sets the `status` field of a stored object. Returns false if absent.
    pub fn set_status(&self, kind: ResourceKind, namespace: &str, name: &str, status: Value) -> bool {
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        match state
            .objects
            .get_mut(&(kind, namespace.to_string(), name.to_string()))
        {
            Some(Value::Object(map)) => {
                map.insert("status".to_string(), status);
                true
            }
            _ => false,
        }
    }

    /// Returns a stored object.
    #[must_use]
    pub fn object(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<Value> {
        self.state.read().ok().and_then(|state| {
            state
                .objects
                .get(&(kind, namespace.to_string(), name.to_string()))
                .cloned()
        })
    }

    /// Returns the names of stored objects of `kind`, sorted.
    #[must_use]
    pub fn names(&self, kind: ResourceKind) -> Vec<String> {
        self.state.read().map_or_else(
            |_| Vec::new(),
            |state| {
                state
                    .objects
                    .keys()
                    .filter(|(k, _, _)| *k == kind)
                    .map(|(_, _, name)| name.clone())
                    .collect()
            },
        )
    }

    /// Returns how many successful applies of `kind` were made.
    #[must_use]
    pub fn apply_count(&self, kind: ResourceKind) -> usize {
        self.state
            .read()
            .map_or(0, |state| state.applies.get(&kind).copied().unwrap_or(0))
    }

    /// Returns the total number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().map_or(0, |state| state.objects.len())
    }

    /// Returns true if no objects are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn apply(&self, manifest: &Manifest) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if let Some(message) = state.failures.get(&manifest.kind) {
            return Err(Error::cluster_status(500, message.clone()));
        }

        let key = (
            manifest.kind,
            manifest.namespace.clone(),
            manifest.name.clone(),
        );
        let mut body = manifest.body.clone();
        let status = state
            .objects
            .get(&key)
            .and_then(|existing| existing.get("status").cloned());
        if let (Some(status), Value::Object(map)) = (status, &mut body) {
            map.insert("status".to_string(), status);
        }

        state.objects.insert(key, body);
        *state.applies.entry(manifest.kind).or_insert(0) += 1;
        drop(state);
        Ok(())
    }

    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<Value>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(name: &str, replicas: u32) -> Manifest {
        Manifest {
            kind: ResourceKind::Deployment,
            namespace: "apps".into(),
            name: name.into(),
            body: json!({ "metadata": { "name": name }, "spec": { "replicas": replicas } }),
        }
    }

    #[tokio::test]
    async fn apply_is_an_upsert() {
        let cluster = InMemoryCluster::new();
        cluster.apply(&manifest("web", 1)).await.expect("create");
        cluster.apply(&manifest("web", 1)).await.expect("reapply");
        assert_eq!(cluster.len(), 1);

        cluster.apply(&manifest("web", 3)).await.expect("update");
        let stored = cluster
            .get(ResourceKind::Deployment, "apps", "web")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored["spec"]["replicas"], 3);
        assert_eq!(cluster.apply_count(ResourceKind::Deployment), 3);
    }

    #[tokio::test]
    async fn status_survives_reapply() {
        let cluster = InMemoryCluster::new();
        cluster.apply(&manifest("web", 1)).await.expect("create");
        assert!(cluster.set_status(
            ResourceKind::Deployment,
            "apps",
            "web",
            json!({ "readyReplicas": 1 })
        ));
        cluster.apply(&manifest("web", 1)).await.expect("reapply");
        let stored = cluster
            .object(ResourceKind::Deployment, "apps", "web")
            .expect("exists");
        assert_eq!(stored["status"]["readyReplicas"], 1);
    }

    #[tokio::test]
    async fn injected_failures() {
        let cluster = InMemoryCluster::new();
        cluster.fail_kind(ResourceKind::Deployment, Some("quota exceeded"));
        assert!(cluster.apply(&manifest("web", 1)).await.is_err());
        assert!(cluster.is_empty());

        cluster.fail_kind(ResourceKind::Deployment, None);
        cluster.apply(&manifest("web", 1)).await.expect("apply");
        assert_eq!(cluster.names(ResourceKind::Deployment), ["web"]);
    }
}
