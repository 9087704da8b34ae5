//! Build executor running kaniko as a cluster job.
//!
//! Each submission creates one `batch/v1` Job:
//!
//! - an init container copies the archive from the bucket into a shared
//!   `emptyDir` as `context.tar.gz` (plain tarballs are gzipped on the way),
//! - the builder container runs kaniko against `tar://` that file and pushes
//!   to the destination, caching layers under `<registry>/cache`.
//!
//! Jobs are never deleted by the executor; they stay for inspection and are
//! left to the cluster's TTL or an operator for cleanup.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use dockyard_core::artifact::{distinct_label_value, distinct_resource_name, MAX_LABEL_LEN};
use dockyard_core::{ArchiveKind, ResourceNameKind};

use super::{BuildExecutor, BuildTask, ExecutionHandle, ExecutionStatus};
use crate::cluster::{ClusterApi, Manifest, ResourceKind};
use crate::error::{Error, Result};
use crate::template::{MANAGED_BY, MANAGED_BY_LABEL};

/// Default kaniko executor image.
pub const DEFAULT_BUILDER_IMAGE: &str = "gcr.io/kaniko-project/executor:v1.9.0";

/// Default image used to fetch the archive.
pub const DEFAULT_FETCHER_IMAGE: &str = "gcr.io/google.com/cloudsdktool/cloud-sdk:slim";

const WORKSPACE: &str = "/workspace";
const CONTEXT_FILE: &str = "/workspace/context.tar.gz";

/// Settings for [`KanikoExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KanikoSettings {
    /// Namespace jobs run in.
    pub namespace: String,
    /// Service account with bucket read and registry push rights.
    pub service_account: String,
    /// Registry prefix; the layer cache lives at `<registry>/cache`.
    pub registry_url: String,
    /// Kaniko image.
    pub builder_image: String,
    /// Image providing `gsutil` for the fetch step.
    pub fetcher_image: String,
}

impl KanikoSettings {
    /// Creates settings with the default builder and fetcher images.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        service_account: impl Into<String>,
        registry_url: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            service_account: service_account.into(),
            registry_url: registry_url.into(),
            builder_image: DEFAULT_BUILDER_IMAGE.to_string(),
            fetcher_image: DEFAULT_FETCHER_IMAGE.to_string(),
        }
    }
}

/// [`BuildExecutor`] submitting kaniko jobs through the cluster API.
pub struct KanikoExecutor {
    cluster: Arc<dyn ClusterApi>,
    settings: KanikoSettings,
}

impl std::fmt::Debug for KanikoExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KanikoExecutor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Returns `build-<app>-<version>-<unix-seconds>` as a DNS label.
///
/// The prefix is sized before the timestamp is appended so that the timestamp
/// always survives. A prefix that had to be sanitized or cut carries a digest,
/// so `v1.0` and `v1-0` never share a job name.
#[must_use]
pub fn job_name(task: &BuildTask, unix_seconds: i64) -> String {
    let suffix = format!("-{unix_seconds}");
    let prefix = distinct_resource_name(
        &format!(
            "build-{}-{}",
            task.identity.application_name(),
            task.identity.version()
        ),
        ResourceNameKind::Label,
        MAX_LABEL_LEN.saturating_sub(suffix.len()),
    );
    format!("{prefix}{suffix}")
}

impl KanikoExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterApi>, settings: KanikoSettings) -> Self {
        Self { cluster, settings }
    }

    fn fetch_command(task: &BuildTask) -> String {
        match task.identity.archive_kind() {
            ArchiveKind::TarGz => format!("gsutil cp '{}' {CONTEXT_FILE}", task.source_url),
            ArchiveKind::Tar => format!(
                "gsutil cp '{}' {WORKSPACE}/context.tar && gzip {WORKSPACE}/context.tar",
                task.source_url
            ),
        }
    }

    fn builder_args(&self, task: &BuildTask) -> Vec<String> {
        let mut args = vec![
            format!("--context=tar://{CONTEXT_FILE}"),
            format!("--destination={}", task.image_ref),
            "--cache=true".to_string(),
            format!(
                "--cache-repo={}/cache",
                self.settings.registry_url.trim_end_matches('/')
            ),
        ];
        if let Some(sub_path) = &task.context_sub_path {
            args.push(format!("--context-sub-path={sub_path}"));
        }
        if let Some(dockerfile) = &task.dockerfile {
            args.push(format!("--dockerfile={dockerfile}"));
        }
        args
    }

    /// Renders the job for `task`.
    #[must_use]
    pub fn render_job(&self, task: &BuildTask, name: &str) -> Manifest {
        let labels = json!({
            "app": distinct_label_value(task.identity.application_name()),
            MANAGED_BY_LABEL: MANAGED_BY,
        });
        let volume_mount = json!([{ "name": "workspace", "mountPath": WORKSPACE }]);

        Manifest {
            kind: ResourceKind::Job,
            namespace: self.settings.namespace.clone(),
            name: name.to_string(),
            body: json!({
                "apiVersion": ResourceKind::Job.api_version(),
                "kind": ResourceKind::Job.kind(),
                "metadata": {
                    "name": name,
                    "namespace": self.settings.namespace,
                    "labels": labels,
                    "annotations": { "dockyard.dev/image": task.image_ref },
                },
                "spec": {
                    "backoffLimit": 0,
                    "template": {
                        "metadata": { "labels": labels },
                        "spec": {
                            "serviceAccountName": self.settings.service_account,
                            "restartPolicy": "Never",
                            "initContainers": [{
                                "name": "fetch-source",
                                "image": self.settings.fetcher_image,
                                "command": ["sh", "-c", Self::fetch_command(task)],
                                "volumeMounts": volume_mount,
                            }],
                            "containers": [{
                                "name": "kaniko",
                                "image": self.settings.builder_image,
                                "args": self.builder_args(task),
                                "volumeMounts": volume_mount,
                            }],
                            "volumes": [{ "name": "workspace", "emptyDir": {} }],
                        },
                    },
                },
            }),
        }
    }
}

/// Reads a terminal state from a job's status.
fn job_status(job: &Value) -> ExecutionStatus {
    let status = &job["status"];
    if let Some(conditions) = status["conditions"].as_array() {
        for condition in conditions {
            if condition["status"] != "True" {
                continue;
            }
            match condition["type"].as_str() {
                Some("Complete") => return ExecutionStatus::Succeeded,
                Some("Failed") => {
                    let reason = condition["message"]
                        .as_str()
                        .or_else(|| condition["reason"].as_str())
                        .unwrap_or("job failed");
                    return ExecutionStatus::Failed {
                        reason: reason.to_string(),
                    };
                }
                _ => {}
            }
        }
    }

    if status["succeeded"].as_u64().unwrap_or(0) > 0 {
        ExecutionStatus::Succeeded
    } else if status["failed"].as_u64().unwrap_or(0) > 0 {
        ExecutionStatus::Failed {
            reason: "build pod failed".to_string(),
        }
    } else {
        ExecutionStatus::Running
    }
}

#[async_trait]
impl BuildExecutor for KanikoExecutor {
    async fn submit(&self, task: &BuildTask) -> Result<ExecutionHandle> {
        let name = job_name(task, Utc::now().timestamp());
        let manifest = self.render_job(task, &name);
        self.cluster.apply(&manifest).await?;
        tracing::debug!(job = %name, namespace = %self.settings.namespace, "build job created");
        Ok(ExecutionHandle(name))
    }

    async fn status(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus> {
        let job = self
            .cluster
            .get(ResourceKind::Job, &self.settings.namespace, &handle.0)
            .await?
            .ok_or_else(|| Error::executor(format!("job {handle} no longer exists")))?;
        Ok(job_status(&job))
    }
}
