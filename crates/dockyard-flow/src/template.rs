//! Deployment templater.
//!
//! [`render`] is a pure function from an identity and [`DeploymentSettings`] to
//! the three resources that expose an application version:
//!
//! | Resource | Name rule | Example for `widgets/v1.0` |
//! |----------|-----------|----------------------------|
//! | Deployment | DNS subdomain | `widgets-v1.0` |
//! | Service | DNS label | `widgets-v1-0-<digest>` |
//! | Ingress | DNS subdomain | `widgets-v1.0`, host `widgets-v1.0.<domain>` |
//!
//! Services must be DNS labels, so dots in the version become dashes there and
//! the name gains a digest of `widgets-v1.0`; `widgets/v1-0` keeps the plain
//! `widgets-v1-0`.

use serde_json::{json, Map, Value};

use dockyard_core::artifact::{distinct_label_value, sanitize_resource_name};
use dockyard_core::{ArtifactIdentity, ResourceNameKind};

use crate::cluster::{Manifest, ResourceKind};

/// Port the Service listens on; traffic is forwarded to the target port.
pub const SERVICE_PORT: u16 = 80;

/// Annotation read by the certificate controller.
pub const CLUSTER_ISSUER_ANNOTATION: &str = "cert-manager.io/cluster-issuer";

/// Label marking objects created by this system.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`].
pub const MANAGED_BY: &str = "dockyard";

/// Static settings that shape every rendered manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentSettings {
    /// Registry prefix of image references, e.g. `gcr.io/acme`.
    pub registry_url: String,
    /// Namespace of all three resources.
    pub namespace: String,
    /// Base domain; hosts are `<name>.<domain>`.
    pub domain: String,
    /// Port the container listens on.
    pub target_port: u16,
    /// Workload replica count.
    pub replicas: u32,
    /// Certificate issuer named in the route annotation.
    pub tls_cluster_issuer: String,
    /// Ingress class, when the cluster has no default.
    pub ingress_class: Option<String>,
}

impl DeploymentSettings {
    /// Creates settings with one replica, the `letsencrypt-prod` issuer and
    /// the default ingress class.
    #[must_use]
    pub fn new(
        registry_url: impl Into<String>,
        namespace: impl Into<String>,
        domain: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            registry_url: registry_url.into(),
            namespace: namespace.into(),
            domain: domain.into(),
            target_port,
            replicas: 1,
            tls_cluster_issuer: "letsencrypt-prod".to_string(),
            ingress_class: None,
        }
    }
}

/// The three resources for one identity, plus the route host.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedManifestSet {
    /// Deployment running the image.
    pub workload: Manifest,
    /// Service selecting the workload's pods.
    pub endpoint: Manifest,
    /// Ingress routing the host to the service with TLS.
    pub route: Manifest,
    /// Public host name.
    pub host: String,
}

impl RenderedManifestSet {
    /// Returns the resources in apply order: workload, endpoint, route.
    #[must_use]
    pub fn in_apply_order(&self) -> [&Manifest; 3] {
        [&self.workload, &self.endpoint, &self.route]
    }

    /// Returns `https://<host>`.
    #[must_use]
    pub fn public_url(&self) -> String {
        format!("https://{}", self.host)
    }
}

/// Returns the pushed image reference, `<registry>/<application>:<version>`.
#[must_use]
pub fn image_ref(registry_url: &str, identity: &ArtifactIdentity) -> String {
    format!(
        "{}/{}",
        registry_url.trim_end_matches('/'),
        identity.image_tag()
    )
}

fn selector(identity: &ArtifactIdentity) -> Value {
    json!({
        "app": distinct_label_value(identity.application_name()),
        "version": distinct_label_value(identity.version()),
    })
}

fn metadata(name: &str, namespace: &str, identity: &ArtifactIdentity) -> Map<String, Value> {
    let mut labels = Map::new();
    labels.insert("app".into(), json!(distinct_label_value(identity.application_name())));
    labels.insert("version".into(), json!(distinct_label_value(identity.version())));
    labels.insert(MANAGED_BY_LABEL.into(), json!(MANAGED_BY));

    let mut metadata = Map::new();
    metadata.insert("name".into(), json!(name));
    metadata.insert("namespace".into(), json!(namespace));
    metadata.insert("labels".into(), Value::Object(labels));
    metadata
}

/// Renders the workload, endpoint and route for `identity`. Total and deterministic.
#[must_use]
pub fn render(identity: &ArtifactIdentity, settings: &DeploymentSettings) -> RenderedManifestSet {
    let subdomain_name = identity.resource_name(ResourceNameKind::Subdomain);
    let label_name = identity.resource_name(ResourceNameKind::Label);
    let container_name = sanitize_resource_name(identity.application_name(), ResourceNameKind::Label);
    let namespace = settings.namespace.as_str();
    let domain = settings.domain.trim_matches('.');
    let host = format!("{subdomain_name}.{domain}");

    let workload = Manifest {
        kind: ResourceKind::Deployment,
        namespace: namespace.to_string(),
        name: subdomain_name.clone(),
        body: json!({
            "apiVersion": ResourceKind::Deployment.api_version(),
            "kind": ResourceKind::Deployment.kind(),
            "metadata": metadata(&subdomain_name, namespace, identity),
            "spec": {
                "replicas": settings.replicas,
                "selector": { "matchLabels": selector(identity) },
                "template": {
                    "metadata": { "labels": selector(identity) },
                    "spec": {
                        "containers": [{
                            "name": container_name,
                            "image": image_ref(&settings.registry_url, identity),
                            "ports": [{ "containerPort": settings.target_port, "protocol": "TCP" }],
                        }],
                    },
                },
            },
        }),
    };

    let endpoint = Manifest {
        kind: ResourceKind::Service,
        namespace: namespace.to_string(),
        name: label_name.clone(),
        body: json!({
            "apiVersion": ResourceKind::Service.api_version(),
            "kind": ResourceKind::Service.kind(),
            "metadata": metadata(&label_name, namespace, identity),
            "spec": {
                "type": "ClusterIP",
                "selector": selector(identity),
                "ports": [{
                    "port": SERVICE_PORT,
                    "targetPort": settings.target_port,
                    "protocol": "TCP",
                }],
            },
        }),
    };

    let mut route_metadata = metadata(&subdomain_name, namespace, identity);
    route_metadata.insert(
        "annotations".into(),
        json!({ CLUSTER_ISSUER_ANNOTATION: settings.tls_cluster_issuer }),
    );
    let mut route_spec = json!({
        "tls": [{
            "hosts": [host],
            "secretName": format!("{subdomain_name}-tls"),
        }],
        "rules": [{
            "host": host,
            "http": {
                "paths": [{
                    "path": "/",
                    "pathType": "Prefix",
                    "backend": {
                        "service": {
                            "name": label_name,
                            "port": { "number": SERVICE_PORT },
                        },
                    },
                }],
            },
        }],
    });
    if let (Some(class), Value::Object(spec)) = (&settings.ingress_class, &mut route_spec) {
        spec.insert("ingressClassName".into(), json!(class));
    }

    let route = Manifest {
        kind: ResourceKind::Ingress,
        namespace: namespace.to_string(),
        name: subdomain_name.clone(),
        body: json!({
            "apiVersion": ResourceKind::Ingress.api_version(),
            "kind": ResourceKind::Ingress.kind(),
            "metadata": route_metadata,
            "spec": route_spec,
        }),
    };

    RenderedManifestSet {
        workload,
        endpoint,
        route,
        host,
    }
}
