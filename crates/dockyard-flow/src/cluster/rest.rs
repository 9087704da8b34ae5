//! Cluster API client over HTTPS.
//!
//! Upserts use server-side apply: a `PATCH` with content type
//! `application/apply-patch+yaml`, a fixed field manager and `force=true`. The
//! server merges the document into the live object, so re-applying an
//! unchanged manifest is a no-op and the client never needs to read first.
//!
//! ## In-cluster discovery
//!
//! [`KubeConfig::in_cluster`] reads the API address from
//! `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT` and the service-account
//! token and CA bundle from the standard mount. The token file is re-read on
//! every request so projected-token rotation is picked up.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use super::{ClusterApi, Manifest, ResourceKind};
use crate::error::{Error, Result};

/// Field manager recorded on every applied object.
pub const FIELD_MANAGER: &str = "dockyard";

const APPLY_PATCH_CONTENT_TYPE: &str = "application/apply-patch+yaml";
const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Where the bearer token comes from.
#[derive(Clone)]
pub enum TokenSource {
    /// A fixed token.
    Static(String),
    /// A file re-read on every request.
    File(PathBuf),
    /// No authentication (local proxies and tests).
    None,
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(_) => f.write_str("Static(<redacted>)"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::None => f.write_str("None"),
        }
    }
}

/// Connection settings for [`KubeRestClient`].
#[derive(Debug, Clone)]
pub struct KubeConfig {
    /// API server base URL, e.g. `https://10.0.0.1:443`.
    pub api_url: String,
    /// Bearer token source.
    pub token: TokenSource,
    /// PEM bundle to trust in addition to the system roots.
    pub ca_pem: Option<Vec<u8>>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl KubeConfig {
    /// Creates a config for an explicit API URL.
    #[must_use]
    pub fn new(api_url: impl Into<String>, token: TokenSource) -> Self {
        Self {
            api_url: api_url.into(),
            token,
            ca_pem: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Discovers the API server from inside a pod.
    ///
    /// # Errors
    ///
    /// Returns a configuration error outside a cluster or if the CA bundle
    /// cannot be read.
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            Error::configuration("KUBERNETES_SERVICE_HOST is not set; not running in a cluster")
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        let dir = PathBuf::from(SERVICE_ACCOUNT_DIR);
        let ca_path = dir.join("ca.crt");
        let ca_pem = std::fs::read(&ca_path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {e}", ca_path.display()))
        })?;

        Ok(Self {
            api_url: format!("https://{host}:{port}"),
            token: TokenSource::File(dir.join("token")),
            ca_pem: Some(ca_pem),
            timeout: Duration::from_secs(30),
        })
    }

    /// Sets the trusted CA bundle.
    #[must_use]
    pub fn with_ca_pem(mut self, pem: Vec<u8>) -> Self {
        self.ca_pem = Some(pem);
        self
    }
}

/// Error body returned by the API server.
#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
    #[serde(default)]
    reason: String,
}

/// Cluster client speaking the REST API directly.
pub struct KubeRestClient {
    base: String,
    token: TokenSource,
    client: reqwest::Client,
}

impl fmt::Debug for KubeRestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeRestClient")
            .field("base", &self.base)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl KubeRestClient {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the URL or CA bundle is invalid.
    pub fn new(config: KubeConfig) -> Result<Self> {
        let url = url::Url::parse(&config.api_url).map_err(|e| {
            Error::configuration(format!("invalid cluster API URL '{}': {e}", config.api_url))
        })?;

        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(pem) = &config.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| Error::configuration(format!("invalid cluster CA bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| Error::configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            base: url.as_str().trim_end_matches('/').to_string(),
            token: config.token,
            client,
        })
    }

    fn url(&self, kind: ResourceKind, namespace: &str, name: &str) -> String {
        format!("{}{}", self.base, kind.resource_path(namespace, name))
    }

    async fn authorize(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        match &self.token {
            TokenSource::Static(token) => Ok(request.bearer_auth(token)),
            TokenSource::File(path) => {
                let token = tokio::fs::read_to_string(path).await.map_err(|e| {
                    Error::cluster(format!("failed to read token {}: {e}", path.display()))
                })?;
                Ok(request.bearer_auth(token.trim()))
            }
            TokenSource::None => Ok(request),
        }
    }

    async fn error_from(response: reqwest::Response, action: &str) -> Error {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        let message = match serde_json::from_str::<ApiStatus>(&body) {
            Ok(api) if !api.message.is_empty() => format!("{action}: {} ({})", api.message, api.reason),
            _ => format!("{action}: {status} - {body}"),
        };
        Error::cluster_status(status.as_u16(), message)
    }
}

#[async_trait]
impl ClusterApi for KubeRestClient {
    async fn apply(&self, manifest: &Manifest) -> Result<()> {
        let body = serde_json::to_vec(&manifest.body)?;
        let request = self
            .client
            .patch(self.url(manifest.kind, &manifest.namespace, &manifest.name))
            .query(&[("fieldManager", FIELD_MANAGER), ("force", "true")])
            .header(CONTENT_TYPE, APPLY_PATCH_CONTENT_TYPE)
            .body(body);

        let response = self
            .authorize(request)
            .await?
            .send()
            .await
            .map_err(|e| Error::cluster(format!("apply {} {}: {e}", manifest.kind, manifest.name)))?;

        if response.status().is_success() {
            tracing::debug!(kind = %manifest.kind, name = %manifest.name, status = %response.status(), "applied");
            Ok(())
        } else {
            Err(Self::error_from(response, &format!("apply {} {}", manifest.kind, manifest.name)).await)
        }
    }

    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<Value>> {
        let request = self.client.get(self.url(kind, namespace, name));
        let response = self
            .authorize(request)
            .await?
            .send()
            .await
            .map_err(|e| Error::cluster(format!("get {kind} {name}: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let value = response
                    .json::<Value>()
                    .await
                    .map_err(|e| Error::cluster(format!("get {kind} {name}: invalid body: {e}")))?;
                Ok(Some(value))
            }
            _ => Err(Self::error_from(response, &format!("get {kind} {name}")).await),
        }
    }
}
