//! Manager configuration.
//!
//! Everything comes from `DOCKYARD_*` environment variables; a `.env` file in
//! the working directory is loaded first by the binary.

use std::time::Duration;

use dockyard_core::LogFormat;
use dockyard_flow::build::kaniko::{KanikoSettings, DEFAULT_BUILDER_IMAGE, DEFAULT_FETCHER_IMAGE};
use dockyard_flow::build::{BuildSettings, DEFAULT_PROBE_LIMIT};
use dockyard_flow::cluster::rest::{KubeConfig, TokenSource};
use dockyard_flow::template::DeploymentSettings;

use crate::error::{Error, Result};

/// Default ledger location.
pub const DEFAULT_LEDGER_URL: &str = "file:///var/lib/dockyard/ledger";

/// Runtime configuration of the manager.
#[derive(Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Upload bucket (`name`, `gs://`, `s3://`, `file://`, `memory://`).
    pub bucket: String,
    /// Container registry prefix.
    pub registry_url: String,
    /// Base domain of route hosts.
    pub domain: String,
    /// Namespace of deployed resources and build jobs.
    pub namespace: String,
    /// Service account build jobs run under.
    pub build_service_account: String,
    /// Port the application container listens on.
    pub target_port: u16,
    /// Watcher tick.
    pub poll_interval: Duration,
    /// Retry-attempt ceiling.
    pub max_attempts: u32,
    /// Overall build deadline.
    pub build_timeout: Duration,
    /// Delay between build status polls.
    pub build_poll_interval: Duration,
    /// Bound on in-flight pipelines.
    pub max_concurrent_pipelines: usize,
    /// Largest archive downloaded to locate its `Dockerfile`.
    pub descriptor_probe_limit: u64,
    /// Where the ledger lives.
    pub ledger_url: String,
    /// Workload replica count.
    pub replicas: u32,
    /// Certificate issuer named in route annotations.
    pub tls_cluster_issuer: String,
    /// Ingress class, if the cluster has no default.
    pub ingress_class: Option<String>,
    /// Kaniko image.
    pub builder_image: String,
    /// Image used to fetch archives in build jobs.
    pub fetcher_image: String,
    /// Port of the health and metrics server.
    pub http_port: u16,
    /// Readiness fails after this long without a successful poll.
    pub unhealthy_threshold: Duration,
    /// Cluster API URL; in-cluster discovery when unset.
    pub kube_api_url: Option<String>,
    /// Bearer token for `kube_api_url`.
    pub kube_token: Option<String>,
    /// Log output format.
    pub log_format: LogFormat,
}

impl std::fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("bucket", &self.bucket)
            .field("registry_url", &self.registry_url)
            .field("domain", &self.domain)
            .field("namespace", &self.namespace)
            .field("build_service_account", &self.build_service_account)
            .field("target_port", &self.target_port)
            .field("poll_interval", &self.poll_interval)
            .field("max_attempts", &self.max_attempts)
            .field("build_timeout", &self.build_timeout)
            .field("build_poll_interval", &self.build_poll_interval)
            .field("max_concurrent_pipelines", &self.max_concurrent_pipelines)
            .field("descriptor_probe_limit", &self.descriptor_probe_limit)
            .field("ledger_url", &self.ledger_url)
            .field("replicas", &self.replicas)
            .field("tls_cluster_issuer", &self.tls_cluster_issuer)
            .field("ingress_class", &self.ingress_class)
            .field("builder_image", &self.builder_image)
            .field("fetcher_image", &self.fetcher_image)
            .field("http_port", &self.http_port)
            .field("unhealthy_threshold", &self.unhealthy_threshold)
            .field("kube_api_url", &self.kube_api_url)
            .field("kube_token", &self.kube_token.as_ref().map(|_| "[REDACTED]"))
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl ManagerConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error naming the variable if a required value is missing or
    /// a value cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`.
    ///
    /// Supported variables:
    /// - `DOCKYARD_BUCKET` (required)
    /// - `DOCKYARD_REGISTRY_URL` (required)
    /// - `DOCKYARD_DOMAIN` (required)
    /// - `DOCKYARD_NAMESPACE` (default `dockyard-apps`)
    /// - `DOCKYARD_BUILD_SERVICE_ACCOUNT` (default `dockyard-builder`)
    /// - `DOCKYARD_TARGET_PORT` (default 8080)
    /// - `DOCKYARD_POLL_INTERVAL_SECS` (default 10)
    /// - `DOCKYARD_MAX_ATTEMPTS` (default 3)
    /// - `DOCKYARD_BUILD_TIMEOUT_SECS` (default 1800)
    /// - `DOCKYARD_BUILD_POLL_INTERVAL_SECS` (default 15)
    /// - `DOCKYARD_MAX_CONCURRENT_PIPELINES` (default 4)
    /// - `DOCKYARD_DESCRIPTOR_PROBE_MAX_BYTES` (default 256 MiB)
    /// - `DOCKYARD_LEDGER_URL` (default [`DEFAULT_LEDGER_URL`])
    /// - `DOCKYARD_REPLICAS` (default 1)
    /// - `DOCKYARD_TLS_CLUSTER_ISSUER` (default `letsencrypt-prod`)
    /// - `DOCKYARD_INGRESS_CLASS`
    /// - `DOCKYARD_BUILDER_IMAGE`, `DOCKYARD_FETCHER_IMAGE`
    /// - `DOCKYARD_HTTP_PORT` (default 8081)
    /// - `DOCKYARD_UNHEALTHY_THRESHOLD_SECS` (default 300)
    /// - `DOCKYARD_KUBE_API_URL`, `DOCKYARD_KUBE_TOKEN`
    /// - `DOCKYARD_LOG_FORMAT` (`json` or `pretty`, default `json`)
    ///
    /// # Errors
    ///
    /// Returns an error naming the variable if a required value is missing or
    /// a value cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(&lookup);

        let config = Self {
            bucket: env.required("DOCKYARD_BUCKET")?,
            registry_url: env.required("DOCKYARD_REGISTRY_URL")?,
            domain: env.required("DOCKYARD_DOMAIN")?,
            namespace: env.string_or("DOCKYARD_NAMESPACE", "dockyard-apps"),
            build_service_account: env
                .string_or("DOCKYARD_BUILD_SERVICE_ACCOUNT", "dockyard-builder"),
            target_port: env.parse_or("DOCKYARD_TARGET_PORT", 8080)?,
            poll_interval: env.secs_or("DOCKYARD_POLL_INTERVAL_SECS", 10)?,
            max_attempts: env.parse_or("DOCKYARD_MAX_ATTEMPTS", 3)?,
            build_timeout: env.secs_or("DOCKYARD_BUILD_TIMEOUT_SECS", 1800)?,
            build_poll_interval: env.secs_or("DOCKYARD_BUILD_POLL_INTERVAL_SECS", 15)?,
            max_concurrent_pipelines: env.parse_or("DOCKYARD_MAX_CONCURRENT_PIPELINES", 4)?,
            descriptor_probe_limit: env
                .parse_or("DOCKYARD_DESCRIPTOR_PROBE_MAX_BYTES", DEFAULT_PROBE_LIMIT)?,
            ledger_url: env.string_or("DOCKYARD_LEDGER_URL", DEFAULT_LEDGER_URL),
            replicas: env.parse_or("DOCKYARD_REPLICAS", 1)?,
            tls_cluster_issuer: env.string_or("DOCKYARD_TLS_CLUSTER_ISSUER", "letsencrypt-prod"),
            ingress_class: env.string("DOCKYARD_INGRESS_CLASS"),
            builder_image: env.string_or("DOCKYARD_BUILDER_IMAGE", DEFAULT_BUILDER_IMAGE),
            fetcher_image: env.string_or("DOCKYARD_FETCHER_IMAGE", DEFAULT_FETCHER_IMAGE),
            http_port: env.parse_or("DOCKYARD_HTTP_PORT", 8081)?,
            unhealthy_threshold: env.secs_or("DOCKYARD_UNHEALTHY_THRESHOLD_SECS", 300)?,
            kube_api_url: env.string("DOCKYARD_KUBE_API_URL"),
            kube_token: env.string("DOCKYARD_KUBE_TOKEN"),
            log_format: match env.string("DOCKYARD_LOG_FORMAT") {
                Some(raw) => raw.parse().map_err(|e| {
                    Error::configuration(format!("DOCKYARD_LOG_FORMAT: {e}"))
                })?,
                None => LogFormat::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::configuration("DOCKYARD_MAX_ATTEMPTS must be at least 1"));
        }
        if self.max_concurrent_pipelines == 0 {
            return Err(Error::configuration(
                "DOCKYARD_MAX_CONCURRENT_PIPELINES must be at least 1",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::configuration(
                "DOCKYARD_POLL_INTERVAL_SECS must be greater than 0",
            ));
        }
        if self.build_poll_interval.is_zero() {
            return Err(Error::configuration(
                "DOCKYARD_BUILD_POLL_INTERVAL_SECS must be greater than 0",
            ));
        }
        if self.kube_token.is_some() && self.kube_api_url.is_none() {
            return Err(Error::configuration(
                "DOCKYARD_KUBE_TOKEN requires DOCKYARD_KUBE_API_URL",
            ));
        }
        Ok(())
    }

    /// Settings for rendered manifests.
    #[must_use]
    pub fn deployment_settings(&self) -> DeploymentSettings {
        DeploymentSettings {
            replicas: self.replicas,
            tls_cluster_issuer: self.tls_cluster_issuer.clone(),
            ingress_class: self.ingress_class.clone(),
            ..DeploymentSettings::new(
                self.registry_url.clone(),
                self.namespace.clone(),
                self.domain.clone(),
                self.target_port,
            )
        }
    }

    /// Settings for the build orchestrator.
    #[must_use]
    pub const fn build_settings(&self) -> BuildSettings {
        BuildSettings {
            poll_interval: self.build_poll_interval,
            timeout: self.build_timeout,
        }
    }

    /// Settings for kaniko build jobs.
    #[must_use]
    pub fn kaniko_settings(&self) -> KanikoSettings {
        KanikoSettings {
            builder_image: self.builder_image.clone(),
            fetcher_image: self.fetcher_image.clone(),
            ..KanikoSettings::new(
                self.namespace.clone(),
                self.build_service_account.clone(),
                self.registry_url.clone(),
            )
        }
    }

    /// Cluster API connection: the explicit URL when set, otherwise in-cluster discovery.
    ///
    /// # Errors
    ///
    /// Returns an error if in-cluster discovery fails.
    pub fn kube_config(&self) -> Result<KubeConfig> {
        match &self.kube_api_url {
            Some(url) => {
                let token = self
                    .kube_token
                    .clone()
                    .map_or(TokenSource::None, TokenSource::Static);
                Ok(KubeConfig::new(url.clone(), token))
            }
            None => Ok(KubeConfig::in_cluster()?),
        }
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn string_or(&self, name: &str, default: &str) -> String {
        self.string(name).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, name: &str) -> Result<String> {
        self.string(name)
            .ok_or_else(|| Error::configuration(format!("{name} is required")))
    }

    fn parse_or<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(v) = self.string(name) else {
            return Ok(default);
        };
        v.parse::<T>().map_err(|e| {
            Error::configuration(format!(
                "{name} must be a {}: {e}",
                std::any::type_name::<T>()
            ))
        })
    }

    fn secs_or(&self, name: &str, default: u64) -> Result<Duration> {
        self.parse_or(name, default).map(Duration::from_secs)
    }
}
