//! Logging initialization and span helpers.
//!
//! Every pipeline attempt runs inside [`pipeline_span`] so log lines carry the
//! artifact, attempt number and correlation ID.

use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::Error;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    #[default]
    Json,
    /// Pretty-printed logs (for development).
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(Error::InvalidInput(format!(
                "log format must be json or pretty (got {other})"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `dockyard_flow=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().flatten_event(true))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates the span a pipeline attempt runs in.
///
/// ```rust
/// use dockyard_core::observability::pipeline_span;
///
/// let span = pipeline_span("widgets", "v1.0", 1, "01HZX3K4J5M6N7P8Q9R0S1T2V3");
/// let _guard = span.enter();
/// tracing::info!("building");
/// ```
#[must_use]
pub fn pipeline_span(application: &str, version: &str, attempt: u32, correlation_id: &str) -> Span {
    tracing::info_span!(
        "pipeline",
        app = application,
        version = version,
        attempt = attempt,
        correlation_id = correlation_id,
    )
}

/// Creates the span for one watcher poll.
#[must_use]
pub fn poll_span(bucket: &str) -> Span {
    tracing::info_span!("poll", bucket = bucket)
}
