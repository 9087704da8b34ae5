//! Prometheus recorder for the manager process.
//!
//! The pipeline records through the `metrics` facade (see
//! [`dockyard_flow::metrics`]); this module installs the exporter once and
//! renders it for `GET /metrics`.

use std::sync::OnceLock;

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use dockyard_flow::metrics::names;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Installs the global Prometheus recorder and describes the pipeline metrics.
///
/// Safe to call multiple times; later calls return the installed handle.
///
/// # Errors
///
/// Returns an error if another recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    tracing::info!("Prometheus metrics recorder initialized");

    // A concurrent caller may have won; either handle renders the same recorder.
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Returns the global Prometheus handle, if initialized.
#[must_use]
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

fn describe() {
    describe_counter!(names::WATCHER_POLLS_TOTAL, "Bucket polls by outcome");
    describe_counter!(
        names::WATCHER_INVALID_PATHS_TOTAL,
        "Listed objects that are not artifact paths"
    );
    describe_counter!(
        names::WORK_ITEMS_EMITTED_TOTAL,
        "Work items handed to the dispatcher"
    );
    describe_counter!(
        names::LEDGER_TRANSITIONS_TOTAL,
        "Ledger phase transitions"
    );
    describe_gauge!(
        names::PIPELINES_IN_FLIGHT,
        "Pipelines claimed and not yet finished"
    );
    describe_histogram!(
        names::BUILD_DURATION_SECONDS,
        Unit::Seconds,
        "Wall time of image builds"
    );
    describe_counter!(names::APPLY_TOTAL, "Manifest applies by kind and outcome");
    describe_gauge!(
        names::TERMINAL_FAILURES,
        "Ledger entries that exhausted their attempts"
    );
}

/// GET /metrics - Prometheus text exposition.
pub async fn serve_metrics() -> impl IntoResponse {
    match prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "Metrics not initialized".to_string(),
        ),
    }
}
