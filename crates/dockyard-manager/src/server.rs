//! HTTP surface of the manager: health, readiness, metrics and the ledger.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use dockyard_core::ArtifactKey;
use dockyard_flow::ledger::LedgerEntry;

use crate::metrics::serve_metrics;
use crate::service::Manager;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `ok`.
    pub status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyResponse {
    /// Startup completed.
    pub ready: bool,
    /// A poll succeeded within the unhealthy threshold.
    pub healthy: bool,
    /// RFC 3339 time of the last successful poll.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_poll: Option<String>,
    /// Successful polls since start.
    pub successful_polls: u64,
    /// Failed polls since start.
    pub failed_polls: u64,
    /// Pipelines in flight.
    pub in_flight: usize,
    /// Why the service is not ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Error body of the ledger endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl From<dockyard_flow::Error> for ApiError {
    fn from(err: dockyard_flow::Error) -> Self {
        match &err {
            dockyard_flow::Error::EntryNotFound { .. } => {
                Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string())
            }
            dockyard_flow::Error::InvalidStateTransition { .. } => {
                Self::new(StatusCode::CONFLICT, "CONFLICT", err.to_string())
            }
            _ => {
                tracing::error!(error = %err, "ledger request failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    err.to_string(),
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                code: self.code.to_string(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

/// Builds the router over a running manager.
pub fn router(manager: Arc<Manager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(serve_metrics))
        .route("/ledger", get(list_entries))
        .route("/ledger/:app/:version", get(get_entry))
        .route("/ledger/:app/:version/reset", post(reset_entry))
        .with_state(manager)
}

/// Serves `router` on `port` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the port cannot be bound or the server fails.
pub async fn serve(
    router: Router,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP endpoints listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// GET /health - Shallow liveness check.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /ready - Ready once a poll has succeeded within the threshold.
async fn ready(State(manager): State<Arc<Manager>>) -> impl IntoResponse {
    let health = manager.health();
    let ready = health.is_ready();
    let healthy = health.is_healthy();
    let successful_polls = health.successful_polls();

    let message = if !ready {
        Some("Service starting up".to_string())
    } else if successful_polls == 0 {
        Some("Waiting for first successful poll".to_string())
    } else if !healthy {
        Some(format!(
            "No successful poll in {} seconds",
            health.unhealthy_threshold_secs()
        ))
    } else {
        None
    };

    let status = if ready && healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            ready,
            healthy,
            last_successful_poll: health.last_successful_poll().map(|dt| dt.to_rfc3339()),
            successful_polls,
            failed_polls: health.failed_polls(),
            in_flight: manager.in_flight(),
            message,
        }),
    )
}

/// GET /ledger - Every entry, ordered by key.
async fn list_entries(State(manager): State<Arc<Manager>>) -> Json<Vec<LedgerEntry>> {
    Json(manager.ledger().entries().await)
}

fn parse_key(app: String, version: String) -> Result<ArtifactKey, ApiError> {
    ArtifactKey::new(app, version)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", e.to_string()))
}

/// GET /ledger/:app/:version
async fn get_entry(
    State(manager): State<Arc<Manager>>,
    Path((app, version)): Path<(String, String)>,
) -> Result<Json<LedgerEntry>, ApiError> {
    let key = parse_key(app, version)?;
    manager.ledger().entry(&key).await.map(Json).ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("ledger entry not found: {key}"),
        )
    })
}

/// POST /ledger/:app/:version/reset - Clears the attempts of a `FAILED` entry.
async fn reset_entry(
    State(manager): State<Arc<Manager>>,
    Path((app, version)): Path<(String, String)>,
) -> Result<Json<LedgerEntry>, ApiError> {
    let key = parse_key(app, version)?;
    let entry = manager.ledger().reset_attempts(&key).await?;
    Ok(Json(entry))
}
