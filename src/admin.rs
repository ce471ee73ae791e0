//! Admin HTTP surface.
//!
//! A thin shell over the core: `GET /` service identification, `GET /health`
//! from the registered health predicates (200 healthy, 503 degraded), and
//! `GET /stats` serving the connection-statistics snapshot.

use crate::error::{GatewayError, Result};
use crate::sessions::SessionTracker;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A named health predicate consumed by `/health`.
pub type HealthCheck = (&'static str, Arc<dyn Fn() -> bool + Send + Sync>);

/// Shared state behind the admin routes.
pub struct AdminState {
    service_name: String,
    tracker: Arc<SessionTracker>,
    checks: Vec<HealthCheck>,
}

impl AdminState {
    /// Bundles the state the admin surface consumes from the core.
    pub fn new(
        service_name: impl Into<String>,
        tracker: Arc<SessionTracker>,
        checks: Vec<HealthCheck>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            tracker,
            checks,
        }
    }
}

/// Builds the admin router.
pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Serves the admin surface until cancelled.
pub async fn run(port: u16, state: Arc<AdminState>, token: CancellationToken) -> Result<()> {
    let address = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| GatewayError::network(&address, e))?;
    info!("Admin HTTP listening on {}", address);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .map_err(|e| GatewayError::network(address, e))
}

async fn root(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(json!({
        "service": state.service_name,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let components: Vec<(&'static str, bool)> = state
        .checks
        .iter()
        .map(|(name, check)| (*name, check()))
        .collect();
    let healthy = components.iter().all(|(_, ok)| *ok);

    let body = Json(json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "components": components
            .iter()
            .map(|(name, ok)| (name.to_string(), json!(ok)))
            .collect::<serde_json::Map<_, _>>(),
    }));

    if healthy {
        (StatusCode::OK, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body)
    }
}

async fn stats(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(state.tracker.snapshot())
}
