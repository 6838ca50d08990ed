//! Health check HTTP endpoint for deployment platform monitoring.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::database::Database;

/// Shared state for health handlers.
#[derive(Clone)]
pub struct HealthState {
    pub db: Arc<Database>,
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    database: bool,
}

/// Start the health check HTTP server.
pub async fn start_health_server(port: u16, state: HealthState) {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(port = port, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind health check port");

    axum::serve(listener, app)
        .await
        .expect("health check server failed");
}

/// Health check handler. 200 when the database answers, 503 otherwise.
async fn health_handler(
    State(state): State<HealthState>,
) -> (StatusCode, Json<HealthReport>) {
    let database = state.db.health_check().await.is_ok();
    let (code, status) = if database {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (code, Json(HealthReport { status, database }))
}

async fn root_handler() -> &'static str {
    "OK"
}

/// Spawn the health check server as a background task.
pub fn spawn_health_server(port: u16, state: HealthState) {
    tokio::spawn(async move {
        start_health_server(port, state).await;
    });
}
