use std::time::Instant;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
struct LivenessResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    relay: &'static str,
    sessions: usize,
    connections: usize,
    database: DatabaseHealth,
}

#[derive(Serialize)]
struct DatabaseHealth {
    configured: bool,
    connected: bool,
    latency_ms: Option<u128>,
}

/// `GET /health`
pub fn root_router() -> Router<AppState> {
    Router::new().route("/health", get(liveness))
}

/// `GET /api/v1/health`
pub fn api_router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match &state.db {
        Some(db) => {
            let started = Instant::now();
            let connected = db.ping().await.is_ok();
            DatabaseHealth {
                configured: true,
                connected,
                latency_ms: connected.then(|| started.elapsed().as_millis()),
            }
        }
        None => DatabaseHealth {
            configured: false,
            connected: false,
            latency_ms: None,
        },
    };

    let registry = state.registry();
    let status = if database.configured && !database.connected {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        relay: registry.relay().kind().as_str(),
        sessions: registry.len(),
        connections: registry.relay().connections().len(),
        database,
    })
}
