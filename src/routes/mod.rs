mod health;
mod sessions;

use axum::Router;

use crate::state::AppState;

/// Build the complete application router.
///
/// Structure:
/// - `GET /health`: lightweight liveness check
/// - `GET /api/v1/health`: relay kind, live session count and database connectivity
/// - `GET /api/v1/sessions/{sessionCode}`: snapshot of a live session
/// - `GET /api/v1/ws?userId=...`: `WebSocket` upgrade for the session protocol
pub fn router() -> Router<AppState> {
    let api_v1 = Router::new()
        .merge(health::api_router())
        .merge(sessions::router());

    Router::new()
        .merge(health::root_router())
        .nest("/api/v1", api_v1)
}
