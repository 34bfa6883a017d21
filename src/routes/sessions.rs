use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::error::AppError;
use crate::sessions::{Session, SessionError, ServerMessage};
use crate::state::AppState;

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Build the session route group.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions/{session_code}", get(get_session))
        .route("/ws", get(ws_upgrade))
}

// ─────────────────────────────────────────────────────────────────────────────
// DTOs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WsQueryParams {
    /// Identity supplied by the upstream identity provider; trusted as given.
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// `GET /api/v1/sessions/{sessionCode}`: Snapshot of a live session (code is case-insensitive).
async fn get_session(
    State(state): State<AppState>,
    Path(session_code): Path<String>,
) -> Result<Json<Session>, AppError> {
    let session = state.registry().get_session(&session_code).await?;
    Ok(Json(session))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket
// ─────────────────────────────────────────────────────────────────────────────

/// `GET /api/v1/ws?userId=...`: Upgrade to `WebSocket`.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsQueryParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let user_id = params
        .user_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("userId is required.".to_string()))?;

    Ok(ws.on_upgrade(move |socket| handle_ws_connection(state, user_id, socket)))
}

/// Handle a single `WebSocket` connection for the lifetime of the socket.
async fn handle_ws_connection(state: AppState, user_id: String, socket: WebSocket) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (mut conn, mut rx) = state.broker.connect(&user_id);

    // Spawn task to forward outbound messages to the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!("Failed to serialize outbound message: {err}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Process inbound messages
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                state.broker.handle_text(&mut conn, text.as_str()).await;
            }
            Message::Binary(_) => {
                conn.reply(ServerMessage::error(
                    None,
                    &SessionError::Malformed("binary frames are not supported".into()),
                ));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Cleanup on disconnect: an abrupt close is an implicit leave
    state.broker.disconnect(conn).await;
    send_task.abort();
}
