#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

use classroom_live::config::{Config, Environment};
use classroom_live::relay::change_feed::SessionStore;
use classroom_live::relay::{ChangeFeedRelay, PushRelay, RelayKind};
use classroom_live::sessions::{Broker, RegistrySettings, SessionRegistry};
use classroom_live::state::AppState;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a test waits for a message that must arrive.
const RECV_TIMEOUT: Duration = Duration::from_secs(3);

pub fn test_config(relay_mode: RelayKind) -> Config {
    Config {
        database_url: None,
        server_host: std::net::IpAddr::from([127, 0, 0, 1]),
        server_port: 0,
        environment: Environment::Development,
        log_level: "warn".to_string(),
        relay_mode,
        session_ttl: Duration::from_secs(3600),
        sweep_interval: Duration::from_secs(60),
        frontend_url: "http://localhost:3001".to_string(),
    }
}

/// App state backed by the push relay.
pub fn push_state() -> AppState {
    let registry = SessionRegistry::new(Arc::new(PushRelay::new()), RegistrySettings::default());
    AppState::new(test_config(RelayKind::Push), Broker::new(registry), None)
}

/// App state backed by the change-feed relay over an in-memory `SQLite` database.
pub async fn change_feed_state() -> anyhow::Result<AppState> {
    let db = classroom_live::db::connect_and_migrate("sqlite::memory:").await?;

    let (relay, recovered) = ChangeFeedRelay::start(SessionStore::new(db.clone())).await?;
    let registry = SessionRegistry::new(Arc::new(relay), RegistrySettings::default());
    registry.restore(recovered);
    Ok(AppState::new(
        test_config(RelayKind::ChangeFeed),
        Broker::new(registry),
        Some(db),
    ))
}

pub fn app(state: AppState) -> Router {
    classroom_live::routes::router().with_state(state)
}

/// Test helper: send a GET request to the app and return (status, body).
pub async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap_or_default();

    let response = app.clone().oneshot(request).await.unwrap_or_default();

    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map(http_body_util::Collected::to_bytes)
        .unwrap_or_default();
    let body_str = String::from_utf8(body.to_vec()).unwrap_or_default();

    (status, body_str)
}

/// Serve the app on an ephemeral local port.
pub async fn spawn_server(state: AppState) -> anyhow::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = app(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(addr)
}

/// Open a `WebSocket` as `user_id`.
pub async fn connect(addr: SocketAddr, user_id: &str) -> anyhow::Result<Ws> {
    let (ws, _response) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/api/v1/ws?userId={user_id}"))
            .await
            .context("websocket handshake failed")?;
    Ok(ws)
}

pub async fn send(ws: &mut Ws, message: serde_json::Value) -> anyhow::Result<()> {
    ws.send(Message::Text(message.to_string().into()))
        .await
        .context("websocket send failed")
}

/// Receive the next JSON text frame, failing the test if none arrives in time.
pub async fn recv(ws: &mut Ws) -> anyhow::Result<serde_json::Value> {
    try_recv(ws, RECV_TIMEOUT)
        .await
        .context("timed out waiting for a websocket message")
}

/// Receive the next JSON text frame within `wait`, if any.
pub async fn try_recv(ws: &mut Ws, wait: Duration) -> Option<serde_json::Value> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let frame = tokio::time::timeout_at(deadline, ws.next()).await.ok()??;
        match frame.ok()? {
            Message::Text(text) => return serde_json::from_str(text.as_str()).ok(),
            Message::Close(_) => return None,
            _ => {}
        }
    }
}
