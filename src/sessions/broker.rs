//! Per-connection protocol handling: validates client messages and drives the registry.
//!
//! The broker never delivers broadcasts itself. Everything that results from a registry
//! mutation reaches clients through the relay; the broker only answers the sender directly
//! for errors and for idempotent re-joins.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::relay::{ClientTx, ConnectionId};
use crate::sessions::code::normalize_session_code;
use crate::sessions::error::SessionError;
use crate::sessions::protocol::{ClientMessage, ServerMessage};
use crate::sessions::registry::{LeaveOutcome, SessionRegistry};

/// One client connection, bound to a single user identity.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    user_id: String,
    tx: ClientTx,
    /// Session this connection was last associated with; the target of an implicit leave.
    current_session: Option<String>,
}

impl Connection {
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn current_session(&self) -> Option<&str> {
        self.current_session.as_deref()
    }

    /// Answer this connection directly. A closed channel means the socket is going away.
    pub fn reply(&self, message: ServerMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!(user_id = %self.user_id, "reply dropped, connection closing");
        }
    }
}

/// Applies the session protocol on behalf of connected clients.
#[derive(Debug, Clone)]
pub struct Broker {
    registry: SessionRegistry,
}

impl Broker {
    #[must_use]
    pub const fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Register a new connection for `user_id` with the relay.
    ///
    /// Returns the connection handle and the receiving end of its outbound channel, which
    /// the socket writer drains.
    pub fn connect(&self, user_id: &str) -> (Connection, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new();
        if let Some(previous) = self.registry.relay().connect(user_id, id, tx.clone()) {
            tracing::info!(user_id, %previous, "Replacing existing connection");
        }
        tracing::debug!(user_id, connection_id = %id, "Client connected");

        (
            Connection {
                id,
                user_id: user_id.to_string(),
                tx,
                current_session: None,
            },
            rx,
        )
    }

    /// Handle one raw text frame. Failures are answered with an `error` message and never
    /// close the connection.
    pub async fn handle_text(&self, conn: &mut Connection, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(user_id = %conn.user_id, "Malformed message: {err}");
                conn.reply(ServerMessage::error(None, &SessionError::from(err)));
                return;
            }
        };
        self.handle(conn, message).await;
    }

    /// Handle one parsed client message.
    pub async fn handle(&self, conn: &mut Connection, message: ClientMessage) {
        if let Err((session_id, err)) = self.dispatch(conn, message).await {
            tracing::debug!(user_id = %conn.user_id, code = err.code(), "Request rejected: {err}");
            conn.reply(ServerMessage::error(session_id, &err));
        }
    }

    async fn dispatch(
        &self,
        conn: &mut Connection,
        message: ClientMessage,
    ) -> Result<(), (Option<String>, SessionError)> {
        if let Some(claimed) = message.user_id()
            && claimed != conn.user_id
        {
            return Err((
                None,
                SessionError::Malformed("userId does not match the connection identity".into()),
            ));
        }

        match message {
            ClientMessage::Host {
                session_id, state, ..
            } => {
                let requested = session_id.as_deref().map(normalize_session_code);
                let session = self
                    .registry
                    .create_session(&conn.user_id, state.unwrap_or(Value::Null), session_id.as_deref())
                    .await
                    .map_err(|err| (requested, err))?;
                self.switch_to(conn, session.session_id).await;
            }
            ClientMessage::Join { session_id, .. } => {
                let code = normalize_session_code(&session_id);
                let outcome = self
                    .registry
                    .join_session(&code, &conn.user_id)
                    .await
                    .map_err(|err| (Some(code.clone()), err))?;
                if !outcome.newly_joined {
                    conn.reply(ServerMessage::joined(&outcome.session, &conn.user_id));
                }
                self.switch_to(conn, code).await;
            }
            ClientMessage::StateUpdate {
                session_id, state, ..
            } => {
                let code = Self::target(conn, session_id.as_deref())?;
                let applied = self
                    .registry
                    .update_state_as(&code, &conn.user_id, state)
                    .await
                    .map_err(|err| (Some(code.clone()), err))?;
                if !applied {
                    tracing::debug!(session_id = %code, user_id = %conn.user_id, "State update ignored, session gone");
                }
            }
            ClientMessage::Leave { session_id, .. } => {
                let code = Self::target(conn, session_id.as_deref())?;
                self.registry
                    .leave_session(&code, &conn.user_id)
                    .await
                    .map_err(|err| (Some(code.clone()), err))?;
                if conn.current_session.as_deref() == Some(code.as_str()) {
                    conn.current_session = None;
                }
            }
        }
        Ok(())
    }

    /// Tear down a connection: unregister it, then leave its current session.
    ///
    /// A connection already replaced by a newer one for the same user leaves nothing; the
    /// session now belongs to the newer socket.
    pub async fn disconnect(&self, mut conn: Connection) {
        if !self.registry.relay().disconnect(&conn.user_id, conn.id) {
            tracing::debug!(user_id = %conn.user_id, connection_id = %conn.id, "Stale connection closed");
            return;
        }
        self.leave_current(&mut conn).await;
        tracing::debug!(user_id = %conn.user_id, connection_id = %conn.id, "Client disconnected");
    }

    /// Make `code` the connection's current session, leaving the previous one if it differs.
    /// Called only once the new session has been created or joined.
    async fn switch_to(&self, conn: &mut Connection, code: String) {
        let previous = conn.current_session.replace(code);
        if previous == conn.current_session {
            return;
        }
        if let Some(previous) = previous {
            self.leave_session_quietly(&previous, &conn.user_id).await;
        }
    }

    /// Leave whatever session the connection is associated with, ignoring sessions that
    /// already ended.
    async fn leave_current(&self, conn: &mut Connection) {
        if let Some(code) = conn.current_session.take() {
            self.leave_session_quietly(&code, &conn.user_id).await;
        }
    }

    async fn leave_session_quietly(&self, code: &str, user_id: &str) {
        match self.registry.leave_session(code, user_id).await {
            Ok(LeaveOutcome::Ended) => {
                tracing::info!(session_id = %code, user_id, "Host left, session ended");
            }
            Ok(LeaveOutcome::Left | LeaveOutcome::NotMember) | Err(SessionError::NotFound(_)) => {}
            Err(err) => {
                tracing::warn!(session_id = %code, user_id, "Implicit leave failed: {err}");
            }
        }
    }

    /// Resolve the session a message targets: the explicit code, else the current session.
    fn target(
        conn: &Connection,
        session_id: Option<&str>,
    ) -> Result<String, (Option<String>, SessionError)> {
        session_id
            .map(normalize_session_code)
            .or_else(|| conn.current_session.clone())
            .ok_or_else(|| {
                (
                    None,
                    SessionError::Malformed("sessionId is required outside a session".into()),
                )
            })
    }
}
