//! Transport relays: how registry events reach connected clients.
//!
//! Both relays share the [`Connections`] table and the event routing in
//! [`crate::sessions::protocol::route`]; they only differ in how an event travels from the
//! registry to that table.

pub mod change_feed;
pub mod push;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::sessions::model::SessionEvent;
use crate::sessions::protocol::{Delivery, ServerMessage};

pub use change_feed::ChangeFeedRelay;
pub use push::PushRelay;

/// Outbound channel of one client connection. Drained in FIFO order by the socket writer.
pub type ClientTx = mpsc::UnboundedSender<ServerMessage>;

/// Which delivery substrate a relay uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    Push,
    ChangeFeed,
}

impl RelayKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::ChangeFeed => "change_feed",
        }
    }
}

impl fmt::Display for RelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" | "socket" | "websocket" => Ok(Self::Push),
            "change_feed" | "change-feed" | "changefeed" => Ok(Self::ChangeFeed),
            other => Err(anyhow::anyhow!(
                "RELAY_MODE must be 'push' or 'change_feed', got '{other}'"
            )),
        }
    }
}

/// Delivery strategy for registry events.
///
/// `publish` is awaited by the registry while the session's critical section is held, so
/// implementations must hand events on in call order and must never block on a client.
#[async_trait]
pub trait Relay: Send + Sync + fmt::Debug {
    fn kind(&self) -> RelayKind;

    /// Table of live client connections this relay delivers to.
    fn connections(&self) -> &Connections;

    /// Attach a client's outbound channel. Returns the connection it replaced, if any.
    fn connect(&self, user_id: &str, id: ConnectionId, tx: ClientTx) -> Option<ConnectionId> {
        self.connections().register(user_id, id, tx)
    }

    /// Detach a client, unless the user has reconnected since.
    fn disconnect(&self, user_id: &str, id: ConnectionId) -> bool {
        self.connections().unregister(user_id, id)
    }

    /// Deliver (or enqueue for delivery) one session event.
    async fn publish(&self, event: SessionEvent);
}

/// Identifies one socket connection, so a stale disconnect cannot evict a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Tracks the active connection of every user, keyed by user id.
///
/// A user holds at most one connection; connecting again replaces the previous sender.
#[derive(Debug, Clone, Default)]
pub struct Connections {
    clients: Arc<DashMap<String, (ConnectionId, ClientTx)>>,
}

impl Connections {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client connection. Returns the id of the connection it replaced, if any.
    pub fn register(&self, user_id: &str, id: ConnectionId, tx: ClientTx) -> Option<ConnectionId> {
        self.clients
            .insert(user_id.to_string(), (id, tx))
            .map(|(previous, _)| previous)
    }

    /// Unregister a client connection, unless the user has since reconnected.
    pub fn unregister(&self, user_id: &str, id: ConnectionId) -> bool {
        self.clients
            .remove_if(user_id, |_, (current, _)| *current == id)
            .is_some()
    }

    /// Send a message to one user. Returns `false` if the user is offline or the send failed.
    pub fn send(&self, user_id: &str, message: ServerMessage) -> bool {
        let Some(client) = self.clients.get(user_id) else {
            return false;
        };
        client.value().1.send(message).is_ok()
    }

    /// Fan a batch of deliveries out to their recipients.
    ///
    /// Offline participants are skipped; a closed channel is logged and does not stop
    /// delivery to the rest.
    pub fn deliver(&self, session_id: &str, deliveries: Vec<Delivery>) {
        for Delivery { user_id, message } in deliveries {
            if !self.is_connected(&user_id) {
                tracing::trace!(session_id, user_id, "participant offline, skipping delivery");
                continue;
            }
            if !self.send(&user_id, message) {
                tracing::warn!(session_id, user_id, "delivery failed, client channel closed");
            }
        }
    }

    #[must_use]
    pub fn is_connected(&self, user_id: &str) -> bool {
        self.clients.contains_key(user_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
