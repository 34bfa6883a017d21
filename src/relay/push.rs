//! Push relay: registry events are routed straight to the connected sockets.

use async_trait::async_trait;

use crate::relay::{Connections, Relay, RelayKind};
use crate::sessions::model::SessionEvent;
use crate::sessions::protocol::route;

/// Delivers each event to the participants' socket channels as soon as it is published.
#[derive(Debug, Clone, Default)]
pub struct PushRelay {
    connections: Connections,
}

impl PushRelay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Relay for PushRelay {
    fn kind(&self) -> RelayKind {
        RelayKind::Push
    }

    fn connections(&self) -> &Connections {
        &self.connections
    }

    async fn publish(&self, event: SessionEvent) {
        let session_id = event.session().session_id.clone();
        tracing::trace!(session_id, event = event.kind(), "push relay publish");
        self.connections.deliver(&session_id, route(&event));
    }
}
