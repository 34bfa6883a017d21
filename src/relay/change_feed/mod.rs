//! Change-feed relay: registry events are written to the `live_session` table, and clients
//! are served from the table's row-change feed instead of directly.
//!
//! A single feed task owns the previous image of every row. Each notification is diffed
//! against that image (see [`diff::diff_rows`]) to recover joins, leaves, state changes and
//! teardowns, which are then routed exactly like the push relay routes registry events.

pub mod diff;
pub mod store;

use std::collections::HashMap;

use async_trait::async_trait;
use sea_orm::{DatabaseConnection, DbErr};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::relay::{Connections, Relay, RelayKind};
use crate::sessions::model::{Session, SessionEvent};
use crate::sessions::protocol::route;

pub use diff::diff_rows;
pub use store::{RowChange, RowOp, SessionStore};

/// Relay backed by persisted session rows and their change notifications.
#[derive(Debug, Clone)]
pub struct ChangeFeedRelay {
    connections: Connections,
    store: SessionStore,
}

impl ChangeFeedRelay {
    /// Load persisted rows, start translating the store's change feed, and return the relay
    /// together with the recovered sessions (to be handed to the registry's `restore`).
    ///
    /// The feed task stops once every clone of the relay (and its store) is dropped.
    ///
    /// # Errors
    ///
    /// Returns the database error if the initial load fails.
    pub async fn start(store: SessionStore) -> Result<(Self, Vec<Session>), DbErr> {
        let connections = Connections::new();
        // Subscribe before loading, so no write can fall between the load and the feed.
        let feed = store.subscribe();
        let recovered = store.load_all().await?;

        let translator = FeedTranslator {
            snapshots: recovered
                .iter()
                .map(|session| (session.session_id.clone(), session.clone()))
                .collect(),
            connections: connections.clone(),
            db: store.db().clone(),
        };
        tokio::spawn(translator.run(feed));

        tracing::info!(recovered = recovered.len(), "Change-feed relay started");
        Ok((Self { connections, store }, recovered))
    }

    #[must_use]
    pub const fn store(&self) -> &SessionStore {
        &self.store
    }
}

#[async_trait]
impl Relay for ChangeFeedRelay {
    fn kind(&self) -> RelayKind {
        RelayKind::ChangeFeed
    }

    fn connections(&self) -> &Connections {
        &self.connections
    }

    async fn publish(&self, event: SessionEvent) {
        if let Err(err) = self.store.persist(&event).await {
            tracing::error!(
                session_id = %event.session().session_id,
                event = event.kind(),
                "Failed to persist session change: {err}"
            );
        }
    }
}

/// Owns the previous image of every row and turns feed notifications into deliveries.
struct FeedTranslator {
    snapshots: HashMap<String, Session>,
    connections: Connections,
    db: DatabaseConnection,
}

impl FeedTranslator {
    async fn run(mut self, mut feed: broadcast::Receiver<RowChange>) {
        loop {
            match feed.recv().await {
                Ok(change) => self.apply(change),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Change feed lagged, resynchronizing from table");
                    self.resync().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("Change feed closed");
    }

    fn apply(&mut self, change: RowChange) {
        let RowChange {
            op,
            row,
            end_reason,
        } = change;
        let id = row.session_id.clone();

        let mut events = match op {
            // A fresh insert never diffs against a stale image of a reused code.
            RowOp::Insert => {
                self.snapshots.insert(id, row.clone());
                diff_rows(None, Some(&row))
            }
            RowOp::Update => {
                let previous = self.snapshots.insert(id, row.clone());
                diff_rows(previous.as_ref(), Some(&row))
            }
            RowOp::Delete => {
                let previous = self.snapshots.remove(&id).unwrap_or(row);
                diff_rows(Some(&previous), None)
            }
        };

        if let Some(reason) = end_reason {
            for event in &mut events {
                if let SessionEvent::Ended { reason: ended, .. } = event {
                    *ended = reason;
                }
            }
        }
        self.dispatch(&events);
    }

    /// Reload every row and diff it against the held images, so missed notifications still
    /// reach clients as the equivalent semantic events.
    async fn resync(&mut self) {
        let rows = match store::load_rows(&self.db).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::error!("Change feed resync failed: {err}");
                return;
            }
        };

        let mut current: HashMap<String, Session> = rows
            .into_iter()
            .map(|session| (session.session_id.clone(), session))
            .collect();
        let mut events = Vec::new();

        for (id, previous) in std::mem::take(&mut self.snapshots) {
            events.extend(diff_rows(Some(&previous), current.get(&id)));
            if let Some(row) = current.remove(&id) {
                self.snapshots.insert(id, row);
            }
        }
        for (id, row) in current {
            events.extend(diff_rows(None, Some(&row)));
            self.snapshots.insert(id, row);
        }

        self.dispatch(&events);
    }

    fn dispatch(&self, events: &[SessionEvent]) {
        for event in events {
            let session_id = &event.session().session_id;
            tracing::trace!(session_id, event = event.kind(), "change feed event");
            self.connections.deliver(session_id, route(event));
        }
    }
}
