//! Durable `live_session` rows and the change feed emitted after every write.

use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter};
use tokio::sync::broadcast;

use crate::entities::live_session;
use crate::sessions::model::{EndReason, Session, SessionEvent};

/// Feed capacity. A subscriber that falls further behind resynchronizes from the table.
const FEED_CAPACITY: usize = 1024;

/// Kind of row-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

/// One whole-row change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    pub op: RowOp,
    /// Row image after the change (for deletes, the last image).
    pub row: Session,
    /// Why the row was deleted, when the writer knows.
    pub end_reason: Option<EndReason>,
}

/// Writes session rows through sea-orm and publishes a [`RowChange`] for each committed write.
#[derive(Debug, Clone)]
pub struct SessionStore {
    db: DatabaseConnection,
    feed: broadcast::Sender<RowChange>,
}

impl SessionStore {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self { db, feed }
    }

    #[must_use]
    pub const fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Subscribe to row changes committed from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RowChange> {
        self.feed.subscribe()
    }

    /// Mirror a registry event into the table, then announce the row change.
    ///
    /// # Errors
    ///
    /// Returns the database error if the write fails; nothing is announced in that case.
    pub async fn persist(&self, event: &SessionEvent) -> Result<(), DbErr> {
        let row = event.session();
        let change = match event {
            SessionEvent::Created { .. } => {
                live_session::Entity::insert(live_session::ActiveModel::from(row))
                    .exec_without_returning(&self.db)
                    .await?;
                RowChange {
                    op: RowOp::Insert,
                    row: row.clone(),
                    end_reason: None,
                }
            }
            SessionEvent::ParticipantJoined { .. }
            | SessionEvent::ParticipantLeft { .. }
            | SessionEvent::StateUpdated { .. } => {
                let result = live_session::Entity::update_many()
                    .set(live_session::ActiveModel::from(row))
                    .filter(live_session::Column::Id.eq(row.session_id.as_str()))
                    .exec(&self.db)
                    .await?;
                if result.rows_affected == 0 {
                    return Err(DbErr::RecordNotUpdated);
                }
                RowChange {
                    op: RowOp::Update,
                    row: row.clone(),
                    end_reason: None,
                }
            }
            SessionEvent::Ended { reason, .. } => {
                live_session::Entity::delete_by_id(row.session_id.clone())
                    .exec(&self.db)
                    .await?;
                RowChange {
                    op: RowOp::Delete,
                    row: row.clone(),
                    end_reason: Some(*reason),
                }
            }
        };

        // No subscribers is fine: nobody is listening yet.
        let _ = self.feed.send(change);
        Ok(())
    }

    /// Load every persisted session row.
    ///
    /// # Errors
    ///
    /// Returns the database error if the query fails.
    pub async fn load_all(&self) -> Result<Vec<Session>, DbErr> {
        load_rows(&self.db).await
    }
}

/// Load every persisted session row, skipping (and logging) rows that fail to decode.
///
/// # Errors
///
/// Returns the database error if the query fails.
pub async fn load_rows(db: &DatabaseConnection) -> Result<Vec<Session>, DbErr> {
    let models = live_session::Entity::find().all(db).await?;
    Ok(models
        .into_iter()
        .filter_map(|model| {
            let id = model.id.clone();
            Session::try_from(model)
                .map_err(|err| tracing::warn!(session_id = %id, "Skipping unreadable row: {err}"))
                .ok()
        })
        .collect())
}
