use std::collections::BTreeSet;

use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::sessions::model::Session;

/// Durable mirror of a live session, written by the change-feed relay.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "live_session")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub host_id: String,
    /// JSON array of user ids.
    pub participants: Json,
    pub state: Json,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<&Session> for ActiveModel {
    fn from(session: &Session) -> Self {
        Self {
            id: Set(session.session_id.clone()),
            host_id: Set(session.host_id.clone()),
            participants: Set(Json::from(
                session.participants.iter().cloned().collect::<Vec<_>>(),
            )),
            state: Set(session.state.clone()),
            created_at: Set(session.created_at.fixed_offset()),
            updated_at: Set(session.updated_at.fixed_offset()),
        }
    }
}

impl TryFrom<Model> for Session {
    type Error = serde_json::Error;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let participants: BTreeSet<String> = serde_json::from_value(model.participants)?;
        Ok(Self {
            session_id: model.id,
            host_id: model.host_id,
            participants,
            state: model.state,
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
        })
    }
}
