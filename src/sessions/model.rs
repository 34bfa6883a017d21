use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A live game session shared by a host and its participants.
///
/// `state` is opaque to the broker: the game layer decides what it contains and which
/// phase (`waiting`, `playing`, `finished`) it encodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub host_id: String,
    pub participants: BTreeSet<String>,
    pub state: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Build a fresh session with the host as its sole participant.
    #[must_use]
    pub fn new(session_id: String, host_id: String, state: Value) -> Self {
        let now = Utc::now();
        Self {
            participants: BTreeSet::from([host_id.clone()]),
            session_id,
            host_id,
            state,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_host(&self, user_id: &str) -> bool {
        self.host_id == user_id
    }

    #[must_use]
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.contains(user_id)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Why a session was torn down. Carried to clients as the `session_ended` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    HostLeft,
    Expired,
    Shutdown,
    /// The session disappeared from the store without a known cause.
    Removed,
}

impl EndReason {
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::HostLeft => "The host has left the session.",
            Self::Expired => "The session expired after a period of inactivity.",
            Self::Shutdown => "The server is shutting down.",
            Self::Removed => "The session has ended.",
        }
    }
}

/// A semantic change to one session, published by the registry while the session's
/// critical section is held.
///
/// Each variant carries the session snapshot *after* the change (for `Ended`, the last
/// snapshot before teardown), so relays can work out the audience without another lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created {
        session: Session,
    },
    ParticipantJoined {
        session: Session,
        user_id: String,
    },
    ParticipantLeft {
        session: Session,
        user_id: String,
    },
    StateUpdated {
        session: Session,
    },
    Ended {
        session: Session,
        reason: EndReason,
    },
}

impl SessionEvent {
    #[must_use]
    pub const fn session(&self) -> &Session {
        match self {
            Self::Created { session }
            | Self::ParticipantJoined { session, .. }
            | Self::ParticipantLeft { session, .. }
            | Self::StateUpdated { session }
            | Self::Ended { session, .. } => session,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::ParticipantJoined { .. } => "participant_joined",
            Self::ParticipantLeft { .. } => "participant_left",
            Self::StateUpdated { .. } => "state_updated",
            Self::Ended { .. } => "ended",
        }
    }
}
