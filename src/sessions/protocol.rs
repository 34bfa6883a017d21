//! Message vocabulary shared by both relays, and the routing of session events to it.
//!
//! Every frame is a JSON object tagged by `type`:
//! `{ "type": "...", "sessionId"?, "userId"?, "state"?, "message"? }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sessions::error::SessionError;
use crate::sessions::model::{Session, SessionEvent};

/// Messages sent FROM the client TO the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Create a session, optionally with a chosen code.
    Host {
        session_id: Option<String>,
        user_id: Option<String>,
        state: Option<Value>,
    },
    Join {
        session_id: String,
        user_id: Option<String>,
    },
    /// Replace the session state wholesale. Targets the current session if `sessionId` is absent.
    StateUpdate {
        session_id: Option<String>,
        user_id: Option<String>,
        state: Value,
    },
    Leave {
        session_id: Option<String>,
        user_id: Option<String>,
    },
}

impl ClientMessage {
    /// The identity the client claims in the message, if any.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Host { user_id, .. }
            | Self::Join { user_id, .. }
            | Self::StateUpdate { user_id, .. }
            | Self::Leave { user_id, .. } => user_id.as_deref(),
        }
    }
}

/// Messages sent FROM the server TO the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    SessionCreated {
        session_id: String,
        host_id: String,
        state: Value,
        participants: Vec<String>,
    },
    /// Acknowledgment to the user who joined, with the current snapshot.
    Joined {
        session_id: String,
        user_id: String,
        host_id: String,
        state: Value,
        participants: Vec<String>,
    },
    ParticipantJoined {
        session_id: String,
        user_id: String,
    },
    ParticipantLeft {
        session_id: String,
        user_id: String,
    },
    StateUpdate {
        session_id: String,
        state: Value,
    },
    SessionEnded {
        session_id: String,
        message: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        code: String,
        message: String,
    },
}

impl ServerMessage {
    #[must_use]
    pub fn error(session_id: Option<String>, err: &SessionError) -> Self {
        Self::Error {
            session_id,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    #[must_use]
    pub fn joined(session: &Session, user_id: &str) -> Self {
        Self::Joined {
            session_id: session.session_id.clone(),
            user_id: user_id.to_string(),
            host_id: session.host_id.clone(),
            state: session.state.clone(),
            participants: session.participants.iter().cloned().collect(),
        }
    }
}

/// One message addressed to one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub user_id: String,
    pub message: ServerMessage,
}

impl Delivery {
    #[must_use]
    pub fn new(user_id: impl Into<String>, message: ServerMessage) -> Self {
        Self {
            user_id: user_id.into(),
            message,
        }
    }
}

/// Translate a session event into the messages each participant should receive.
///
/// The audience is always taken from the snapshot inside the event:
/// - `Created` goes to the host only.
/// - `ParticipantJoined` sends `joined` to the newcomer and `participant_joined` to everyone else.
/// - `ParticipantLeft` goes to the remaining participants (the leaver is already gone).
/// - `StateUpdated` goes to every participant, the sender included.
/// - `Ended` goes to every participant of the final snapshot.
#[must_use]
pub fn route(event: &SessionEvent) -> Vec<Delivery> {
    let session = event.session();
    let session_id = &session.session_id;

    match event {
        SessionEvent::Created { session } => vec![Delivery::new(
            session.host_id.clone(),
            ServerMessage::SessionCreated {
                session_id: session_id.clone(),
                host_id: session.host_id.clone(),
                state: session.state.clone(),
                participants: session.participants.iter().cloned().collect(),
            },
        )],
        SessionEvent::ParticipantJoined { session, user_id } => session
            .participants
            .iter()
            .map(|participant| {
                if participant == user_id {
                    Delivery::new(participant.clone(), ServerMessage::joined(session, user_id))
                } else {
                    Delivery::new(
                        participant.clone(),
                        ServerMessage::ParticipantJoined {
                            session_id: session_id.clone(),
                            user_id: user_id.clone(),
                        },
                    )
                }
            })
            .collect(),
        SessionEvent::ParticipantLeft { session, user_id } => session
            .participants
            .iter()
            .filter(|participant| *participant != user_id)
            .map(|participant| {
                Delivery::new(
                    participant.clone(),
                    ServerMessage::ParticipantLeft {
                        session_id: session_id.clone(),
                        user_id: user_id.clone(),
                    },
                )
            })
            .collect(),
        SessionEvent::StateUpdated { session } => session
            .participants
            .iter()
            .map(|participant| {
                Delivery::new(
                    participant.clone(),
                    ServerMessage::StateUpdate {
                        session_id: session_id.clone(),
                        state: session.state.clone(),
                    },
                )
            })
            .collect(),
        SessionEvent::Ended { session, reason } => session
            .participants
            .iter()
            .map(|participant| {
                Delivery::new(
                    participant.clone(),
                    ServerMessage::SessionEnded {
                        session_id: session_id.clone(),
                        message: reason.message().to_string(),
                    },
                )
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::model::EndReason;
    use serde_json::json;

    fn classroom() -> Session {
        let mut session = Session::new("ABC123".into(), "teacher".into(), json!({"phase": "waiting"}));
        session.participants.insert("amy".into());
        session.participants.insert("bo".into());
        session
    }

    #[test]
    fn test_parse_client_messages() {
        let host: ClientMessage =
            serde_json::from_str(r#"{"type":"host","sessionId":"abc123","state":{"phase":"waiting"}}"#)
                .unwrap_or(ClientMessage::Leave {
                    session_id: None,
                    user_id: None,
                });
        assert_eq!(
            host,
            ClientMessage::Host {
                session_id: Some("abc123".into()),
                user_id: None,
                state: Some(json!({"phase": "waiting"})),
            }
        );

        let update: Result<ClientMessage, _> =
            serde_json::from_str(r#"{"type":"state_update","state":{"word":"CAT"},"userId":"teacher"}"#);
        assert!(matches!(
            update,
            Ok(ClientMessage::StateUpdate { session_id: None, user_id: Some(ref u), .. }) if u == "teacher"
        ));
    }

    #[test]
    fn test_reject_malformed_client_messages() {
        // unknown type
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"explode"}"#).is_err());
        // join requires a session id
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"join"}"#).is_err());
        // state_update requires a state
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"state_update"}"#).is_err());
        // server-only type
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"session_ended"}"#).is_err());
    }

    #[test]
    fn test_server_message_wire_shape() {
        let msg = ServerMessage::StateUpdate {
            session_id: "ABC123".into(),
            state: json!({"phase": "playing"}),
        };
        let value = serde_json::to_value(&msg).unwrap_or_default();
        assert_eq!(
            value,
            json!({"type": "state_update", "sessionId": "ABC123", "state": {"phase": "playing"}})
        );

        let err = ServerMessage::error(None, &SessionError::NotFound("ZZZZZZ".into()));
        let value = serde_json::to_value(&err).unwrap_or_default();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "SESSION_NOT_FOUND");
        assert!(value.get("sessionId").is_none());
    }

    #[test]
    fn test_route_created_goes_to_host_only() {
        let session = Session::new("ABC123".into(), "teacher".into(), json!({}));
        let deliveries = route(&SessionEvent::Created { session });
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].user_id, "teacher");
        assert!(matches!(deliveries[0].message, ServerMessage::SessionCreated { .. }));
    }

    #[test]
    fn test_route_join_acks_joiner_and_notifies_others() {
        let deliveries = route(&SessionEvent::ParticipantJoined {
            session: classroom(),
            user_id: "bo".into(),
        });
        assert_eq!(deliveries.len(), 3);
        for delivery in &deliveries {
            if delivery.user_id == "bo" {
                assert!(matches!(delivery.message, ServerMessage::Joined { .. }));
            } else {
                assert_eq!(
                    delivery.message,
                    ServerMessage::ParticipantJoined {
                        session_id: "ABC123".into(),
                        user_id: "bo".into()
                    }
                );
            }
        }
    }

    #[test]
    fn test_route_state_update_includes_sender() {
        let deliveries = route(&SessionEvent::StateUpdated { session: classroom() });
        let mut recipients: Vec<_> = deliveries.iter().map(|d| d.user_id.as_str()).collect();
        recipients.sort_unstable();
        assert_eq!(recipients, vec!["amy", "bo", "teacher"]);
    }

    #[test]
    fn test_route_left_and_ended() {
        let mut session = classroom();
        session.participants.remove("bo");
        let left = route(&SessionEvent::ParticipantLeft {
            session: session.clone(),
            user_id: "bo".into(),
        });
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|d| d.user_id != "bo"));

        let ended = route(&SessionEvent::Ended {
            session,
            reason: EndReason::HostLeft,
        });
        assert_eq!(ended.len(), 2);
        assert!(ended.iter().all(|d| matches!(
            &d.message,
            ServerMessage::SessionEnded { message, .. } if message == EndReason::HostLeft.message()
        )));
    }
}
