use thiserror::Error;

/// Failures surfaced by the session registry and the message broker.
///
/// Every variant is recoverable: it is reported to the single caller (as an `error`
/// envelope over a socket, or a JSON error over HTTP) and never affects other sessions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// No live session has this code (expired, ended or mistyped).
    #[error("Session {0} not found.")]
    NotFound(String),

    /// A host supplied a code that is already in use.
    #[error("Session code {0} is already in use.")]
    Duplicate(String),

    /// The message could not be parsed or carries invalid fields.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A user tried to mutate a session they have not joined.
    #[error("User {user_id} is not a participant of session {session_id}.")]
    NotParticipant { session_id: String, user_id: String },

    /// Random code generation kept colliding with live sessions.
    #[error("Failed to generate a unique session code after {0} attempts")]
    CodeSpaceExhausted(usize),
}

impl SessionError {
    /// Stable machine-readable code, shared by HTTP and socket error payloads.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "SESSION_NOT_FOUND",
            Self::Duplicate(_) => "DUPLICATE_SESSION",
            Self::Malformed(_) => "MALFORMED_MESSAGE",
            Self::NotParticipant { .. } => "NOT_PARTICIPANT",
            Self::CodeSpaceExhausted(_) => "CODE_SPACE_EXHAUSTED",
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
