use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::sessions::SessionError;

/// Unified application error type that maps to JSON HTTP responses.
///
/// Error format: `{ "error": { "code": "...", "message": "..." } }`.
#[derive(Debug)]
pub enum AppError {
    /// 400 Bad Request
    BadRequest(String),
    /// A session-layer failure, mapped by kind
    Session(SessionError),
    /// 500 Internal Server Error (wraps any error, logs details, returns generic message)
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            Self::Session(err) => {
                let status = match err {
                    SessionError::NotFound(_) => StatusCode::NOT_FOUND,
                    SessionError::Duplicate(_) => StatusCode::CONFLICT,
                    SessionError::CodeSpaceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
                    SessionError::Malformed(_) | SessionError::NotParticipant { .. } => {
                        StatusCode::BAD_REQUEST
                    }
                };
                let code = match err {
                    SessionError::NotFound(_) => "NOT_FOUND",
                    _ => err.code(),
                };
                (status, code, err.to_string())
            }
            Self::Internal(err) => {
                tracing::error!("Internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        (
            status,
            Json(json!({
                "error": {
                    "code": code,
                    "message": message,
                }
            })),
        )
            .into_response()
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        Self::Session(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<sea_orm::DbErr> for AppError {
    fn from(err: sea_orm::DbErr) -> Self {
        Self::Internal(err.into())
    }
}
