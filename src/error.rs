use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::state::TransitionError;

/// Everything a request against the poker store can fail with.
#[derive(Debug, thiserror::Error)]
pub enum PokerError {
    #[error("{field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    #[error("{0} not found")]
    NotFound(&'static str),

    /// The action doesn't fit the session's current status. Nothing was changed.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("could not connect to database: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("{0}")]
    Internal(String),
}

impl PokerError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }
}

impl From<TransitionError> for PokerError {
    fn from(e: TransitionError) -> Self {
        Self::Conflict(e.to_string())
    }
}

impl IntoResponse for PokerError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::Validation { field, message } => {
                let mut errors = serde_json::Map::new();
                errors.insert((*field).to_string(), json!([message]));
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    json!({ "error": "Validation failed", "errors": errors }),
                )
            }
            Self::NotFound(_) => (
                StatusCode::NOT_FOUND,
                json!({ "error": "Not found", "message": self.to_string() }),
            ),
            Self::Conflict(reason) => (StatusCode::BAD_REQUEST, json!({ "error": reason })),
            Self::Forbidden(message) => (
                StatusCode::FORBIDDEN,
                json!({ "error": "Forbidden", "message": message }),
            ),
            Self::Unauthorized(message) => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "Unauthorized", "message": message }),
            ),
            _ => {
                tracing::error!(error = %self, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
