//! Error types for the HTTP layer.
//!
//! [`ObserverError`] unifies every handler failure into one enum that
//! converts into a JSON response of the form
//! `{"error": {"code": 404, "message": "..."}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors returned by the HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    /// The requested path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested path lies outside the permitted root.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The request body is incomplete.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ObserverError {
    /// HTTP status this error maps to.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ObserverError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            Self::NotFound(msg) | Self::Forbidden(msg) | Self::BadRequest(msg) | Self::Internal(msg) => msg,
        };

        let body = serde_json::json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
            },
        });

        (status, axum::Json(body)).into_response()
    }
}
