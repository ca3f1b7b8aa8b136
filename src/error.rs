//! Relay error types.
//!
//! Every failure is scoped to the request that caused it. Nothing here is
//! process-fatal: the WebSocket handler turns errors into `auth_failed`,
//! `send_failed` or `error` events, and the HTTP routes turn them into
//! status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Why a login attempt was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// No account with that username.
    NotFound,
    /// Password did not match the stored hash.
    InvalidCredentials,
    /// Too many recent failures; retry after the given number of seconds.
    Locked { retry_after_secs: i64 },
}

impl AuthFailure {
    /// Wire reason string sent in `auth_failed`.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthFailure::NotFound => "not_found",
            AuthFailure::InvalidCredentials => "invalid_credentials",
            AuthFailure::Locked { .. } => "locked",
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Authentication failed: {}", .0.reason())]
    Auth(AuthFailure),

    #[error("Storage unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Unknown user: {0}")]
    RecipientUnknown(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        RelayError::StoreUnavailable(e.to_string())
    }
}

impl From<bcrypt::BcryptError> for RelayError {
    fn from(e: bcrypt::BcryptError) -> Self {
        RelayError::StoreUnavailable(format!("password hash error: {}", e))
    }
}

impl RelayError {
    /// Human-readable reason suitable for sending back to a client.
    ///
    /// Storage details stay in the logs; clients only see a generic message.
    pub fn client_reason(&self) -> String {
        match self {
            RelayError::StoreUnavailable(_) => "Storage unavailable, try again later".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::Auth(_) => StatusCode::UNAUTHORIZED,
            RelayError::StoreUnavailable(e) => {
                tracing::error!(error = e.as_str(), "Store error while serving request");
                StatusCode::SERVICE_UNAVAILABLE
            }
            RelayError::RecipientUnknown(_) => StatusCode::NOT_FOUND,
            RelayError::Conflict(_) => StatusCode::CONFLICT,
        };

        let body = serde_json::json!({
            "error": self.client_reason(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_reason_strings() {
        assert_eq!(AuthFailure::NotFound.reason(), "not_found");
        assert_eq!(AuthFailure::InvalidCredentials.reason(), "invalid_credentials");
        assert_eq!(AuthFailure::Locked { retry_after_secs: 10 }.reason(), "locked");
    }

    #[test]
    fn test_store_errors_are_not_leaked_to_clients() {
        let err = RelayError::StoreUnavailable("disk I/O error at page 7".to_string());
        assert!(!err.client_reason().contains("page 7"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            RelayError::Conflict("taken".into()).into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            RelayError::Validation("bad".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::RecipientUnknown("bob".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
    }
}
