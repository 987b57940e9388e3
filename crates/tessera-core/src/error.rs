use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Standard error type for the session subsystem.
///
/// Validation failures (bad signature, unknown token, expiry, revocation) are
/// not errors: `validate_session` reports them as `None`. Errors are reserved
/// for policy denials the caller must react to and for storage faults.
#[derive(Debug, Error)]
pub enum TesseraError {
    #[error("Not authenticated")]
    Authentication,

    #[error("Not authenticated")]
    SessionExpired,

    #[error("Security policy violation: {0}")]
    Security(String),

    #[error("Not found: {0}")]
    RecordNotFound(String),

    #[error("Session token collision")]
    DuplicateToken,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] sea_orm::DbErr),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            TesseraError::Authentication | TesseraError::SessionExpired => StatusCode::UNAUTHORIZED,
            TesseraError::Security(_) => StatusCode::TOO_MANY_REQUESTS,
            TesseraError::RecordNotFound(_) => StatusCode::NOT_FOUND,
            TesseraError::DuplicateToken
            | TesseraError::Config(_)
            | TesseraError::Store(_)
            | TesseraError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code string for this error.
    ///
    /// Authentication and expiry share a code so clients cannot tell a
    /// forged token from a stale one.
    pub fn error_code(&self) -> &'static str {
        match self {
            TesseraError::Authentication | TesseraError::SessionExpired => "UNAUTHORIZED",
            TesseraError::Security(_) => "SECURITY_LOCKOUT",
            TesseraError::RecordNotFound(_) => "NOT_FOUND",
            TesseraError::DuplicateToken => "TOKEN_COLLISION",
            TesseraError::Config(_) => "CONFIG_ERROR",
            TesseraError::Store(_) => "STORE_ERROR",
            TesseraError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to hand to a client. Store and internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            TesseraError::DuplicateToken
            | TesseraError::Config(_)
            | TesseraError::Store(_)
            | TesseraError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Error detail for API responses.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
}

impl axum::response::IntoResponse for TesseraError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.public_message(),
            },
        };

        match serde_json::to_vec(&body) {
            Ok(bytes) => (
                status,
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                bytes,
            )
                .into_response(),
            Err(_) => (status, "Internal Server Error").into_response(),
        }
    }
}
