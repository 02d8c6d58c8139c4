// Error handling module
// Defines the error kinds surfaced by the session layer

use thiserror::Error;

/// Maximum length for response bodies carried in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Errors that can occur while talking to the remote API or managing the session
///
/// `Clone` so a single refresh failure can be delivered to every queued request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Transport unreachable, connection reset, or timeout
    #[error("Network error: {0}")]
    Network(String),

    /// Credentials rejected at sign-in
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// 401 classified as an expired access token (recoverable via refresh)
    #[error("Access token expired")]
    ExpiredCredential,

    /// 401 for any other reason (unrecoverable, forces sign-out)
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// The refresh endpoint itself failed
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// Non-401 error response from the API
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Token store read/write failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Response body could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// Build an API error from a status and a (possibly large) response body
    pub fn from_status(status: u16, body: &str) -> Self {
        SessionError::Api {
            status,
            message: truncate_body(body),
        }
    }

    /// Wrap any failure of the refresh call itself
    pub fn refresh_failed(cause: &SessionError) -> Self {
        match cause {
            SessionError::RefreshFailed(_) => cause.clone(),
            other => SessionError::RefreshFailed(other.to_string()),
        }
    }

    /// Check whether this error came from a 401 response
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            SessionError::ExpiredCredential | SessionError::Unauthorized { .. }
        )
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        // Categorize the error for better debugging
        let error_kind = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connection_failed"
        } else if e.is_request() {
            "request_error"
        } else if e.is_body() {
            "body_error"
        } else if e.is_decode() {
            "decode_error"
        } else {
            "unknown"
        };

        SessionError::Network(format!("{} (kind: {})", e, error_kind))
    }
}

/// Truncate a response body to avoid carrying excessive data in errors
pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }

    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}... (truncated, {} total bytes)",
        &body[..end],
        body.len()
    )
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
