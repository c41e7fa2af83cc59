//! Unified error handling for reliefops
//!
//! Every layer (store backends, lifecycle, auth, HTTP) reports failures
//! through `ReliefError` so callers can tell "not found" apart from
//! "try again" without inspecting messages.

use std::fmt;

use http::StatusCode;

/// Unified error types for request coordination
#[derive(Debug, Clone, PartialEq)]
pub enum ReliefError {
    /// Missing or malformed submission fields
    Validation(String),

    /// Tracking id or approval target does not exist
    NotFound(String),

    /// Store or auth backend communication failure
    Transport(String),

    /// Device geolocation denied or unsupported
    Permission(String),

    /// Missing, invalid or revoked operator credentials
    Unauthorized(String),

    /// A store precondition did not hold at write time
    Conflict(String),

    /// Client exceeded the intake rate limit
    RateLimited(String),

    /// Configuration-related errors
    Configuration(String),

    /// Internal system errors
    Internal(String),
}

impl fmt::Display for ReliefError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReliefError::Validation(msg) => write!(f, "Validation error: {msg}"),
            ReliefError::NotFound(msg) => write!(f, "Not found: {msg}"),
            ReliefError::Transport(msg) => write!(f, "Transport error: {msg}"),
            ReliefError::Permission(msg) => write!(f, "Permission denied: {msg}"),
            ReliefError::Unauthorized(msg) => write!(f, "Unauthorized: {msg}"),
            ReliefError::Conflict(msg) => write!(f, "Conflict: {msg}"),
            ReliefError::RateLimited(msg) => write!(f, "Rate limited: {msg}"),
            ReliefError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            ReliefError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for ReliefError {}

impl ReliefError {
    /// Only transport failures are worth retrying from scratch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReliefError::Transport(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReliefError::NotFound(_))
    }

    /// HTTP status used when the error reaches the API surface.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ReliefError::Validation(_) => StatusCode::BAD_REQUEST,
            ReliefError::NotFound(_) => StatusCode::NOT_FOUND,
            ReliefError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            ReliefError::Permission(_) => StatusCode::FORBIDDEN,
            ReliefError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ReliefError::Conflict(_) => StatusCode::CONFLICT,
            ReliefError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ReliefError::Configuration(_) | ReliefError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

// Error conversions
impl From<validator::ValidationErrors> for ReliefError {
    fn from(err: validator::ValidationErrors) -> Self {
        ReliefError::Validation(err.to_string())
    }
}

impl From<etcd_client::Error> for ReliefError {
    fn from(err: etcd_client::Error) -> Self {
        ReliefError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ReliefError {
    fn from(err: serde_json::Error) -> Self {
        ReliefError::Internal(format!("malformed document: {err}"))
    }
}

impl From<csv::Error> for ReliefError {
    fn from(err: csv::Error) -> Self {
        ReliefError::Internal(format!("csv export failed: {err}"))
    }
}

impl From<jsonwebtoken::errors::Error> for ReliefError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        ReliefError::Unauthorized(err.to_string())
    }
}

/// Result type alias for relief operations
pub type ReliefResult<T> = std::result::Result<T, ReliefError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> ReliefResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> ReliefResult<T> {
        self.map_err(|e| ReliefError::Internal(format!("{context}: {e}")))
    }
}

/// Convenience macros for error creation
#[macro_export]
macro_rules! validation_error {
    ($msg:expr) => {
        $crate::core::ReliefError::Validation($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::ReliefError::Validation(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_error {
    ($msg:expr) => {
        $crate::core::ReliefError::Transport($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::ReliefError::Transport(format!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinct_from_transport() {
        let missing = ReliefError::NotFound("abc".into());
        let down = ReliefError::Transport("connection reset".into());

        assert!(missing.is_not_found());
        assert!(!missing.is_retryable());
        assert!(down.is_retryable());
        assert!(!down.is_not_found());
        assert_ne!(missing.status_code(), down.status_code());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ReliefError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ReliefError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ReliefError::Transport("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ReliefError::RateLimited("x".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_with_context() {
        let res: Result<(), &str> = Err("boom");
        let err = res.with_context("loading snapshot").unwrap_err();
        assert_eq!(
            err,
            ReliefError::Internal("loading snapshot: boom".to_string())
        );
    }

    #[test]
    fn test_macros() {
        let err = validation_error!("{} is required", "district");
        assert_eq!(err, ReliefError::Validation("district is required".into()));
        let err = transport_error!("etcd unavailable");
        assert!(err.is_retryable());
    }
}
