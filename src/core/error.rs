//! Error types and HTTP mapping.
//!
//! `IdemError` covers every failure the coordination layer itself can
//! produce. Failures of the protected operation are a separate type,
//! [`OperationError`], so they can be handed back to the caller unmodified.
//! The `code` strings returned by [`IdemError::code`] are part of the wire
//! contract and must not change.

use thiserror::Error;

/// Coordination-layer error conditions.
#[derive(Debug, Error)]
pub enum IdemError {
    /// Another execution currently holds the key.
    #[error("idempotency key {key} is locked by another execution")]
    LockBusy { key: String },

    /// The backing store could not be reached or returned an I/O failure.
    #[error("idempotency store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// The caller's lock token is not the current holder of the key.
    #[error("lock token mismatch for {key}: lease lost or held by another execution")]
    TokenMismatch { key: String },

    /// A live completed record already exists for the key.
    #[error("idempotency record for {key} is already completed")]
    AlreadyCompleted { key: String },

    /// The client-supplied key is empty or too long.
    #[error("invalid idempotency key: {message}")]
    InvalidKey { message: String },

    /// A stored record could not be encoded or decoded.
    #[error("record serialization failed: {message}")]
    Serialization { message: String },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl IdemError {
    /// Create a StoreUnavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Create a TokenMismatch error.
    pub fn token_mismatch(key: impl Into<String>) -> Self {
        Self::TokenMismatch { key: key.into() }
    }

    /// Create an InvalidKey error.
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    /// Check if the condition is transient and the request may be retried later.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::LockBusy { .. } | Self::StoreUnavailable { .. })
    }

    /// Check if the coordinator should proceed without the idempotency
    /// guarantee when it encounters this error.
    ///
    /// Availability of the protected operation takes priority over strict
    /// deduplication, so backend failures fail open.
    pub fn is_fail_open(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::Serialization { .. }
        )
    }

    /// Stable machine-readable identifier.
    pub fn code(&self) -> &'static str {
        match self {
            Self::LockBusy { .. } => "IDEMPOTENCY_KEY_IN_USE",
            Self::StoreUnavailable { .. } => "IDEMPOTENCY_STORE_UNAVAILABLE",
            Self::TokenMismatch { .. } => "IDEMPOTENCY_TOKEN_MISMATCH",
            Self::AlreadyCompleted { .. } => "IDEMPOTENCY_ALREADY_COMPLETED",
            Self::InvalidKey { .. } => "IDEMPOTENCY_KEY_INVALID",
            Self::Serialization { .. } => "IDEMPOTENCY_RECORD_CORRUPT",
            Self::Internal { .. } => "IDEMPOTENCY_INTERNAL",
        }
    }

    /// HTTP status used when this error is surfaced to a client.
    pub fn http_status(&self) -> http::StatusCode {
        match self {
            Self::LockBusy { .. } => http::StatusCode::CONFLICT,
            Self::InvalidKey { .. } => http::StatusCode::BAD_REQUEST,
            Self::AlreadyCompleted { .. } => http::StatusCode::CONFLICT,
            Self::StoreUnavailable { .. } => http::StatusCode::SERVICE_UNAVAILABLE,
            Self::TokenMismatch { .. } | Self::Serialization { .. } | Self::Internal { .. } => {
                http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<std::io::Error> for IdemError {
    fn from(err: std::io::Error) -> Self {
        Self::unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for IdemError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

/// Result type using IdemError.
pub type IdemResult<T> = Result<T, IdemError>;

/// Failure reported by a protected operation.
///
/// The coordinator never caches one of these and never rewrites it: the
/// value returned to the caller is the value the operation produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct OperationError {
    /// HTTP status the operation wants surfaced.
    pub status: u16,
    /// Human-readable failure description.
    pub message: String,
}

impl OperationError {
    /// Create an operation error with an explicit status.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Create a 500 operation error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    /// Create the error used when a stream ends without its terminal frame.
    pub fn incomplete_stream() -> Self {
        Self::new(502, "stream ended before terminal frame")
    }

    /// Create the error used when a stream exceeds its maximum duration.
    pub fn stream_timeout() -> Self {
        Self::new(504, "stream exceeded maximum duration")
    }
}
