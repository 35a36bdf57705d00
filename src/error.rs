//! Error types for the Tollgate rate limiter.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// A denied request is not an error: it is reported as a successful
/// [`Decision`](crate::ratelimit::Decision) with `allowed == false`.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Bad configuration value, negative token count or empty key.
    /// Detected locally, the store is never contacted.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The store could not be reached, timed out, or has been closed.
    /// No bucket state was changed by the failed call.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store replied in a shape the codec does not accept.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether this error means the store could not be consulted.
    ///
    /// Callers use this to apply their own fail-open or fail-closed policy.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, TollgateError::StoreUnavailable(_))
    }

    /// Whether the store answered with a reply that could not be decoded.
    pub fn is_protocol(&self) -> bool {
        matches!(self, TollgateError::Protocol(_))
    }

    /// Whether the request was rejected before reaching the store.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, TollgateError::InvalidArgument(_))
    }
}

impl From<redis::RedisError> for TollgateError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            // A script error or an unexpected reply type means the script
            // and the limiter disagree about the wire shape.
            redis::ErrorKind::TypeError | redis::ErrorKind::ResponseError => {
                TollgateError::Protocol(err.to_string())
            }
            _ => TollgateError::StoreUnavailable(err.to_string()),
        }
    }
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
