//! Error types for the Tollgate service.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// A rate-limit denial is not an error: it is reported as
/// [`Decision::Denied`](crate::ratelimit::Decision::Denied).
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Bucket capacity is not a finite number of at least one permit.
    ///
    /// Admission takes one whole permit, so a bucket holding less than one
    /// could never admit a request.
    #[error("Invalid capacity {0}: must be a finite value of at least 1")]
    InvalidCapacity(f64),

    /// Refill rate is not a finite positive number
    #[error("Invalid refill rate {0}: must be a finite value greater than 0")]
    InvalidRefillRate(f64),

    /// Interval-based quota with an empty interval or zero requests
    #[error("Invalid quota interval: {0}")]
    InvalidInterval(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The client identity could not be determined in per-client mode
    #[error("Client key extraction failed: {0}")]
    KeyExtraction(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
