//! Error types for the Turnstile engine.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Rejections are not errors: an over-limit key produces an ordinary
/// [`Decision`](crate::ratelimit::Decision) with `admitted == false`.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid limiter or process configuration, detected at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// The window store could not be read or updated
    #[error("Store error: {0}")]
    Store(String),

    /// A blocking acquisition was abandoned by its caller
    #[error("Wait cancelled after {waited:?}")]
    Cancelled {
        /// Time spent sleeping before cancellation
        waited: std::time::Duration,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(e: config::ConfigError) -> Self {
        TurnstileError::Config(e.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
