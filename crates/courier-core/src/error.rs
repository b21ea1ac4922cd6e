//! Error types shared by every courier crate.
//!
//! Lower-level failures (state persistence, payload encoding, invalid input)
//! that the fleet and dispatch crates wrap into their own taxonomies.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for internal operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Durable state could not be read or written.
    #[error("State store error: {0}")]
    Store(String),

    /// Value could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Returns whether retrying the same operation may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
