//! Error types for fleet reconciliation.
//!
//! Separates transient "busy" signals from hard failures so callers can tell
//! retryable outcomes from ones that need intervention, and keeps cycle-level
//! failures (configuration could not be loaded) apart from per-item ones.

use thiserror::Error;

/// Result type alias for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Failure reported by a fleet manager for a single create/delete call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FleetError {
    /// Backend is temporarily unable to serve the request.
    #[error("fleet manager busy while handling {name}")]
    Busy {
        /// Reader name the call was about.
        name: String,
    },

    /// The call failed and will not succeed without intervention.
    #[error("fleet operation on {name} failed: {message}")]
    Failed {
        /// Reader name the call was about.
        name: String,
        /// Backend error message.
        message: String,
    },
}

impl FleetError {
    /// Creates a busy error.
    pub fn busy(name: impl Into<String>) -> Self {
        Self::Busy { name: name.into() }
    }

    /// Creates a hard failure.
    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed { name: name.into(), message: message.into() }
    }

    /// Whether the call may succeed if retried.
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

/// Terminal outcome of a reconciliation operation after retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// Fleet manager stayed busy through every retry attempt.
    #[error("fleet manager still busy for {name} after {attempts} attempts")]
    Busy {
        /// Reader name the operation was about.
        name: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// The operation failed permanently.
    #[error("{name}: {message}")]
    Failed {
        /// Reader name the operation was about.
        name: String,
        /// Failure description.
        message: String,
    },

    /// Cancellation was requested before the operation completed.
    #[error("reconciliation cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// Creates a hard failure.
    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed { name: name.into(), message: message.into() }
    }

    /// Whether the failure is transient (a later pass may succeed unchanged).
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::Cancelled)
    }
}

/// Failure to load a subscriber source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// Source could not be reached or read.
    #[error("source {source_name} unreachable: {message}")]
    Unreachable {
        /// Name of the failing source.
        source_name: String,
        /// Failure description.
        message: String,
    },

    /// Source content could not be parsed.
    #[error("source {source_name} malformed: {message}")]
    Malformed {
        /// Name of the failing source.
        source_name: String,
        /// Parser error.
        message: String,
    },

    /// Source loaded but reported invalid entries; the snapshot is partial.
    #[error("source {source_name} reported {} invalid entries", .errors.len())]
    Invalid {
        /// Name of the failing source.
        source_name: String,
        /// Per-entry validation messages.
        errors: Vec<String>,
    },
}

impl LoadError {
    /// Name of the source that failed.
    pub fn source_name(&self) -> &str {
        match self {
            Self::Unreachable { source_name, .. }
            | Self::Malformed { source_name, .. }
            | Self::Invalid { source_name, .. } => source_name,
        }
    }
}

/// Failure of a triggered reload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReloadError {
    /// A reconciliation pass is already in progress.
    #[error("reconciliation already in progress")]
    Busy,

    /// Configuration could not be loaded; the previous desired state is kept.
    #[error("configuration load failed: {0}")]
    ConfigLoad(#[from] LoadError),

    /// Running readers could not be listed.
    #[error("fleet listing failed: {0}")]
    Fleet(String),

    /// The reconciliation task ended without producing an outcome.
    #[error("reconciliation pass aborted: {0}")]
    Aborted(String),

    /// The director has stopped.
    #[error("director stopped")]
    Stopped,
}

impl ReloadError {
    /// Whether the caller may simply try again later.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy | Self::ConfigLoad(_) | Self::Fleet(_) | Self::Aborted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_is_distinct_from_failed() {
        assert!(FleetError::busy("a--b--v1").is_busy());
        assert!(!FleetError::failed("a--b--v1", "quota").is_busy());

        let busy = ReconcileError::Busy { name: "a--b--v1".into(), attempts: 3 };
        assert!(busy.is_retryable());
        assert!(!ReconcileError::failed("a--b--v1", "quota").is_retryable());
    }

    #[test]
    fn error_display_format() {
        let busy = ReconcileError::Busy { name: "a--b--v1".into(), attempts: 3 };
        assert_eq!(busy.to_string(), "fleet manager still busy for a--b--v1 after 3 attempts");

        let invalid = LoadError::Invalid {
            source_name: "primary".into(),
            errors: vec!["x".into(), "y".into()],
        };
        assert_eq!(invalid.to_string(), "source primary reported 2 invalid entries");
        assert_eq!(invalid.source_name(), "primary");
    }

    #[test]
    fn reload_busy_is_retryable() {
        assert!(ReloadError::Busy.is_retryable());
        assert!(!ReloadError::Stopped.is_retryable());
    }
}
