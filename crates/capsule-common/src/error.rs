//! Unified error types for the Capsule workspace.
//!
//! The variants follow the runtime's error taxonomy: configuration errors
//! are rejected before any resource is touched, setup errors trigger a
//! rollback of partial state, and cleanup errors are aggregated rather
//! than aborting the remaining teardown steps.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum CapsuleError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// User input or configuration is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A container with the requested name already exists.
    #[error("container name already in use: {name}")]
    NameConflict {
        /// The conflicting name.
        name: String,
    },

    /// The requested transition is not allowed from the container's state.
    #[error("cannot {action} container {name}: it is {state}")]
    InvalidState {
        /// Container name.
        name: String,
        /// Current state.
        state: String,
        /// Attempted operation.
        action: &'static str,
    },

    /// A cgroup, mount, pipe, or process-start step failed.
    #[error("{stage} failed: {message}")]
    ResourceSetup {
        /// Setup stage that failed.
        stage: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// The startup handoff payload was missing or malformed.
    #[error("handoff protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// One or more teardown steps failed.
    #[error("cleanup incomplete: {}", .failures.join("; "))]
    PartialCleanup {
        /// Human-readable description of every failed step.
        failures: Vec<String>,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl CapsuleError {
    /// Builds an [`CapsuleError::Io`] for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds a [`CapsuleError::ResourceSetup`] from any displayable cause.
    pub fn setup(stage: &'static str, cause: impl fmt::Display) -> Self {
        Self::ResourceSetup {
            stage,
            message: cause.to_string(),
        }
    }

    /// Returns whether this error reports a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CapsuleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_cleanup_lists_every_failure() {
        let err = CapsuleError::PartialCleanup {
            failures: vec!["unmount volume: busy".into(), "remove cgroup: busy".into()],
        };
        assert_eq!(
            err.to_string(),
            "cleanup incomplete: unmount volume: busy; remove cgroup: busy"
        );
    }

    #[test]
    fn not_found_is_detected() {
        let err = CapsuleError::NotFound {
            kind: "container",
            id: "c1".into(),
        };
        assert!(err.is_not_found());
        assert!(!CapsuleError::setup("pipe", "EMFILE").is_not_found());
    }
}
