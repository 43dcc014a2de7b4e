//! Error types for the controller execution core.

use ftl_core::Ref;

/// The result type used throughout the controller crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in controller operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A requested row or entity does not exist.
    #[error("{entity} not found: {key}")]
    NotFound {
        /// The kind of entity that was looked up.
        entity: &'static str,
        /// The key that was looked up.
        key: String,
    },

    /// A write conflicted with existing state.
    #[error("conflict on {entity}: {message}")]
    Conflict {
        /// The kind of entity the write targeted.
        entity: &'static str,
        /// Description of the conflicting state.
        message: String,
    },

    /// A lease for the requested key is already held.
    #[error("lease is held: {key}")]
    LeaseHeld {
        /// The lease key, rendered in path form.
        key: String,
    },

    /// A caller-supplied argument failed validation.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the validation failure.
        message: String,
    },

    /// An operation targeted a state machine instance in a terminal state.
    #[error("state machine {fsm} instance {instance} is terminated")]
    Terminated {
        /// The state machine reference.
        fsm: Ref,
        /// The instance key.
        instance: String,
    },

    /// A cryptographic operation failed.
    #[error("encryption error: {message}")]
    Crypto {
        /// Description of the failure.
        message: String,
    },

    /// A transient failure that the caller may retry.
    #[error("transient error: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An error bubbled up from the core crate.
    #[error("core error: {0}")]
    Core(#[from] ftl_core::Error),

    /// A serialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Creates a new not-found error.
    #[must_use]
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// Creates a new conflict error.
    #[must_use]
    pub fn conflict(entity: &'static str, message: impl Into<String>) -> Self {
        Self::Conflict {
            entity,
            message: message.into(),
        }
    }

    /// Creates a new invalid-argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a new crypto error.
    #[must_use]
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Creates a new transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new transient error with a source.
    #[must_use]
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns `true` if this error is a not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if this error is a conflict error.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn not_found_display() {
        let err = Error::not_found("async call", "01J0000000000000000000000");
        assert!(err.to_string().contains("async call not found"));
        assert!(err.is_not_found());
    }

    #[test]
    fn lease_held_display() {
        let err = Error::LeaseHeld {
            key: "/system/async_call/42".into(),
        };
        assert!(err.to_string().contains("lease is held"));
    }

    #[test]
    fn terminated_display() {
        let err = Error::Terminated {
            fsm: "door.lock".parse().unwrap(),
            instance: "front".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("door.lock"));
        assert!(msg.contains("front"));
    }

    #[test]
    fn transient_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = Error::transient_with_source("key service unreachable", source);
        assert!(err.to_string().contains("transient error"));
        assert!(StdError::source(&err).is_some());
    }
}
