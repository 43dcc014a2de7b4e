//! Error types and result aliases for ftl-core.

/// The result type used throughout ftl-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A reference string did not match `module.name` with valid
    /// identifier components.
    #[error("invalid reference {input:?}: {message}")]
    InvalidRef {
        /// The string that failed to parse.
        input: String,
        /// Description of what made it invalid.
        message: String,
    },

    /// A retry policy was declared with inconsistent parameters.
    #[error("invalid retry policy: {message}")]
    InvalidRetryPolicy {
        /// Description of the inconsistency.
        message: String,
    },
}

impl Error {
    /// Creates a new invalid-reference error.
    #[must_use]
    pub fn invalid_ref(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRef {
            input: input.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_ref_display() {
        let err = Error::invalid_ref("a b", "whitespace is not allowed");
        let msg = err.to_string();
        assert!(msg.contains("a b"));
        assert!(msg.contains("whitespace"));
    }
}
