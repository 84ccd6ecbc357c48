//! Core error types shared across Platen crates.

/// The result type used throughout platen-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the shared foundation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identifier failed validation.
    #[error("invalid id: {message}")]
    InvalidId {
        /// Description of the failure.
        message: String,
    },

    /// Input (configuration value, request field) failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An internal invariant was violated.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violation.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn invalid_input_display() {
        let err = Error::InvalidInput("BATCH_SIZE_PHASE must be a u32".into());
        assert!(err.to_string().contains("BATCH_SIZE_PHASE"));
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "object missing");
        let err = Error::storage_with_source("failed to read snapshot", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }
}
