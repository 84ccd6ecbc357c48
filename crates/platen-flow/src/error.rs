//! Error types for the orchestration domain.

use platen_core::BatchId;

/// The result type used throughout platen-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A batch was not found.
    #[error("batch not found: {batch_id}")]
    BatchNotFound {
        /// The batch id that was not found.
        batch_id: BatchId,
    },

    /// A task was not found in the current phase.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task id that was not found.
        task_id: String,
    },

    /// An invalid task state transition was attempted.
    ///
    /// Surfacing this means a code path violated the task lifecycle; the
    /// orchestrator treats it as an internal invariant violation and fails
    /// the batch.
    #[error("invalid task transition: {from} -> {to} ({task_id})")]
    InvalidTaskTransition {
        /// The task whose transition was rejected.
        task_id: String,
        /// The current status.
        from: String,
        /// The attempted target status.
        to: String,
    },

    /// Configuration failed validation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from platen-core.
    #[error("core error: {0}")]
    Core(#[from] platen_core::Error),
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

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}
