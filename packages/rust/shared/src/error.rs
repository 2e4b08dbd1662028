//! Error types for docflow.
//!
//! Library crates use [`DocflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all docflow operations.
#[derive(Debug, thiserror::Error)]
pub enum DocflowError {
    /// The analysis job could not be started.
    #[error("submission error: {0}")]
    Submission(String),

    /// Job status or result retrieval failed.
    #[error("poll error: {0}")]
    Poll(String),

    /// Result persistence or checkpoint storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The job reported a status outside the recognized set.
    #[error("unrecognized job status: {status:?}")]
    UnrecognizedStatus { status: String },

    /// A job status transition that would move the job backwards.
    #[error("invalid job status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Another runner owns the execution, or the checkpoint moved underneath us.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Data validation error (bad key, malformed checkpoint, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DocflowError>;

impl DocflowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a conflict error from any displayable message.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an unrecognized-status error.
    pub fn unrecognized_status(status: impl Into<String>) -> Self {
        Self::UnrecognizedStatus {
            status: status.into(),
        }
    }

    /// Whether the substrate may re-invoke the failing step.
    ///
    /// Collaborator failures are treated as transient. Everything else
    /// (unrecognized status, bad data, bad config) fails the workflow.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Submission(_) | Self::Poll(_) | Self::Storage(_))
    }
}
