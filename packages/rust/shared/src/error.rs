//! Error types for Natrium.
//!
//! Library crates use [`NatriumError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Natrium operations.
#[derive(Debug, thiserror::Error)]
pub enum NatriumError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// The external content generator failed or returned garbage.
    #[error("generation error: {0}")]
    Generation(String),

    /// The generator did not answer within the request deadline.
    #[error("generation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The chat transport refused or failed to deliver a message.
    #[error("transport error: {0}")]
    Transport(String),

    /// Another instance already holds the process lock.
    #[error("another instance is already running (pid {pid})")]
    AlreadyRunning { pid: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Input validation error (post length out of range, unknown technique, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, NatriumError>;

impl NatriumError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a generation error from any displayable message.
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    /// Create a transport error from any displayable message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
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

    /// Whether the failure came from the upstream generator (and a retry may help).
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Generation(_) | Self::Timeout { .. })
    }
}
