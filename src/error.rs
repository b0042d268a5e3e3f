//! Error types for arm control operations.

use thiserror::Error;

/// Errors that can occur while talking to the arm or its data files.
#[derive(Debug, Error)]
pub enum Error {
    /// Bus read/write failure (serial transport level).
    #[error("transport error: {0}")]
    Transport(String),

    /// No calibration record exists for the joint, or the record is unusable.
    #[error("joint '{0}' is not calibrated")]
    NotCalibrated(String),

    /// A value or procedure result failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Calibration/trajectory file could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A recording or playback session is already active.
    #[error("a {0} session is already active")]
    SessionActive(&'static str),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a Transport error with a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a Validation error with a message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a Persistence error with a message.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }
}

/// Result type alias for arm control operations.
pub type Result<T> = std::result::Result<T, Error>;
