//! Error and Result types for recording database operations.

use crate::storage::ElementType;
use std::time::Duration;
use thiserror::Error;

/// A convenience `Result` type for recording database operations.
pub type Result<T> = std::result::Result<T, RecDbError>;

/// The error type for recording database operations.
#[derive(Debug, Error)]
pub enum RecDbError {
    /// Operation issued in the wrong lifecycle phase.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The write lock is held by another open transaction.
    #[error("Write lock busy: transaction {holder} is open")]
    Busy {
        /// Identifier of the transaction holding the write lock.
        holder: u64,
    },

    /// A definition collides with an existing one.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Channel did not exist at the queried point in history.
    #[error("Channel not found: {channel} (globalrev {globalrev})")]
    ChannelNotFound {
        /// Channel name that was looked up.
        channel: String,
        /// Globalrev the lookup was made against.
        globalrev: u64,
    },

    /// Channel exists but holds no recording at the queried point in history.
    #[error("No recording on channel {channel} as of globalrev {globalrev}")]
    RecordingNotFound {
        /// Channel name that was looked up.
        channel: String,
        /// Globalrev the lookup was made against.
        globalrev: u64,
    },

    /// Globalrev was never issued or is no longer retained.
    #[error("Globalrev not found: {0}")]
    GlobalrevNotFound(u64),

    /// Array slot does not exist in the recording.
    #[error("Array not found: {0}")]
    ArrayNotFound(String),

    /// Shape is invalid or inconsistent with the buffer.
    #[error("Size error: {0}")]
    SizeError(String),

    /// Element type does not match the declared type of the array.
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Element type declared for the array.
        expected: ElementType,
        /// Element type requested by the caller.
        actual: ElementType,
    },

    /// Recording contents were requested before they were published.
    #[error("Recording {channel} revision {revision} is not ready")]
    NotReady {
        /// Channel the recording belongs to.
        channel: String,
        /// Per-channel revision of the recording.
        revision: u64,
    },

    /// A blocked wait was released by closing its monitor.
    #[error("Wait cancelled: monitor closed")]
    Cancelled,

    /// A bounded wait elapsed.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Camera parameter name or value is invalid.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Frame source failure.
    #[error("Device error: {0}")]
    Device(String),

    /// Calibration inputs are missing or the solver failed.
    #[error("Calibration error: {0}")]
    Calibration(String),
}

impl RecDbError {
    /// Returns true for transient contention that may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RecDbError::Busy { .. } | RecDbError::Timeout(_))
    }
}
