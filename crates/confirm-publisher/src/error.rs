//! Error types for the confirm publisher.

use std::time::Duration;
use thiserror::Error;

/// Transport (broker session) error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection to the broker is gone
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation attempted on a session that was already closed
    #[error("Session is closed")]
    SessionClosed,

    /// Transmit to a destination that was never declared
    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    /// Confirm-only operation on a session without confirm mode
    #[error("Session is not in confirm mode")]
    ConfirmModeRequired,
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Publisher error type.
#[derive(Error, Debug)]
pub enum PublishError {
    /// Outstanding confirmations did not drain within the overall timeout
    #[error("{outstanding} message(s) could not be confirmed within {timeout:?}")]
    ConfirmationTimeout { outstanding: usize, timeout: Duration },

    /// A batch was not fully confirmed within the per-batch bound
    #[error("Batch {batch} was not confirmed within {timeout:?}")]
    BatchConfirmTimeout { batch: usize, timeout: Duration },

    /// Session-level failure while declaring or transmitting
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A sequence number was recorded twice in the same session
    #[error("Duplicate sequence number {0} in outbox")]
    DuplicateSequence(u64),

    /// The transport assigned a different sequence number than it announced
    #[error("Sequence mismatch: expected {expected}, transport assigned {assigned}")]
    SequenceMismatch { expected: u64, assigned: u64 },

    /// Retry rounds exhausted with messages still rejected
    #[error("Gave up after {rounds} retry round(s), {remaining} message(s) still nacked")]
    RetriesExhausted { rounds: u32, remaining: usize },

    /// Shared retry deadline elapsed with messages still rejected
    #[error("Retry deadline exceeded after {elapsed:?}, {remaining} message(s) still nacked")]
    RetryDeadlineExceeded { elapsed: Duration, remaining: usize },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error (config file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (payload serialization, config file)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PublishError {
    /// Whether the error reports an invariant violation in the transport.
    ///
    /// These must never be retried.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            PublishError::DuplicateSequence(_) | PublishError::SequenceMismatch { .. }
        )
    }
}

/// Result type for publisher operations.
pub type PublishResult<T> = Result<T, PublishError>;
