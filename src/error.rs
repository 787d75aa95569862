//! Error types for wasim-client.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::CommandId;

/// Main error type for all client operations.
///
/// The first five variants form the operation-level taxonomy. The remaining
/// variants are transport and framing failures, which callers should treat
/// the same as [`WasimError::Fail`].
#[derive(Debug, Error)]
pub enum WasimError {
    /// No active session (or link) for an operation that requires one.
    #[error("Not connected")]
    NotConnected,

    /// No matching response arrived within the deadline.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed request, detected before anything was written.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The server answered with a Nak.
    #[error("{command:?} command rejected by server: {reason}")]
    Rejected { command: CommandId, reason: String },

    /// Generic failure (state machine conflict, internal error).
    #[error("{0}")]
    Fail(String),

    /// I/O error during pipe/socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parse error.
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Protocol error (invalid frame, short record, unknown enum value).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl WasimError {
    /// Shorthand for [`WasimError::InvalidArgument`].
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        WasimError::InvalidArgument(msg.into())
    }

    /// True for the variants that mean "the link or session went away".
    pub fn is_disconnect(&self) -> bool {
        matches!(self, WasimError::NotConnected | WasimError::ConnectionClosed)
    }
}

/// Result type alias using WasimError.
pub type Result<T> = std::result::Result<T, WasimError>;
