//! Controller error types

use crate::session::SessionState;
use array_link::{ChannelState, LinkError};
use std::time::Duration;
use thiserror::Error;

/// Controller-related errors
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol error (bad operator input, command count mismatch)
    #[error("Protocol error: {0}")]
    Protocol(#[from] array_proto::ProtocolError),

    /// Link error
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// A port could not be opened during startup
    #[error("Serial port {index} ({address}) unavailable: {reason}")]
    PortUnavailable {
        index: usize,
        address: String,
        reason: String,
    },

    /// Boards did not report ready in time
    #[error("Timed out waiting for array(s) {indices:?} to report ready")]
    HandshakeTimeout { indices: Vec<usize> },

    /// Per-array bookkeeping went out of range during the handshake
    #[error("Handshake bookkeeping error on array {index}: {reason}")]
    HandshakeConfiguration { index: usize, reason: String },

    /// Handshake failed for another reason
    #[error("Handshake failed on array {index}: {source}")]
    Handshake {
        index: usize,
        #[source]
        source: HandshakeError,
    },

    /// A channel cannot take part in a dispatch
    #[error("Array {index} is not ready (state: {state:?})")]
    ChannelNotReady { index: usize, state: ChannelState },

    /// Operation not allowed in the session's current state
    #[error("Cannot {operation} while session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// An array produced no usable reply to a one-shot dispatch
    #[error("Array {index} did not reply: {reason}")]
    ReplyFailure { index: usize, reason: String },

    /// Some channels failed to close
    #[error("Failed to close array(s) {indices:?}")]
    CloseFailure { indices: Vec<usize> },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Interactive shell error
    #[error("Shell error: {0}")]
    Repl(String),
}

impl ControllerError {
    /// Whether startup may simply be attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControllerError::PortUnavailable { .. }
                | ControllerError::HandshakeTimeout { .. }
                | ControllerError::HandshakeConfiguration { .. }
                | ControllerError::Handshake { .. }
        )
    }
}

/// Why one array failed its handshake
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// No readiness message within the bound
    #[error("no readiness message within {0:?}")]
    Timeout(Duration),

    /// Worker reported into a slot other than its own
    #[error("worker for slot {expected} reported slot {reported}")]
    Configuration { expected: usize, reported: usize },

    /// Worker task died
    #[error("worker aborted: {0}")]
    Aborted(String),

    /// Stream failure
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Why one array produced no reply in a dispatch
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No reply within the bound
    #[error("no reply within {0:?}")]
    ReplyTimeout(Duration),

    /// Operator aborted the dispatch
    #[error("cancelled")]
    Cancelled,

    /// Worker reported into a slot other than its own
    #[error("worker for slot {expected} reported slot {reported}")]
    Configuration { expected: usize, reported: usize },

    /// Worker task died
    #[error("worker aborted: {0}")]
    Aborted(String),

    /// Stream or framing failure
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Result type for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;
