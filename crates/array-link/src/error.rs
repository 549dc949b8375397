//! Link error types

use crate::ChannelState;
use thiserror::Error;

/// Link-related errors
#[derive(Error, Debug)]
pub enum LinkError {
    /// Port could not be opened
    #[error("Port {address} unavailable: {reason}")]
    PortUnavailable { address: String, reason: String },

    /// Framing error while reading
    #[error("Protocol error: {0}")]
    Protocol(#[from] array_proto::ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device end of the stream went away
    #[error("Stream closed by device")]
    Disconnected,

    /// The read was abandoned by its caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Channel has no stream to operate on
    #[error("Channel is not open")]
    NotOpen,

    /// Channel was closed before
    #[error("Channel already closed")]
    AlreadyClosed,

    /// Operation not allowed in the channel's current state
    #[error("Cannot {operation} a channel in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ChannelState,
    },
}

/// Result type for link operations
pub type Result<T> = std::result::Result<T, LinkError>;
