//! Protocol error types

use thiserror::Error;

/// Protocol-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Start and end markers cannot be told apart
    #[error("Start and end markers must differ (both are 0x{0:02X})")]
    InvalidMarkers(u8),

    /// Marker bytes must be single-byte ASCII characters
    #[error("Marker byte 0x{0:02X} is not ASCII")]
    NonAsciiMarker(u8),

    /// Outbound payload would be split by a marker byte
    #[error("Payload contains marker byte 0x{marker:02X}")]
    PayloadContainsMarker { marker: u8 },

    /// Inbound frame exceeded the configured payload limit
    #[error("Frame too large (max: {max} bytes)")]
    FrameTooLarge { max: usize },

    /// Inbound frame carried a byte outside ASCII
    #[error("Frame contains non-ASCII byte 0x{byte:02X}")]
    InvalidEncoding { byte: u8 },

    /// Operator command segment is not a simple numeric command
    #[error("Invalid command at position {index}: {segment:?}")]
    InvalidCommand { index: usize, segment: String },

    /// Command count does not match the number of arrays
    #[error("Command batch has {actual} command(s) but {expected} array(s) are connected")]
    BatchSizeMismatch { expected: usize, actual: usize },
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
