//! Array Protocol Definitions
//!
//! This crate defines the wire protocol spoken between the controller and the
//! array boards: marker-delimited frames coming back from the boards, and the
//! per-array command batches going out to them.

pub mod codec;
pub mod commands;
pub mod error;

pub use codec::{
    encode_frame, FrameCodec, Markers, DEFAULT_MAX_FRAME_LEN, END_MARKER, READINESS_PHRASE,
    START_MARKER,
};
pub use commands::CommandBatch;
pub use error::{ProtocolError, Result};
