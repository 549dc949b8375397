//! Marker-delimited framing
//!
//! Frame format on the wire:
//! ```text
//! [ 1 byte: start marker ] [ N bytes: ASCII payload ] [ 1 byte: end marker ]
//! ```
//!
//! There is no escaping, so a payload can never contain either marker.

use crate::{ProtocolError, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Default start marker (`<`)
pub const START_MARKER: u8 = 0x3C;

/// Default end marker (`>`)
pub const END_MARKER: u8 = 0x3E;

/// Default payload limit for a single inbound frame
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024;

/// Phrase a board sends once it has finished resetting
pub const READINESS_PHRASE: &str = "Arduino is ready";

/// The pair of bytes delimiting a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Markers {
    /// Byte opening a frame
    pub start: u8,

    /// Byte closing a frame
    pub end: u8,
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            start: START_MARKER,
            end: END_MARKER,
        }
    }
}

impl Markers {
    /// Create a marker pair, rejecting pairs that cannot delimit anything
    pub fn new(start: u8, end: u8) -> Result<Self> {
        let markers = Self { start, end };
        markers.validate()?;
        Ok(markers)
    }

    /// Check that the two markers are distinct ASCII bytes
    pub fn validate(&self) -> Result<()> {
        if let Some(marker) = [self.start, self.end].into_iter().find(|b| !b.is_ascii()) {
            return Err(ProtocolError::NonAsciiMarker(marker));
        }
        if self.start == self.end {
            return Err(ProtocolError::InvalidMarkers(self.start));
        }
        Ok(())
    }

    /// Find the first marker byte in `bytes`, if any
    pub fn find_in(&self, bytes: &[u8]) -> Option<u8> {
        bytes
            .iter()
            .copied()
            .find(|&b| b == self.start || b == self.end)
    }
}

/// Wrap a payload between the markers
///
/// Used for everything the controller puts on the wire, so both directions
/// share one framing scheme.
pub fn encode_frame(markers: &Markers, payload: &str) -> Result<String> {
    markers.validate()?;
    if let Some(marker) = markers.find_in(payload.as_bytes()) {
        return Err(ProtocolError::PayloadContainsMarker { marker });
    }

    let mut frame = String::with_capacity(payload.len() + 2);
    frame.push(char::from(markers.start));
    frame.push_str(payload);
    frame.push(char::from(markers.end));
    Ok(frame)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Discarding bytes until a start marker shows up
    Hunting,

    /// Accumulating payload until the end marker
    Collecting,
}

/// Incremental frame decoder
///
/// The decoder keeps its partial frame between calls, so the caller can feed
/// it whatever the stream produced so far and abandon a read at any point
/// without losing bytes already consumed.
#[derive(Debug)]
pub struct FrameCodec {
    markers: Markers,
    max_frame_len: usize,
    state: DecodeState,
    payload: BytesMut,
}

impl FrameCodec {
    /// Create a decoder for the given markers and payload limit
    pub fn new(markers: Markers, max_frame_len: usize) -> Self {
        Self {
            markers,
            max_frame_len,
            state: DecodeState::Hunting,
            payload: BytesMut::with_capacity(max_frame_len.min(DEFAULT_MAX_FRAME_LEN)),
        }
    }

    /// Markers this decoder looks for
    pub fn markers(&self) -> &Markers {
        &self.markers
    }

    /// Decode at most one frame from `src`
    ///
    /// Consumed bytes are removed from `src`. Returns `Ok(None)` when `src`
    /// ran out before a complete frame. A start marker seen mid-payload
    /// restarts the frame. A failed frame is consumed entirely, so decoding
    /// can continue after an error.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        let mut consumed = 0;

        let outcome = loop {
            let Some(&byte) = src.get(consumed) else {
                break Ok(None);
            };
            consumed += 1;

            match self.state {
                DecodeState::Hunting => {
                    if byte == self.markers.start {
                        self.state = DecodeState::Collecting;
                        self.payload.clear();
                    }
                }
                DecodeState::Collecting => {
                    if byte == self.markers.start {
                        self.payload.clear();
                    } else if byte == self.markers.end {
                        self.state = DecodeState::Hunting;
                        break self.finish().map(Some);
                    } else if self.payload.len() >= self.max_frame_len {
                        self.reset();
                        break Err(ProtocolError::FrameTooLarge {
                            max: self.max_frame_len,
                        });
                    } else {
                        self.payload.put_u8(byte);
                    }
                }
            }
        };

        src.advance(consumed);
        outcome
    }

    /// Decode every complete frame currently in `src`
    pub fn decode_multiple(&mut self, src: &mut BytesMut) -> Result<Vec<String>> {
        let mut frames = Vec::new();

        while let Some(frame) = self.decode(src)? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Whether a frame has been started but not finished
    pub fn is_mid_frame(&self) -> bool {
        self.state == DecodeState::Collecting
    }

    /// Drop any partial frame and go back to hunting for a start marker
    pub fn reset(&mut self) {
        self.state = DecodeState::Hunting;
        self.payload.clear();
    }

    fn finish(&mut self) -> Result<String> {
        let frame = self.payload.split();

        if let Some(&byte) = frame.iter().find(|b| !b.is_ascii()) {
            return Err(ProtocolError::InvalidEncoding { byte });
        }

        // ASCII is valid UTF-8, nothing gets replaced here
        Ok(String::from_utf8_lossy(&frame).into_owned())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(Markers::default(), DEFAULT_MAX_FRAME_LEN)
    }
}
