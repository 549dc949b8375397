//! Per-array channel
//!
//! A [`Channel`] owns the byte stream of one array together with the frame
//! decoder state for that stream. Only one task holds a channel at a time, so
//! nothing here is locked.

use crate::{ArrayAddress, LinkError, PortOpener, Result, SerialLink};
use array_proto::FrameCodec;
use bytes::BytesMut;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on reads performed while discarding stale input
const MAX_DRAIN_READS: usize = 16;

/// Lifecycle of a channel
///
/// Progresses `Unopened -> Open -> Ready -> Closed`. `Failed` is reachable
/// from any state except `Closed`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Stream not opened yet
    Unopened,

    /// Stream open, board not confirmed ready
    Open,

    /// Board sent its readiness message
    Ready,

    /// Opening, handshaking or I/O failed
    Failed,

    /// Stream released
    Closed,
}

impl ChannelState {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        *self == ChannelState::Closed
    }
}

/// Logical link to one array
pub struct Channel {
    /// Address of the array's port
    address: ArrayAddress,

    /// Byte stream, present between open and close
    stream: Option<Box<dyn SerialLink>>,

    /// Lifecycle state
    state: ChannelState,

    /// Frame decoder, keeps partial frames across reads
    codec: FrameCodec,

    /// Bytes read but not decoded yet
    buffer: BytesMut,
}

impl Channel {
    /// Create an unopened channel
    pub fn new(address: ArrayAddress, codec: FrameCodec) -> Self {
        Self {
            address,
            stream: None,
            state: ChannelState::Unopened,
            codec,
            buffer: BytesMut::new(),
        }
    }

    /// Create an open channel over an existing stream
    pub fn from_stream(address: ArrayAddress, stream: Box<dyn SerialLink>, codec: FrameCodec) -> Self {
        Self {
            address,
            stream: Some(stream),
            state: ChannelState::Open,
            codec,
            buffer: BytesMut::new(),
        }
    }

    /// Open the underlying port
    ///
    /// On failure the channel ends up `Failed` and the error is returned.
    pub async fn open(&mut self, opener: &dyn PortOpener, baud_rate: u32) -> Result<()> {
        if self.state != ChannelState::Unopened {
            return Err(LinkError::InvalidState {
                operation: "open",
                state: self.state,
            });
        }

        match opener.open(&self.address, baud_rate).await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = ChannelState::Open;
                debug!(address = %self.address, opener = opener.name(), "Channel open");
                Ok(())
            }
            Err(e) => {
                self.state = ChannelState::Failed;
                warn!(address = %self.address, error = %e, "Channel failed to open");
                Err(e)
            }
        }
    }

    /// Get the array address
    pub fn address(&self) -> &ArrayAddress {
        &self.address
    }

    /// Get the current state
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Check if the channel may take part in a dispatch
    pub fn is_ready(&self) -> bool {
        self.state == ChannelState::Ready
    }

    /// Record that the board confirmed readiness
    pub fn mark_ready(&mut self) -> Result<()> {
        match self.state {
            ChannelState::Open | ChannelState::Ready => {
                self.state = ChannelState::Ready;
                Ok(())
            }
            state => Err(LinkError::InvalidState {
                operation: "ready",
                state,
            }),
        }
    }

    /// Record a failure; a closed channel stays closed
    pub fn mark_failed(&mut self) {
        if !self.state.is_terminal() {
            self.state = ChannelState::Failed;
        }
    }

    /// Send raw bytes to the board
    pub async fn write(&mut self, payload: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(LinkError::NotOpen)?;

        stream.write_all(payload).await?;
        stream.flush().await?;

        debug!(address = %self.address, len = payload.len(), "Wrote to channel");
        Ok(())
    }

    /// Check for buffered input without blocking
    pub async fn has_data(&mut self) -> Result<bool> {
        if !self.buffer.is_empty() {
            return Ok(true);
        }
        self.poll_fill().await
    }

    /// Read the next frame, waiting as long as it takes
    ///
    /// Cancel-safe: dropping the future keeps every byte already read, so a
    /// later call picks up where this one stopped.
    pub async fn read_frame(&mut self) -> Result<String> {
        let Self {
            address,
            stream,
            codec,
            buffer,
            ..
        } = self;
        let stream = stream.as_mut().ok_or(LinkError::NotOpen)?;

        loop {
            if let Some(frame) = codec.decode(buffer)? {
                debug!(address = %address, frame = %frame, "Frame received");
                return Ok(frame);
            }

            if stream.read_buf(buffer).await? == 0 {
                return Err(LinkError::Disconnected);
            }
        }
    }

    /// Read the next frame unless `cancel` fires first
    pub async fn read_frame_until(&mut self, cancel: &CancellationToken) -> Result<String> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LinkError::Cancelled),
            frame = self.read_frame() => frame,
        }
    }

    /// Throw away input that arrived before the next command
    ///
    /// Returns the number of bytes discarded.
    pub async fn discard_pending(&mut self) -> Result<usize> {
        let mut discarded = self.buffer.len();
        self.buffer.clear();
        self.codec.reset();

        for _ in 0..MAX_DRAIN_READS {
            if !self.poll_fill().await? {
                break;
            }
            discarded += self.buffer.len();
            self.buffer.clear();
        }

        if discarded > 0 {
            debug!(address = %self.address, discarded, "Discarded stale input");
        }
        Ok(discarded)
    }

    /// Release the stream
    ///
    /// The channel is `Closed` afterwards even when releasing failed.
    pub async fn close(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(LinkError::AlreadyClosed);
        }

        self.state = ChannelState::Closed;
        self.buffer.clear();
        self.codec.reset();

        let mut stream = self.stream.take().ok_or(LinkError::NotOpen)?;
        stream.shutdown().await?;

        info!(address = %self.address, "Channel closed");
        Ok(())
    }

    /// Try one read that must not wait; returns whether bytes arrived
    async fn poll_fill(&mut self) -> Result<bool> {
        let stream = self.stream.as_mut().ok_or(LinkError::NotOpen)?;

        match tokio::time::timeout(Duration::ZERO, stream.read_buf(&mut self.buffer)).await {
            Ok(Ok(0)) => Err(LinkError::Disconnected),
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(false),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.address)
            .field("state", &self.state)
            .field("has_stream", &self.stream.is_some())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
