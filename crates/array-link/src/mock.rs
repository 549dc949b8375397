//! In-memory array boards
//!
//! [`MockOpener`] hands out one end of an in-memory pipe per address and keeps
//! the other end as a [`MockDevice`], which tests drive as if it were the
//! firmware on the board.

use crate::{ArrayAddress, LinkError, PortOpener, Result, SerialLink};
use array_proto::{encode_frame, FrameCodec, Markers, READINESS_PHRASE};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;

/// Pipe capacity per direction
const MOCK_PIPE_CAPACITY: usize = 4096;

/// Port opener backed by in-memory pipes
pub struct MockOpener {
    name: String,
    ports: Mutex<HashMap<ArrayAddress, DuplexStream>>,
}

impl MockOpener {
    /// Create an opener with no devices attached
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            ports: Mutex::new(HashMap::new()),
        }
    }

    /// Create an opener with `count` devices at `mock0`, `mock1`, ...
    pub fn with_devices(count: usize) -> (Self, Vec<MockDevice>) {
        let mut ports = HashMap::new();
        let devices = (0..count)
            .map(|i| {
                let (host, device) = MockDevice::pair(ArrayAddress::new(format!("mock{}", i)));
                ports.insert(device.address.clone(), host);
                device
            })
            .collect();

        let opener = Self {
            name: "mock".to_string(),
            ports: Mutex::new(ports),
        };
        (opener, devices)
    }

    /// Attach a device at `address`
    pub async fn attach(&self, address: impl Into<ArrayAddress>) -> MockDevice {
        let (host, device) = MockDevice::pair(address.into());
        self.ports.lock().await.insert(device.address.clone(), host);
        device
    }
}

impl Default for MockOpener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortOpener for MockOpener {
    async fn open(&self, address: &ArrayAddress, _baud_rate: u32) -> Result<Box<dyn SerialLink>> {
        let mut ports = self.ports.lock().await;
        let stream = ports
            .remove(address)
            .ok_or_else(|| LinkError::PortUnavailable {
                address: address.to_string(),
                reason: "no such device".to_string(),
            })?;
        Ok(Box::new(stream))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// The board side of a mock port
pub struct MockDevice {
    address: ArrayAddress,
    stream: DuplexStream,
    markers: Markers,
    codec: FrameCodec,
    buffer: BytesMut,
}

impl MockDevice {
    fn pair(address: ArrayAddress) -> (DuplexStream, Self) {
        let (host, device) = tokio::io::duplex(MOCK_PIPE_CAPACITY);
        let markers = Markers::default();
        let device = Self {
            address,
            stream: device,
            markers,
            codec: FrameCodec::default(),
            buffer: BytesMut::new(),
        };
        (host, device)
    }

    /// Address the controller opens to reach this device
    pub fn address(&self) -> &ArrayAddress {
        &self.address
    }

    /// Send a framed message to the controller
    pub async fn send_frame(&mut self, payload: &str) -> Result<()> {
        let frame = encode_frame(&self.markers, payload)?;
        self.send_raw(frame.as_bytes()).await
    }

    /// Send the readiness message the firmware prints after reset
    pub async fn announce_ready(&mut self) -> Result<()> {
        self.send_frame(READINESS_PHRASE).await
    }

    /// Send bytes exactly as given
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Wait for the next marker-delimited command and return its payload
    pub async fn read_command(&mut self) -> Result<String> {
        loop {
            if let Some(command) = self.codec.decode(&mut self.buffer)? {
                return Ok(command);
            }

            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(LinkError::Disconnected);
            }
        }
    }

    /// Answer the next command with `reply(command)`
    pub async fn reply_with<F>(&mut self, reply: F) -> Result<String>
    where
        F: FnOnce(&str) -> String,
    {
        let command = self.read_command().await?;
        self.send_frame(&reply(&command)).await?;
        Ok(command)
    }
}
