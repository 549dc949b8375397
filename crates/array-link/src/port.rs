//! Serial port abstraction
//!
//! The controller never talks to a device driver directly. It gets byte
//! streams from a [`PortOpener`], which lets the same session code run over
//! real serial ports or in-memory test devices.

use crate::{ArrayAddress, LinkError, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

/// A bidirectional byte stream to one array
pub trait SerialLink: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialLink for T {}

/// Opens byte streams for array addresses
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open the port at `address`
    async fn open(&self, address: &ArrayAddress, baud_rate: u32) -> Result<Box<dyn SerialLink>>;

    /// Get the opener name
    fn name(&self) -> &str;
}

/// Opens real serial ports through the OS driver
#[derive(Debug, Default, Clone)]
pub struct SerialPortOpener;

impl SerialPortOpener {
    /// Create a new serial port opener
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PortOpener for SerialPortOpener {
    async fn open(&self, address: &ArrayAddress, baud_rate: u32) -> Result<Box<dyn SerialLink>> {
        debug!(address = %address, baud_rate, "Opening serial port");

        let stream = tokio_serial::new(address.as_str(), baud_rate)
            .open_native_async()
            .map_err(|e| LinkError::PortUnavailable {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        info!(address = %address, baud_rate, "Serial port opened");
        Ok(Box::new(stream))
    }

    fn name(&self) -> &str {
        "serial"
    }
}
