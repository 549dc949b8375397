//! Array Link - Serial transport layer for the array controller
//!
//! This crate owns the byte streams tied to each array: opening serial ports,
//! reading marker-delimited frames off them, writing commands and releasing
//! them again.

pub mod channel;
pub mod error;
pub mod mock;
pub mod port;

pub use array_proto;
pub use channel::{Channel, ChannelState};
pub use error::{LinkError, Result};
pub use mock::{MockDevice, MockOpener};
pub use port::{PortOpener, SerialLink, SerialPortOpener};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Baud rate the array boards are flashed with
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Opaque identifier of one array's port (e.g. `/dev/ttyUSB0`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArrayAddress(String);

impl ArrayAddress {
    /// Create an address from any string-like value
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Borrow the address as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArrayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArrayAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for ArrayAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}
