//! Controller configuration

use crate::{ControllerError, Result};
use array_link::{ArrayAddress, DEFAULT_BAUD_RATE};
use array_proto::{FrameCodec, Markers, DEFAULT_MAX_FRAME_LEN, END_MARKER, READINESS_PHRASE, START_MARKER};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Serial port of each array, in array order
    #[serde(default = "default_ports")]
    pub ports: Vec<ArrayAddress>,

    /// Serial baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Byte opening a frame
    #[serde(default = "default_start_marker")]
    pub start_marker: u8,

    /// Byte closing a frame
    #[serde(default = "default_end_marker")]
    pub end_marker: u8,

    /// Text a board sends once it is ready for commands
    #[serde(default = "default_readiness_phrase")]
    pub readiness_phrase: String,

    /// How long to wait for every board to report ready (milliseconds)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// How long to wait for a reply to a command (milliseconds)
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,

    /// Largest accepted frame payload (bytes)
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

fn default_ports() -> Vec<ArrayAddress> {
    vec![ArrayAddress::new("/dev/ttyUSB0")]
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_start_marker() -> u8 {
    START_MARKER
}

fn default_end_marker() -> u8 {
    END_MARKER
}

fn default_readiness_phrase() -> String {
    READINESS_PHRASE.to_string()
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_reply_timeout() -> u64 {
    100_000
}

fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ports: default_ports(),
            baud_rate: default_baud_rate(),
            start_marker: default_start_marker(),
            end_marker: default_end_marker(),
            readiness_phrase: default_readiness_phrase(),
            handshake_timeout_ms: default_handshake_timeout(),
            reply_timeout_ms: default_reply_timeout(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl ControllerConfig {
    /// Configuration for the given ports, everything else default
    pub fn for_ports<I, A>(ports: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<ArrayAddress>,
    {
        Self {
            ports: ports.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ControllerConfig = toml::from_str(&contents)
            .map_err(|e| ControllerError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| ControllerError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Reject configurations no session could run with
    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            return Err(ControllerError::Config("No array ports configured".to_string()));
        }

        if let Some(index) = self.ports.iter().position(|p| p.as_str().is_empty()) {
            return Err(ControllerError::Config(format!(
                "Port {} has an empty address",
                index
            )));
        }

        let markers = self.markers();
        markers
            .validate()
            .map_err(|e| ControllerError::Config(e.to_string()))?;

        if self.readiness_phrase.is_empty() {
            return Err(ControllerError::Config(
                "Readiness phrase cannot be empty".to_string(),
            ));
        }

        if markers.find_in(self.readiness_phrase.as_bytes()).is_some() {
            return Err(ControllerError::Config(
                "Readiness phrase cannot contain a frame marker".to_string(),
            ));
        }

        if self.baud_rate == 0 {
            return Err(ControllerError::Config("Baud rate must be positive".to_string()));
        }

        if self.handshake_timeout_ms == 0 || self.reply_timeout_ms == 0 {
            return Err(ControllerError::Config("Timeouts must be positive".to_string()));
        }

        if self.max_frame_len == 0 {
            return Err(ControllerError::Config(
                "Maximum frame length must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Frame markers
    pub fn markers(&self) -> Markers {
        Markers {
            start: self.start_marker,
            end: self.end_marker,
        }
    }

    /// Fresh frame decoder for one channel
    pub fn frame_codec(&self) -> FrameCodec {
        FrameCodec::new(self.markers(), self.max_frame_len)
    }

    /// Handshake bound
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Per-command reply bound
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}
