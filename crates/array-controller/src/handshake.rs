//! Startup handshake
//!
//! A board resets when its port is opened and prints a readiness message once
//! its firmware is up. Until that message arrives the channel carries boot
//! noise and must not receive commands.

use crate::fanout::{fan_out, WorkerFailure, WorkerReport};
use crate::progress::{ProgressEvent, Reporter};
use crate::{ControllerConfig, HandshakeError};
use array_link::{Channel, LinkError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Handshake settings
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Text that must appear somewhere in a frame
    pub readiness_phrase: String,

    /// Bound on the whole wait, per channel
    pub timeout: Duration,
}

impl From<&ControllerConfig> for HandshakeConfig {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            readiness_phrase: config.readiness_phrase.clone(),
            timeout: config.handshake_timeout(),
        }
    }
}

/// Read frames until one contains `phrase`
///
/// Frames without the phrase and frames that fail to decode are skipped.
/// Returns the matching frame.
pub async fn await_readiness(channel: &mut Channel, phrase: &str) -> Result<String, LinkError> {
    loop {
        match channel.read_frame().await {
            Ok(frame) if frame.contains(phrase) => return Ok(frame),
            Ok(frame) => {
                debug!(address = %channel.address(), frame = %frame, "Skipping frame while waiting for readiness");
            }
            Err(LinkError::Protocol(e)) => {
                warn!(address = %channel.address(), error = %e, "Skipping malformed frame while waiting for readiness");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Runs the readiness wait on every channel at once
pub struct Handshake {
    config: HandshakeConfig,
    reporter: Reporter,
}

impl Handshake {
    /// Create a new handshake runner
    pub fn new(config: HandshakeConfig, reporter: Reporter) -> Self {
        Self { config, reporter }
    }

    /// Handshake every channel concurrently and wait for all of them
    ///
    /// Successful channels end `Ready`, the others `Failed`. The returned
    /// outcomes are index-aligned with `channels`.
    pub async fn run(&self, channels: &mut Vec<Channel>) -> Vec<Result<(), HandshakeError>> {
        info!(arrays = channels.len(), timeout = ?self.config.timeout, "Waiting for arrays to report ready");

        let outcomes = fan_out(channels, |index, mut channel| {
            let phrase = self.config.readiness_phrase.clone();
            let limit = self.config.timeout;
            let reporter = self.reporter.clone();

            async move {
                let outcome =
                    match tokio::time::timeout(limit, await_readiness(&mut channel, &phrase)).await {
                        Ok(Ok(_)) => channel.mark_ready().map_err(HandshakeError::from),
                        Ok(Err(e)) => Err(HandshakeError::Link(e)),
                        Err(_) => Err(HandshakeError::Timeout(limit)),
                    };

                match &outcome {
                    Ok(()) => {
                        info!(index, address = %channel.address(), "Array ready");
                        reporter.report(ProgressEvent::ArrayReady { index });
                    }
                    Err(e) => {
                        warn!(index, address = %channel.address(), error = %e, "Array handshake failed");
                        channel.mark_failed();
                        reporter.report(ProgressEvent::HandshakeFailed {
                            index,
                            reason: e.to_string(),
                        });
                    }
                }

                WorkerReport {
                    index,
                    channel,
                    outcome,
                }
            }
        })
        .await;

        outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| match outcome {
                Ok(result) => result,
                Err(failure) => {
                    let error = match failure {
                        WorkerFailure::WrongSlot { expected, reported } => {
                            HandshakeError::Configuration { expected, reported }
                        }
                        WorkerFailure::Aborted(reason) => HandshakeError::Aborted(reason),
                    };
                    self.reporter.report(ProgressEvent::HandshakeFailed {
                        index,
                        reason: error.to_string(),
                    });
                    Err(error)
                }
            })
            .collect()
    }
}
