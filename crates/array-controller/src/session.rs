//! Array session management
//!
//! A [`Session`] is one lifetime of a fully opened and handshaken set of
//! channels:
//!
//! ```text
//! Idle -> Opening -> Handshaking -> Ready <-> Dispatching
//!            |            |           |
//!            +------------+-----------+--> Closing -> Closed
//! ```
//!
//! Any failure while opening or handshaking tears every channel down, so a
//! session either has all of its arrays ready or none of them open.

use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::handshake::{Handshake, HandshakeConfig};
use crate::progress::{ProgressEvent, Reporter};
use crate::{ControllerConfig, ControllerError, HandshakeError, Result};
use array_link::{ArrayAddress, Channel, ChannelState, LinkError, PortOpener, SerialPortOpener};
use array_proto::CommandBatch;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing opened yet
    Idle,

    /// Ports opened, waiting for the handshake
    Opening,

    /// Waiting for boards to report ready
    Handshaking,

    /// Every array ready for commands
    Ready,

    /// A command batch is in flight
    Dispatching,

    /// Releasing ports
    Closing,

    /// Ports released; no further operations
    Closed,
}

/// Close outcome of one channel
#[derive(Debug)]
pub struct ChannelClose {
    /// Array index
    pub index: usize,

    /// Array port
    pub address: ArrayAddress,

    /// Whether the port was released cleanly
    pub result: std::result::Result<(), LinkError>,
}

/// Close outcome of every channel in a session
#[derive(Debug)]
pub struct CloseReport {
    /// One entry per channel, in array order
    pub channels: Vec<ChannelClose>,
}

impl CloseReport {
    /// Whether every channel closed cleanly
    pub fn is_clean(&self) -> bool {
        self.channels.iter().all(|c| c.result.is_ok())
    }

    /// Channels that did not close cleanly
    pub fn failures(&self) -> impl Iterator<Item = &ChannelClose> {
        self.channels.iter().filter(|c| c.result.is_err())
    }

    /// Turn collected failures into an error
    pub fn into_result(self) -> Result<()> {
        let indices: Vec<usize> = self.failures().map(|c| c.index).collect();
        if indices.is_empty() {
            Ok(())
        } else {
            Err(ControllerError::CloseFailure { indices })
        }
    }
}

/// One controller session over a fixed set of arrays
pub struct Session {
    /// Session ID
    pub id: Uuid,

    /// Controller configuration
    config: Arc<ControllerConfig>,

    /// Source of serial streams
    opener: Arc<dyn PortOpener>,

    /// Progress queue
    reporter: Reporter,

    /// One channel per configured port, in port order
    channels: Vec<Channel>,

    /// Session state
    state: SessionState,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create an idle session
    pub fn new(config: Arc<ControllerConfig>, opener: Arc<dyn PortOpener>, reporter: Reporter) -> Self {
        let id = Uuid::new_v4();

        debug!(session_id = %id, arrays = config.ports.len(), "New session created");

        Self {
            id,
            config,
            opener,
            reporter,
            channels: Vec::new(),
            state: SessionState::Idle,
        }
    }

    /// Get session ID as UUID string
    pub fn id_string(&self) -> String {
        self.id.to_string()
    }

    /// Get the current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of channels in the session
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Address and state of every channel, in array order
    pub fn channel_states(&self) -> Vec<(ArrayAddress, ChannelState)> {
        self.channels
            .iter()
            .map(|c| (c.address().clone(), c.state()))
            .collect()
    }

    /// Open and handshake every array
    pub async fn start(&mut self) -> Result<()> {
        self.open().await?;
        self.handshake().await
    }

    /// Open one channel per configured port
    ///
    /// The first port that fails to open aborts the whole batch: ports not yet
    /// attempted are marked failed and every channel is torn down.
    pub async fn open(&mut self) -> Result<()> {
        self.expect_state(SessionState::Idle, "open ports")?;
        self.state = SessionState::Opening;

        info!(session_id = %self.id, arrays = self.config.ports.len(), "Opening ports");

        self.channels = self
            .config
            .ports
            .iter()
            .map(|address| Channel::new(address.clone(), self.config.frame_codec()))
            .collect();

        let mut failure = None;

        for (index, channel) in self.channels.iter_mut().enumerate() {
            if failure.is_some() {
                channel.mark_failed();
                continue;
            }

            match channel.open(self.opener.as_ref(), self.config.baud_rate).await {
                Ok(()) => {
                    self.reporter.report(ProgressEvent::PortOpened {
                        index,
                        address: channel.address().clone(),
                    });
                }
                Err(e) => {
                    self.reporter.report(ProgressEvent::PortFailed {
                        index,
                        address: channel.address().clone(),
                        reason: e.to_string(),
                    });
                    failure = Some(ControllerError::PortUnavailable {
                        index,
                        address: channel.address().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if let Some(error) = failure {
            warn!(session_id = %self.id, error = %error, "Opening ports failed");
            self.teardown().await;
            return Err(error);
        }

        Ok(())
    }

    /// Wait for every opened array to report ready
    ///
    /// One failed array fails the session: every channel is torn down,
    /// including the ones that did report ready.
    pub async fn handshake(&mut self) -> Result<()> {
        self.expect_state(SessionState::Opening, "handshake")?;
        self.state = SessionState::Handshaking;

        let handshake = Handshake::new(HandshakeConfig::from(self.config.as_ref()), self.reporter.clone());
        let outcomes = handshake.run(&mut self.channels).await;

        let failures: Vec<(usize, HandshakeError)> = outcomes
            .into_iter()
            .enumerate()
            .filter_map(|(index, outcome)| outcome.err().map(|e| (index, e)))
            .collect();

        if failures.is_empty() {
            self.state = SessionState::Ready;
            info!(session_id = %self.id, arrays = self.channels.len(), "All arrays ready");
            return Ok(());
        }

        let error = summarize_handshake_failures(failures);
        warn!(session_id = %self.id, error = %error, "Handshake failed");
        self.teardown().await;
        Err(error)
    }

    /// Send one command to each array and wait for every reply
    pub async fn dispatch(&mut self, batch: &CommandBatch) -> Result<DispatchReport> {
        self.dispatch_until(batch, &CancellationToken::new()).await
    }

    /// Like [`Session::dispatch`], abandoning outstanding replies once
    /// `cancel` fires
    pub async fn dispatch_until(
        &mut self,
        batch: &CommandBatch,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport> {
        self.expect_state(SessionState::Ready, "dispatch")?;
        self.state = SessionState::Dispatching;

        let dispatcher = Dispatcher::new(self.config.reply_timeout(), self.reporter.clone());
        let result = dispatcher.dispatch(&mut self.channels, batch, cancel).await;

        // reply failures stay local to their array
        self.state = SessionState::Ready;

        if let Ok(report) = &result {
            debug!(
                session_id = %self.id,
                replied = report.replies.len() - report.failures().count(),
                failed = report.failures().count(),
                "Dispatch finished"
            );
        }
        result
    }

    /// Release every channel
    ///
    /// Every channel is attempted regardless of earlier failures. Closing an
    /// already closed session reports each channel as already closed.
    pub async fn close(&mut self) -> CloseReport {
        if self.state != SessionState::Closed {
            info!(session_id = %self.id, "Closing ports");
            self.state = SessionState::Closing;
        }

        let mut channels = Vec::with_capacity(self.channels.len());

        for (index, channel) in self.channels.iter_mut().enumerate() {
            let result = channel.close().await;
            let address = channel.address().clone();

            match &result {
                Ok(()) => self.reporter.report(ProgressEvent::PortClosed {
                    index,
                    address: address.clone(),
                }),
                Err(e) => {
                    warn!(session_id = %self.id, index, address = %address, error = %e, "Failed to close port");
                    self.reporter.report(ProgressEvent::CloseFailed {
                        index,
                        address: address.clone(),
                        reason: e.to_string(),
                    });
                }
            }

            channels.push(ChannelClose {
                index,
                address,
                result,
            });
        }

        self.state = SessionState::Closed;
        CloseReport { channels }
    }

    async fn teardown(&mut self) {
        let report = self.close().await;
        debug!(
            session_id = %self.id,
            failed = report.failures().count(),
            "Session torn down"
        );
    }

    fn expect_state(&self, expected: SessionState, operation: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(ControllerError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }
}

/// Pick the error the operator sees for a failed handshake
///
/// Bookkeeping errors win over timeouts, timeouts over stream failures.
fn summarize_handshake_failures(failures: Vec<(usize, HandshakeError)>) -> ControllerError {
    if let Some((index, error)) = failures
        .iter()
        .find(|(_, e)| matches!(e, HandshakeError::Configuration { .. }))
    {
        return ControllerError::HandshakeConfiguration {
            index: *index,
            reason: error.to_string(),
        };
    }

    let timed_out: Vec<usize> = failures
        .iter()
        .filter(|(_, e)| matches!(e, HandshakeError::Timeout(_)))
        .map(|(index, _)| *index)
        .collect();
    if !timed_out.is_empty() {
        return ControllerError::HandshakeTimeout { indices: timed_out };
    }

    match failures.into_iter().next() {
        Some((index, source)) => ControllerError::Handshake { index, source },
        None => ControllerError::HandshakeTimeout { indices: Vec::new() },
    }
}

/// Creates sessions from one configuration
///
/// Startup is retryable: every call to [`SessionManager::start`] builds a
/// fresh session.
pub struct SessionManager {
    /// Controller configuration
    config: Arc<ControllerConfig>,

    /// Source of serial streams
    opener: Arc<dyn PortOpener>,

    /// Progress queue
    reporter: Reporter,
}

impl SessionManager {
    /// Create a session manager
    pub fn new(config: ControllerConfig, opener: Arc<dyn PortOpener>, reporter: Reporter) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config: Arc::new(config),
            opener,
            reporter,
        })
    }

    /// Create a session manager over real serial ports
    pub fn with_serial_ports(config: ControllerConfig, reporter: Reporter) -> Result<Self> {
        Self::new(config, Arc::new(SerialPortOpener::new()), reporter)
    }

    /// Get the configuration
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Get the progress reporter
    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Create an idle session
    pub fn session(&self) -> Session {
        Session::new(
            Arc::clone(&self.config),
            Arc::clone(&self.opener),
            self.reporter.clone(),
        )
    }

    /// Open and handshake a new session
    ///
    /// On error every channel of the attempt has already been released.
    pub async fn start(&self) -> Result<Session> {
        let mut session = self.session();
        session.start().await?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use array_link::MockOpener;

    fn manager(count: usize) -> (SessionManager, Vec<array_link::MockDevice>) {
        let (opener, devices) = MockOpener::with_devices(count);
        let mut config = ControllerConfig::for_ports(devices.iter().map(|d| d.address().clone()));
        config.handshake_timeout_ms = 200;
        config.reply_timeout_ms = 200;
        let manager = SessionManager::new(config, Arc::new(opener), Reporter::disabled()).unwrap();
        (manager, devices)
    }

    #[tokio::test]
    async fn test_session_creation() {
        let (manager, _devices) = manager(2);
        let session = manager.session();

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_open_yields_one_channel_per_port() {
        let (manager, _devices) = manager(3);
        let mut session = manager.session();

        session.open().await.unwrap();

        assert_eq!(session.state(), SessionState::Opening);
        assert_eq!(session.channel_count(), 3);
        assert!(session
            .channel_states()
            .iter()
            .all(|(_, state)| *state == ChannelState::Open));
    }

    #[tokio::test]
    async fn test_dispatch_requires_ready() {
        let (manager, _devices) = manager(1);
        let mut session = manager.session();
        let batch: CommandBatch = ["<1>"].into_iter().collect();

        let result = session.dispatch(&batch).await;

        assert!(matches!(
            result,
            Err(ControllerError::InvalidState {
                state: SessionState::Idle,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_handshake_requires_open() {
        let (manager, _devices) = manager(1);
        let mut session = manager.session();

        assert!(matches!(
            session.handshake().await,
            Err(ControllerError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_summarize_prefers_configuration() {
        let error = summarize_handshake_failures(vec![
            (0, HandshakeError::Timeout(std::time::Duration::from_secs(10))),
            (
                1,
                HandshakeError::Configuration {
                    expected: 1,
                    reported: 4,
                },
            ),
        ]);

        assert!(matches!(
            error,
            ControllerError::HandshakeConfiguration { index: 1, .. }
        ));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_summarize_collects_timeouts() {
        let error = summarize_handshake_failures(vec![
            (0, HandshakeError::Link(LinkError::Disconnected)),
            (2, HandshakeError::Timeout(std::time::Duration::from_secs(10))),
        ]);

        match error {
            ControllerError::HandshakeTimeout { indices } => assert_eq!(indices, vec![2]),
            other => panic!("Expected HandshakeTimeout, got {}", other),
        }
    }
}
