//! Progress reporting
//!
//! Workers never touch the terminal. They push [`ProgressEvent`]s through a
//! [`Reporter`] into a queue, and a single consumer decides how to show them.

use array_link::ArrayAddress;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Something worth telling the operator about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Serial port opened
    PortOpened { index: usize, address: ArrayAddress },

    /// Serial port could not be opened
    PortFailed {
        index: usize,
        address: ArrayAddress,
        reason: String,
    },

    /// Board reported ready
    ArrayReady { index: usize },

    /// Board did not report ready
    HandshakeFailed { index: usize, reason: String },

    /// Command written to a board
    CommandSent { index: usize },

    /// Board replied
    ReplyReceived { index: usize, reply: String },

    /// Board produced no usable reply
    DispatchFailed { index: usize, reason: String },

    /// Serial port released
    PortClosed { index: usize, address: ArrayAddress },

    /// Serial port could not be released cleanly
    CloseFailed {
        index: usize,
        address: ArrayAddress,
        reason: String,
    },
}

impl ProgressEvent {
    /// Array the event is about
    pub fn index(&self) -> usize {
        match self {
            ProgressEvent::PortOpened { index, .. }
            | ProgressEvent::PortFailed { index, .. }
            | ProgressEvent::ArrayReady { index }
            | ProgressEvent::HandshakeFailed { index, .. }
            | ProgressEvent::CommandSent { index }
            | ProgressEvent::ReplyReceived { index, .. }
            | ProgressEvent::DispatchFailed { index, .. }
            | ProgressEvent::PortClosed { index, .. }
            | ProgressEvent::CloseFailed { index, .. } => *index,
        }
    }
}

enum Envelope {
    Event(ProgressEvent),
    Flush(oneshot::Sender<()>),
}

/// Sending side of the progress queue, cheap to clone into every worker
#[derive(Clone, Default)]
pub struct Reporter {
    tx: Option<mpsc::UnboundedSender<Envelope>>,
}

impl Reporter {
    /// Create a connected reporter/receiver pair
    pub fn channel() -> (Self, ProgressReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, ProgressReceiver { rx })
    }

    /// Reporter that drops every event
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue an event; never blocks, never fails
    pub fn report(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means nobody is watching
            let _ = tx.send(Envelope::Event(event));
        }
    }

    /// Wait until everything reported so far has been consumed
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(Envelope::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Receiving side of the progress queue
pub struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl ProgressReceiver {
    /// Wait for the next event; `None` once every reporter is gone
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.recv().await? {
                Envelope::Event(event) => return Some(event),
                Envelope::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    }

    /// Take every event already queued without waiting
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();

        while let Ok(envelope) = self.rx.try_recv() {
            match envelope {
                Envelope::Event(event) => events.push(event),
                Envelope::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        events
    }

    /// Hand every event to `render` on a dedicated task
    pub fn spawn_renderer<F>(mut self, mut render: F) -> JoinHandle<()>
    where
        F: FnMut(ProgressEvent) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(event) = self.recv().await {
                render(event);
            }
        })
    }
}
