//! Command fan-out / reply fan-in

use crate::fanout::{fan_out, WorkerFailure, WorkerReport};
use crate::progress::{ProgressEvent, Reporter};
use crate::{ControllerError, DispatchError, Result};
use array_link::{ArrayAddress, Channel, LinkError};
use array_proto::CommandBatch;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reply (or failure) of one array in one dispatch
#[derive(Debug)]
pub struct ChannelReply {
    /// Array index
    pub index: usize,

    /// Array port
    pub address: ArrayAddress,

    /// Decoded reply frame
    pub result: std::result::Result<String, DispatchError>,
}

/// Every array's reply to one command batch, in array order
#[derive(Debug)]
pub struct DispatchReport {
    /// One entry per array
    pub replies: Vec<ChannelReply>,
}

impl DispatchReport {
    /// Whether every array replied
    pub fn all_replied(&self) -> bool {
        self.replies.iter().all(|r| r.result.is_ok())
    }

    /// Arrays that did not reply
    pub fn failures(&self) -> impl Iterator<Item = &ChannelReply> {
        self.replies.iter().filter(|r| r.result.is_err())
    }

    /// Reply text of the array at `index`, if it replied
    pub fn reply(&self, index: usize) -> Option<&str> {
        self.replies
            .get(index)
            .and_then(|r| r.result.as_ref().ok())
            .map(String::as_str)
    }
}

/// Sends one command per channel and collects the replies
pub struct Dispatcher {
    reply_timeout: Duration,
    reporter: Reporter,
}

impl Dispatcher {
    /// Create a new dispatcher
    pub fn new(reply_timeout: Duration, reporter: Reporter) -> Self {
        Self {
            reply_timeout,
            reporter,
        }
    }

    /// Dispatch `batch` over `channels`, command `i` to channel `i`
    ///
    /// Returns only after every worker finished. A worker that times out or
    /// fails only affects its own entry in the report.
    pub async fn dispatch(
        &self,
        channels: &mut Vec<Channel>,
        batch: &CommandBatch,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport> {
        batch.ensure_len(channels.len())?;

        if let Some((index, channel)) = channels.iter().enumerate().find(|(_, c)| !c.is_ready()) {
            return Err(ControllerError::ChannelNotReady {
                index,
                state: channel.state(),
            });
        }

        info!(arrays = channels.len(), "Dispatching command batch");

        let addresses: Vec<ArrayAddress> = channels.iter().map(|c| c.address().clone()).collect();

        let outcomes = fan_out(channels, |index, mut channel| {
            let command = batch.get(index).unwrap_or_default().to_string();
            let limit = self.reply_timeout;
            let cancel = cancel.clone();
            let reporter = self.reporter.clone();

            async move {
                let outcome = exchange(&mut channel, index, &command, limit, &cancel, &reporter).await;

                if let Err(DispatchError::Link(e)) = &outcome {
                    if !matches!(e, LinkError::Protocol(_)) {
                        channel.mark_failed();
                    }
                }

                // reported from the worker, independent of siblings
                report_outcome(&reporter, index, &outcome);

                WorkerReport {
                    index,
                    channel,
                    outcome,
                }
            }
        })
        .await;

        let replies = outcomes
            .into_iter()
            .zip(addresses)
            .enumerate()
            .map(|(index, (outcome, address))| {
                let result = match outcome {
                    Ok(result) => result,
                    Err(failure) => {
                        let failed = match failure {
                            WorkerFailure::WrongSlot { expected, reported } => {
                                Err(DispatchError::Configuration { expected, reported })
                            }
                            WorkerFailure::Aborted(reason) => Err(DispatchError::Aborted(reason)),
                        };
                        report_outcome(&self.reporter, index, &failed);
                        failed
                    }
                };

                ChannelReply {
                    index,
                    address,
                    result,
                }
            })
            .collect();

        Ok(DispatchReport { replies })
    }
}

fn report_outcome(
    reporter: &Reporter,
    index: usize,
    outcome: &std::result::Result<String, DispatchError>,
) {
    match outcome {
        Ok(reply) => reporter.report(ProgressEvent::ReplyReceived {
            index,
            reply: reply.clone(),
        }),
        Err(e) => reporter.report(ProgressEvent::DispatchFailed {
            index,
            reason: e.to_string(),
        }),
    }
}

/// Write one command and wait for its reply
async fn exchange(
    channel: &mut Channel,
    index: usize,
    command: &str,
    limit: Duration,
    cancel: &CancellationToken,
    reporter: &Reporter,
) -> std::result::Result<String, DispatchError> {
    channel.discard_pending().await?;
    channel.write(command.as_bytes()).await?;

    debug!(index, address = %channel.address(), command, "Command sent");
    reporter.report(ProgressEvent::CommandSent { index });

    match tokio::time::timeout(limit, channel.read_frame_until(cancel)).await {
        Ok(Ok(reply)) => {
            debug!(index, reply = %reply, "Reply received");
            Ok(reply)
        }
        Ok(Err(LinkError::Cancelled)) => {
            info!(index, "Dispatch cancelled");
            Err(DispatchError::Cancelled)
        }
        Ok(Err(e)) => {
            warn!(index, error = %e, "Reply failed");
            Err(e.into())
        }
        Err(_) => {
            warn!(index, timeout = ?limit, "Reply timed out");
            Err(DispatchError::ReplyTimeout(limit))
        }
    }
}
