//! One worker per channel, all joined before returning

use array_link::Channel;
use array_proto::FrameCodec;
use std::future::Future;
use tracing::{error, warn};

/// What a worker hands back when it is done with its channel
pub(crate) struct WorkerReport<T> {
    /// Slot the worker claims to have worked on
    pub index: usize,

    /// The channel, returned to the coordinator
    pub channel: Channel,

    /// Result for that slot
    pub outcome: T,
}

/// A slot whose worker did not report normally
#[derive(Debug)]
pub(crate) enum WorkerFailure {
    /// Task panicked or was aborted; its channel is lost
    Aborted(String),

    /// Task reported a slot other than the one it was started for
    WrongSlot { expected: usize, reported: usize },
}

/// Move each channel into its own task, run `work` there, and wait for all
///
/// Channels come back in their original order and the returned outcomes are
/// index-aligned with them. Each worker only ever fills its own slot.
pub(crate) async fn fan_out<T, F, Fut>(
    channels: &mut Vec<Channel>,
    mut work: F,
) -> Vec<Result<T, WorkerFailure>>
where
    F: FnMut(usize, Channel) -> Fut,
    Fut: Future<Output = WorkerReport<T>> + Send + 'static,
    T: Send + 'static,
{
    let taken = std::mem::take(channels);
    let slots = taken.len();

    let workers: Vec<_> = taken
        .into_iter()
        .enumerate()
        .map(|(index, channel)| {
            let address = channel.address().clone();
            (address, tokio::spawn(work(index, channel)))
        })
        .collect();

    let mut outcomes = Vec::with_capacity(slots);

    for (expected, (address, handle)) in workers.into_iter().enumerate() {
        match handle.await {
            Ok(report) if report.index == expected => {
                channels.push(report.channel);
                outcomes.push(Ok(report.outcome));
            }
            Ok(report) => {
                warn!(
                    expected,
                    reported = report.index,
                    "Worker reported into the wrong slot"
                );
                let mut channel = report.channel;
                channel.mark_failed();
                channels.push(channel);
                outcomes.push(Err(WorkerFailure::WrongSlot {
                    expected,
                    reported: report.index,
                }));
            }
            Err(e) => {
                error!(index = expected, address = %address, error = %e, "Worker aborted");
                let mut channel = Channel::new(address, FrameCodec::default());
                channel.mark_failed();
                channels.push(channel);
                outcomes.push(Err(WorkerFailure::Aborted(e.to_string())));
            }
        }
    }

    outcomes
}
