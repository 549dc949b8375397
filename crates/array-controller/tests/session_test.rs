//! Integration tests driving whole sessions over mock boards

use array_controller::{
    ControllerConfig, ControllerError, DispatchError, ProgressEvent, ProgressReceiver, Reporter,
    SessionManager, SessionState,
};
use array_link::{ArrayAddress, ChannelState, LinkError, MockDevice, MockOpener};
use array_proto::CommandBatch;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn setup(count: usize, handshake_ms: u64, reply_ms: u64) -> (SessionManager, Vec<MockDevice>, ProgressReceiver) {
    let (opener, devices) = MockOpener::with_devices(count);
    let mut config = ControllerConfig::for_ports(devices.iter().map(|d| d.address().clone()));
    config.handshake_timeout_ms = handshake_ms;
    config.reply_timeout_ms = reply_ms;

    let (reporter, progress) = Reporter::channel();
    let manager = SessionManager::new(config, Arc::new(opener), reporter).unwrap();
    (manager, devices, progress)
}

fn batch(commands: &[&str]) -> CommandBatch {
    commands.iter().copied().collect()
}

async fn announce_all(devices: &mut [MockDevice]) {
    for device in devices.iter_mut() {
        device.announce_ready().await.unwrap();
    }
}

#[tokio::test]
async fn test_start_with_handshake_noise() {
    let (manager, mut devices, mut progress) = setup(3, 1_000, 1_000);

    devices[0].send_raw(b"\x00\x13garbage").await.unwrap();
    devices[0].send_frame("bootloader v2").await.unwrap();
    devices[0].announce_ready().await.unwrap();
    devices[1].send_frame("Arduino is ready").await.unwrap();
    devices[2].send_raw(b"<partial").await.unwrap();
    devices[2].send_frame("Arduino is ready, firmware 1.0").await.unwrap();

    let session = manager.start().await.unwrap();

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.channel_count(), 3);
    assert!(session
        .channel_states()
        .iter()
        .all(|(_, state)| *state == ChannelState::Ready));

    let events = progress.drain();
    let opened = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::PortOpened { .. }))
        .count();
    let ready = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::ArrayReady { .. }))
        .count();
    assert_eq!(opened, 3);
    assert_eq!(ready, 3);
}

#[tokio::test]
async fn test_handshake_timeout_tears_down_everything() {
    let (manager, mut devices, _progress) = setup(3, 150, 1_000);

    devices[0].announce_ready().await.unwrap();
    devices[2].announce_ready().await.unwrap();

    let mut session = manager.session();
    let result = session.start().await;

    match result {
        Err(ControllerError::HandshakeTimeout { indices }) => assert_eq!(indices, vec![1]),
        other => panic!("Expected HandshakeTimeout, got {:?}", other.err()),
    }
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session
        .channel_states()
        .iter()
        .all(|(_, state)| *state == ChannelState::Closed));
}

#[tokio::test]
async fn test_port_unavailable_leaves_nothing_open() {
    let (opener, devices) = MockOpener::with_devices(1);
    let mut ports: Vec<ArrayAddress> = devices.iter().map(|d| d.address().clone()).collect();
    ports.push(ArrayAddress::new("/dev/missing"));
    ports.push(ArrayAddress::new("/dev/never-tried"));

    let manager = SessionManager::new(
        ControllerConfig::for_ports(ports),
        Arc::new(opener),
        Reporter::disabled(),
    )
    .unwrap();

    let mut session = manager.session();
    let error = session.start().await.unwrap_err();

    assert!(matches!(
        error,
        ControllerError::PortUnavailable { index: 1, .. }
    ));
    assert!(error.is_retryable());
    assert_eq!(session.channel_count(), 3);
    assert!(session
        .channel_states()
        .iter()
        .all(|(_, state)| *state == ChannelState::Closed));
}

#[tokio::test]
async fn test_two_arrays_reply_in_slot_order() {
    let (manager, mut devices, mut progress) = setup(2, 1_000, 1_000);
    announce_all(&mut devices).await;

    let mut session = manager.start().await.unwrap();
    progress.drain();

    let mut second = devices.pop().unwrap();
    let mut first = devices.pop().unwrap();
    let boards = tokio::spawn(async move {
        // second board answers first
        let b = second.reply_with(|c| format!("done:{}", c)).await.unwrap();
        let a = first.reply_with(|c| format!("done:{}", c)).await.unwrap();
        (a, b)
    });

    let report = session.dispatch(&batch(&["<3>", "<5>"])).await.unwrap();
    let (a, b) = boards.await.unwrap();

    assert_eq!((a.as_str(), b.as_str()), ("3", "5"));
    assert!(report.all_replied());
    assert_eq!(report.reply(0), Some("done:3"));
    assert_eq!(report.reply(1), Some("done:5"));
    assert_eq!(session.state(), SessionState::Ready);

    let sent = progress
        .drain()
        .into_iter()
        .filter(|e| matches!(e, ProgressEvent::CommandSent { .. }))
        .count();
    assert_eq!(sent, 2);
}

#[tokio::test]
async fn test_dispatch_waits_for_delayed_array() {
    let (manager, mut devices, _progress) = setup(3, 1_000, 2_000);
    announce_all(&mut devices).await;
    let mut session = manager.start().await.unwrap();

    let boards: Vec<_> = devices
        .into_iter()
        .enumerate()
        .map(|(index, mut device)| {
            tokio::spawn(async move {
                let command = device.read_command().await.unwrap();
                if index == 1 {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                device.send_frame(&format!("done:{}", command)).await.unwrap();
                device
            })
        })
        .collect();

    let start = Instant::now();
    let report = session.dispatch(&batch(&["<1>", "<2>", "<3>"])).await.unwrap();

    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(report.all_replied());
    assert_eq!(report.reply(1), Some("done:2"));

    for board in boards {
        board.await.unwrap();
    }
}

#[tokio::test]
async fn test_reply_timeout_is_local() {
    let (manager, mut devices, _progress) = setup(2, 1_000, 150);
    announce_all(&mut devices).await;
    let mut session = manager.start().await.unwrap();

    let mut silent = devices.pop().unwrap();
    let mut first = devices.pop().unwrap();
    let boards = tokio::spawn(async move {
        first.reply_with(|c| format!("done:{}", c)).await.unwrap();
        silent.read_command().await.unwrap();
        (first, silent)
    });

    let report = session.dispatch(&batch(&["<7>", "<8>"])).await.unwrap();
    let (mut first, mut silent) = boards.await.unwrap();

    assert_eq!(report.reply(0), Some("done:7"));
    assert!(matches!(
        report.replies[1].result,
        Err(DispatchError::ReplyTimeout(_))
    ));
    assert_eq!(session.state(), SessionState::Ready);

    // late reply from the previous batch is dropped before the next command
    silent.send_frame("done:8").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let boards = tokio::spawn(async move {
        first.reply_with(|c| format!("done:{}", c)).await.unwrap();
        silent.reply_with(|c| format!("done:{}", c)).await.unwrap();
        (first, silent)
    });

    let report = session.dispatch(&batch(&["<1>", "<2>"])).await.unwrap();
    let _boards = boards.await.unwrap();

    assert_eq!(report.reply(0), Some("done:1"));
    assert_eq!(report.reply(1), Some("done:2"));
}

#[tokio::test]
async fn test_reply_reported_before_silent_sibling_times_out() {
    let (manager, mut devices, mut progress) = setup(2, 1_000, 1_000);
    announce_all(&mut devices).await;
    let mut session = manager.start().await.unwrap();
    progress.drain();

    let mut silent = devices.pop().unwrap();
    let mut first = devices.pop().unwrap();
    let boards = tokio::spawn(async move {
        first.reply_with(|c| format!("done:{}", c)).await.unwrap();
        silent.read_command().await.unwrap();
        (first, silent)
    });

    let start = Instant::now();
    let watcher = tokio::spawn(async move {
        while let Some(event) = progress.recv().await {
            if let ProgressEvent::ReplyReceived { index, reply } = event {
                return Some((index, reply, start.elapsed()));
            }
        }
        None
    });

    let report = session.dispatch(&batch(&["<3>", "<5>"])).await.unwrap();
    let dispatched_after = start.elapsed();
    let (index, reply, seen_after) = watcher.await.unwrap().unwrap();
    let _boards = boards.await.unwrap();

    assert_eq!((index, reply.as_str()), (0, "done:3"));
    assert!(seen_after < Duration::from_millis(500));
    assert!(dispatched_after >= Duration::from_millis(1_000));
    assert!(matches!(
        report.replies[1].result,
        Err(DispatchError::ReplyTimeout(_))
    ));
}

#[tokio::test]
async fn test_disconnect_during_dispatch_fails_only_that_array() {
    let (manager, mut devices, _progress) = setup(2, 1_000, 1_000);
    announce_all(&mut devices).await;
    let mut session = manager.start().await.unwrap();

    let unplugged = devices.pop().unwrap();
    let mut first = devices.pop().unwrap();
    drop(unplugged);
    let board = tokio::spawn(async move {
        first.reply_with(|c| format!("done:{}", c)).await.unwrap();
        first
    });

    let report = session.dispatch(&batch(&["<4>", "<4>"])).await.unwrap();
    let _board = board.await.unwrap();

    assert_eq!(report.reply(0), Some("done:4"));
    assert!(matches!(
        report.replies[1].result,
        Err(DispatchError::Link(_))
    ));
    assert_eq!(session.channel_states()[1].1, ChannelState::Failed);

    // a failed array blocks further batches until the session is restarted
    assert!(matches!(
        session.dispatch(&batch(&["<4>", "<4>"])).await,
        Err(ControllerError::ChannelNotReady { index: 1, .. })
    ));
}

#[tokio::test]
async fn test_close_twice() {
    let (manager, mut devices, mut progress) = setup(2, 1_000, 1_000);
    announce_all(&mut devices).await;
    let mut session = manager.start().await.unwrap();
    progress.drain();

    let first = session.close().await;
    assert!(first.is_clean());
    assert_eq!(session.state(), SessionState::Closed);

    let closed = progress
        .drain()
        .into_iter()
        .filter(|e| matches!(e, ProgressEvent::PortClosed { .. }))
        .count();
    assert_eq!(closed, 2);

    let second = session.close().await;
    assert_eq!(second.channels.len(), 2);
    assert!(second
        .channels
        .iter()
        .all(|c| matches!(c.result, Err(LinkError::AlreadyClosed))));
    assert!(matches!(
        second.into_result(),
        Err(ControllerError::CloseFailure { indices }) if indices == vec![0, 1]
    ));

    assert!(matches!(
        session.dispatch(&batch(&["<1>", "<2>"])).await,
        Err(ControllerError::InvalidState {
            state: SessionState::Closed,
            ..
        })
    ));
}

#[tokio::test]
async fn test_retry_after_failed_start() {
    let (opener, _devices) = MockOpener::with_devices(0);
    let opener = Arc::new(opener);
    let address = ArrayAddress::new("/dev/ttyACM0");

    let manager = SessionManager::new(
        ControllerConfig::for_ports([address.clone()]),
        opener.clone(),
        Reporter::disabled(),
    )
    .unwrap();

    assert!(manager.start().await.unwrap_err().is_retryable());

    // board plugged in, operator retries
    let mut device = opener.attach(address).await;
    device.announce_ready().await.unwrap();

    let session = manager.start().await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);
}
