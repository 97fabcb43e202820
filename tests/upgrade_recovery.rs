mod common;

use std::sync::Arc;

use common::*;
use qcc_dfu::device::{ConnectionState, DeviceAddress};
use qcc_dfu::transport::mock::{MockBehavior, MockConnector, MockDevice};
use qcc_dfu::update::{ErrorKind, UpgradeResult, UpgradeState};
use qcc_dfu::{CoreEvent, DfuCore, DfuSettings};
use tempfile::TempDir;

#[tokio::test]
async fn test_resume_at_dropped_chunk_of_large_image() {
    let device = MockDevice::with_behavior(MockBehavior {
        drop_link_at_chunk: Some(501),
        ..MockBehavior::default()
    });
    let settings = DfuSettings {
        chunk_size: 16,
        ..fast_settings()
    };
    let (core, _address) = connected_core(device.clone(), settings).await;
    let dir = TempDir::new().unwrap();
    let path = write_image(&dir, 1000, 16);

    let mut sub = core.subscribe();
    let handle = core.start_upgrade(&path).await.unwrap();
    let session = wait_done(&core, &handle).await;
    assert_eq!(session.state, UpgradeState::Complete);
    assert_eq!(session.result, Some(UpgradeResult::Complete));

    let received = device.state().received_chunks.clone();
    assert_eq!(received, (0..1000).collect::<Vec<u32>>());
    assert_eq!(device.state().reconnects, 2); // link drop + reboot

    let events = drain(&mut sub);
    let reconnecting = events
        .iter()
        .position(|e| matches!(e, CoreEvent::UpgradeStateChanged { state: UpgradeState::Reconnecting, .. }))
        .unwrap();
    let before = progress_values(&events[..reconnecting]);
    let after = progress_values(&events[reconnecting..]);
    assert_eq!(before.last(), Some(&50));
    assert!(after.iter().all(|p| *p >= 50));
    assert_monotonic(&progress_values(&events));

    let states = states(&events);
    let pos = states.iter().position(|s| *s == UpgradeState::Reconnecting).unwrap();
    assert_eq!(states[pos + 1], UpgradeState::Upload);
    assert_eq!(results(&events), vec![UpgradeResult::Complete]);
}

#[tokio::test]
async fn test_progress_monotonic_across_repeated_faults() {
    let device = MockDevice::with_behavior(MockBehavior {
        drop_link_at_chunk: Some(3),
        silent_at_chunk: Some((7, 2)),
        ..MockBehavior::default()
    });
    let (core, _address) = connected_core(device.clone(), fast_settings()).await;
    let dir = TempDir::new().unwrap();
    let path = write_image(&dir, 12, 64);

    let mut sub = core.subscribe();
    let handle = core.start_upgrade(&path).await.unwrap();
    let session = wait_done(&core, &handle).await;
    assert_eq!(session.result, Some(UpgradeResult::Complete));
    assert_eq!(device.state().received_chunks, (0..12).collect::<Vec<u32>>());

    let events = drain(&mut sub);
    assert_monotonic(&progress_values(&events));
    assert!(states(&events).contains(&UpgradeState::Reconnecting));
}

#[tokio::test]
async fn test_exhausted_retries_escalate_to_reconnect() {
    // more silent replies than the retry budget
    let device = MockDevice::with_behavior(MockBehavior {
        silent_at_chunk: Some((2, 3)),
        ..MockBehavior::default()
    });
    let (core, _address) = connected_core(device.clone(), fast_settings()).await;
    let dir = TempDir::new().unwrap();
    let path = write_image(&dir, 5, 64);

    let mut sub = core.subscribe();
    let handle = core.start_upgrade(&path).await.unwrap();
    let session = wait_done(&core, &handle).await;

    assert_eq!(session.result, Some(UpgradeResult::Complete));
    assert!(states(&drain(&mut sub)).contains(&UpgradeState::Reconnecting));
    assert_eq!(device.state().received_chunks, (0..5).collect::<Vec<u32>>());
}

#[tokio::test]
async fn test_reconnect_timeout_aborts() {
    let device = MockDevice::with_behavior(MockBehavior {
        drop_link_at_chunk: Some(2),
        refuse_reconnect: true,
        ..MockBehavior::default()
    });
    let settings = DfuSettings {
        reconnect_timeout_ms: 200,
        ..fast_settings()
    };
    let (core, address) = connected_core(device.clone(), settings).await;
    let dir = TempDir::new().unwrap();
    let path = write_image(&dir, 6, 64);

    let mut sub = core.subscribe();
    let handle = core.start_upgrade(&path).await.unwrap();
    let session = wait_done(&core, &handle).await;

    assert_eq!(session.state, UpgradeState::Aborted);
    assert_eq!(session.result, Some(UpgradeResult::Aborted));
    assert_eq!(session.last_error, Some(ErrorKind::ReconnectTimeout));
    // link is down, so no abort notice reaches the device
    assert_eq!(device.state().aborts, 0);

    let events = drain(&mut sub);
    assert_eq!(results(&events), vec![UpgradeResult::Aborted]);
    assert!(states(&events).ends_with(&[
        UpgradeState::Reconnecting,
        UpgradeState::Aborting,
        UpgradeState::Aborted
    ]));
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::ConnectionStateChanged { connection_state: ConnectionState::Connecting, device } if *device == address
    )));
    assert_eq!(core.upgrades().state(&address).await, UpgradeState::End);
}

#[tokio::test]
async fn test_devices_upgrade_independently() {
    let left = MockDevice::new();
    let right = MockDevice::with_behavior(MockBehavior {
        drop_link_at_chunk: Some(1),
        refuse_reconnect: true,
        ..MockBehavior::default()
    });
    let connector = MockConnector::new()
        .with_device("AA", "Left Bud", left.clone())
        .with_device("BB", "Right Bud", right.clone());
    let settings = DfuSettings {
        reconnect_timeout_ms: 200,
        ..fast_settings()
    };
    let core = DfuCore::new(Arc::new(connector), settings).unwrap();
    core.update_device_list().await.unwrap();

    let (aa, bb) = (DeviceAddress::new("AA"), DeviceAddress::new("BB"));
    core.connect(&aa).await.unwrap();
    core.connect(&bb).await.unwrap();

    let dir = TempDir::new().unwrap();
    let path = write_image(&dir, 6, 64);
    let left_handle = core.upgrades().start_upgrade(&aa, &path).await.unwrap();
    let right_handle = core.upgrades().start_upgrade(&bb, &path).await.unwrap();

    let (left_session, right_session) = tokio::join!(
        wait_done(&core, &left_handle),
        wait_done(&core, &right_handle)
    );
    assert_eq!(left_session.result, Some(UpgradeResult::Complete));
    assert_eq!(right_session.result, Some(UpgradeResult::Aborted));
    assert_eq!(left.state().received_chunks.len(), 6);
    assert_eq!(right.state().received_chunks, vec![0]);
}

#[tokio::test]
async fn test_stale_ack_does_not_count_as_delivery() {
    // chunk 2 is lost and the device answers with chunk 1's ack
    let device = MockDevice::with_behavior(MockBehavior {
        stale_ack_at_chunk: Some(2),
        ..MockBehavior::default()
    });
    let (core, _address) = connected_core(device.clone(), fast_settings()).await;
    let dir = TempDir::new().unwrap();
    let path = write_image(&dir, 6, 64);

    let mut sub = core.subscribe();
    let handle = core.start_upgrade(&path).await.unwrap();
    let session = wait_done(&core, &handle).await;

    assert_eq!(session.result, Some(UpgradeResult::Complete));
    assert_eq!(device.state().received_chunks, (0..6).collect::<Vec<u32>>());
    let events = drain(&mut sub);
    assert_monotonic(&progress_values(&events));
    assert!(!states(&events).contains(&UpgradeState::Reconnecting));
}

#[tokio::test]
async fn test_leftover_ack_is_skipped() {
    let device = MockDevice::with_behavior(MockBehavior {
        duplicate_ack_at_chunk: Some(3),
        ..MockBehavior::default()
    });
    let (core, _address) = connected_core(device.clone(), fast_settings()).await;
    let dir = TempDir::new().unwrap();
    let path = write_image(&dir, 6, 64);

    let handle = core.start_upgrade(&path).await.unwrap();
    let session = wait_done(&core, &handle).await;

    assert_eq!(session.result, Some(UpgradeResult::Complete));
    // each chunk sent exactly once
    assert_eq!(device.state().received_chunks, (0..6).collect::<Vec<u32>>());
}

#[tokio::test]
async fn test_ack_for_unsent_chunk_aborts() {
    let device = MockDevice::with_behavior(MockBehavior {
        ack_ahead_at_chunk: Some(2),
        ..MockBehavior::default()
    });
    let (core, _address) = connected_core(device.clone(), fast_settings()).await;
    let dir = TempDir::new().unwrap();
    let path = write_image(&dir, 6, 64);

    let handle = core.start_upgrade(&path).await.unwrap();
    let session = wait_done(&core, &handle).await;

    assert_eq!(session.state, UpgradeState::Aborted);
    assert_eq!(
        session.last_error,
        Some(ErrorKind::UnexpectedAck { expected: 2, acked: 3 })
    );
    assert_eq!(session.progress, 33);
    assert_eq!(device.state().received_chunks, vec![0, 1, 2]);
    assert_eq!(device.state().aborts, 1);
}

#[tokio::test]
async fn test_busy_replies_counted_per_chunk() {
    // 2 busy replies per chunk, 12 in total, above the poll limit of 5
    let device = MockDevice::with_behavior(MockBehavior {
        busy_per_chunk: Some((2, 1)),
        ..MockBehavior::default()
    });
    let (core, _address) = connected_core(device.clone(), fast_settings()).await;
    let dir = TempDir::new().unwrap();
    let path = write_image(&dir, 6, 64);

    let handle = core.start_upgrade(&path).await.unwrap();
    let session = wait_done(&core, &handle).await;

    assert_eq!(session.result, Some(UpgradeResult::Complete));
    assert_eq!(device.state().received_chunks, (0..6).collect::<Vec<u32>>());
}

#[tokio::test]
async fn test_chunk_busy_beyond_limit_aborts() {
    let device = MockDevice::with_behavior(MockBehavior {
        busy_per_chunk: Some((6, 1)),
        ..MockBehavior::default()
    });
    let (core, _address) = connected_core(device.clone(), fast_settings()).await;
    let dir = TempDir::new().unwrap();
    let path = write_image(&dir, 3, 64);

    let handle = core.start_upgrade(&path).await.unwrap();
    let session = wait_done(&core, &handle).await;

    assert_eq!(session.state, UpgradeState::Aborted);
    assert_eq!(session.last_error, Some(ErrorKind::BusyTimeout));
    assert!(device.state().received_chunks.is_empty());
}
