#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use qcc_dfu::device::DeviceAddress;
use qcc_dfu::transport::mock::{MockConnector, MockDevice};
use qcc_dfu::update::{SessionHandle, UpgradeResult, UpgradeSession, UpgradeState};
use qcc_dfu::{CoreEvent, DfuCore, DfuSettings, Subscription};
use tempfile::TempDir;

pub const ADDRESS: &str = "00:02:5B:00:A5:A5";

/// Short timeouts so failure paths finish quickly.
pub fn fast_settings() -> DfuSettings {
    DfuSettings {
        chunk_size: 64,
        chunk_retry_limit: 3,
        operation_timeout_ms: 100,
        reconnect_timeout_ms: 500,
        reconnect_interval_ms: 10,
        reboot_timeout_ms: 500,
        validation_poll_limit: 5,
        config_retry_limit: 2,
        event_capacity: 4096,
    }
}

/// Upgrade file of exactly `chunks` chunks of `chunk_size` bytes.
pub fn write_image(dir: &TempDir, chunks: usize, chunk_size: usize) -> PathBuf {
    let mut bytes = b"APPUHDR5".to_vec();
    let total = chunks * chunk_size;
    bytes.extend((bytes.len()..total).map(|i| (i * 7 % 251) as u8));
    let path = dir.path().join("earbuds.upd");
    std::fs::write(&path, bytes).unwrap();
    path
}

pub async fn connected_core(device: MockDevice, settings: DfuSettings) -> (DfuCore, DeviceAddress) {
    let connector = MockConnector::new().with_device(ADDRESS, "QCC Earbuds", device);
    let core = DfuCore::new(Arc::new(connector), settings).unwrap();
    let address = DeviceAddress::new(ADDRESS);
    core.update_device_list().await.unwrap();
    core.connect(&address).await.unwrap();
    (core, address)
}

pub async fn wait_done(core: &DfuCore, handle: &SessionHandle) -> UpgradeSession {
    tokio::time::timeout(Duration::from_secs(20), core.upgrades().wait_for_completion(handle))
        .await
        .expect("session did not finish in time")
        .unwrap()
}

pub async fn wait_until<F>(core: &DfuCore, handle: &SessionHandle, condition: F) -> UpgradeSession
where
    F: Fn(&UpgradeSession) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let session = core.upgrades().session(handle).await.unwrap();
            if condition(&session) {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session never reached the expected condition")
}

pub fn drain(sub: &mut Subscription) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Some(event) = sub.try_recv() {
        events.push(event);
    }
    events
}

pub fn progress_values(events: &[CoreEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            CoreEvent::UpgradeProgress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect()
}

pub fn states(events: &[CoreEvent]) -> Vec<UpgradeState> {
    events
        .iter()
        .filter_map(|e| match e {
            CoreEvent::UpgradeStateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

pub fn results(events: &[CoreEvent]) -> Vec<UpgradeResult> {
    events
        .iter()
        .filter_map(|e| match e {
            CoreEvent::UpgradeResult { result, .. } => Some(*result),
            _ => None,
        })
        .collect()
}

pub fn assert_monotonic(progress: &[u8]) {
    for pair in progress.windows(2) {
        assert!(pair[0] <= pair[1], "progress went backwards: {:?}", progress);
    }
}
