mod common;

use common::*;
use qcc_dfu::config::{ButtonAction, ButtonBinding, ConfigError, EarSide, Gesture};
use qcc_dfu::transport::mock::{MockBehavior, MockDevice};
use qcc_dfu::transport::CommandId;
use qcc_dfu::update::{UpgradeResult, UpgradeState};
use qcc_dfu::{CommandError, CoreEvent, DfuSettings};
use tempfile::TempDir;

#[tokio::test]
async fn test_button_write_refused_during_upload_then_accepted() {
    // two silent replies keep the session in UPLOAD for a while
    let device = MockDevice::with_behavior(MockBehavior {
        silent_at_chunk: Some((1, 2)),
        ..MockBehavior::default()
    });
    let settings = DfuSettings {
        operation_timeout_ms: 300,
        ..fast_settings()
    };
    let (core, _address) = connected_core(device.clone(), settings).await;

    let mut conf = core.get_current_button_actions().await.unwrap();
    conf.actions.insert(
        ButtonAction::VolumeUp,
        ButtonBinding { ear_side: EarSide::Right, gesture: Gesture::LongPressLong },
    );

    let dir = TempDir::new().unwrap();
    let path = write_image(&dir, 6, 64);
    let handle = core.start_upgrade(&path).await.unwrap();
    wait_until(&core, &handle, |s| s.state == UpgradeState::Upload).await;

    assert!(matches!(
        core.config_button_actions(&conf).await,
        Err(CommandError::Config(ConfigError::DeviceBusy))
    ));
    assert!(matches!(
        core.select_equalizer_preset(1).await,
        Err(CommandError::Config(ConfigError::DeviceBusy))
    ));
    assert_ne!(device.state().current_buttons, conf);

    let session = wait_done(&core, &handle).await;
    assert_eq!(session.result, Some(UpgradeResult::Complete));

    assert!(core.config_button_actions(&conf).await.unwrap());
    assert_eq!(device.state().current_buttons, conf);
    assert!(core.select_equalizer_preset(1).await.unwrap());
}

#[tokio::test]
async fn test_reads_allowed_during_upgrade() {
    let device = MockDevice::with_behavior(MockBehavior {
        validation: qcc_dfu::transport::mock::ValidationScript::Confirm(
            qcc_dfu::update::ConfirmationKind::Commit,
        ),
        ..MockBehavior::default()
    });
    let (core, _address) = connected_core(device, fast_settings()).await;
    let dir = TempDir::new().unwrap();
    let path = write_image(&dir, 2, 64);

    let handle = core.start_upgrade(&path).await.unwrap();
    wait_until(&core, &handle, |s| s.pending_confirmation.is_some()).await;

    assert_eq!(core.get_application_version().await.unwrap().raw, "3.1.0");
    let state = core.refresh_equalizer_info().await.unwrap();
    assert_eq!(state.available_presets.len(), 3);

    core.cancel_upgrade().await.unwrap();
    wait_done(&core, &handle).await;
}

#[tokio::test]
async fn test_equalizer_events() {
    let (core, address) = connected_core(MockDevice::new(), fast_settings()).await;
    let mut sub = core.subscribe();

    let state = core.refresh_equalizer_info().await.unwrap();
    assert!(state.ready);
    assert!(core.select_equalizer_preset(1).await.unwrap());
    assert!(matches!(
        core.select_equalizer_preset(9).await,
        Err(CommandError::Config(ConfigError::InvalidPreset(9)))
    ));

    let events = drain(&mut sub);
    assert!(matches!(&events[0], CoreEvent::EqualizerState { device, .. } if *device == address));
    match &events[1] {
        CoreEvent::EqualizerPresets { presets, .. } => {
            let names: Vec<_> = presets.iter().map(|p| p.name.as_str()).collect();
            assert_eq!(names, vec!["Flat", "Bass Boost", "Vocal"]);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(
        events[2],
        CoreEvent::EqualizerPresetSelected {
            device: address,
            value: Some(1),
            success: true,
        }
    );
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn test_rejected_button_write_reports_failure() {
    let device = MockDevice::with_behavior(MockBehavior {
        reject_button_write: true,
        ..MockBehavior::default()
    });
    let (core, _address) = connected_core(device, fast_settings()).await;
    let conf = core.get_current_button_actions().await.unwrap();

    let mut sub = core.subscribe();
    assert!(!core.config_button_actions(&conf).await.unwrap());
    let events = drain(&mut sub);
    assert!(matches!(events.as_slice(), [CoreEvent::ButtonActionUpdated { success: false, .. }]));
}

#[tokio::test]
async fn test_upgrade_started_during_preset_refresh_blocks_the_write() {
    // the first equalizer read goes unanswered, keeping the selection in its refresh
    let device = MockDevice::with_behavior(MockBehavior {
        config_silent_requests: 1,
        validation: qcc_dfu::transport::mock::ValidationScript::Confirm(
            qcc_dfu::update::ConfirmationKind::Commit,
        ),
        ..MockBehavior::default()
    });
    let (core, _address) = connected_core(device.clone(), fast_settings()).await;
    let dir = TempDir::new().unwrap();
    let path = write_image(&dir, 2, 64);

    let selecting = {
        let core = core.clone();
        tokio::spawn(async move { core.select_equalizer_preset(1).await })
    };
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !device.state().requests.contains(&CommandId::GetEqualizerInfo) {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    let handle = core.start_upgrade(&path).await.unwrap();
    assert!(matches!(
        selecting.await.unwrap(),
        Err(CommandError::Config(ConfigError::DeviceBusy))
    ));
    assert!(!device.state().requests.contains(&CommandId::SelectEqualizerPreset));
    assert_eq!(device.state().equalizer.selected_preset_value, Some(0));

    core.cancel_upgrade().await.unwrap();
    wait_done(&core, &handle).await;
}
