//! Event bus between the engine and whoever embeds it.
//!
//! Events form a closed enum. Observers either pull from a [`Subscription`]
//! or implement [`EventListener`] and let [`dispatch`] route each event to
//! the matching callback.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{ButtonConfiguration, EqualizerPreset, EqualizerState};
use crate::device::{ApplicationVersion, ConnectionState, Device, DeviceAddress};
use crate::update::{Confirmation, UpgradeResult, UpgradeState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum CoreEvent {
    DeviceListUpdated {
        devices: Vec<Device>,
    },
    #[serde(rename_all = "camelCase")]
    ConnectionStateChanged {
        device: DeviceAddress,
        connection_state: ConnectionState,
    },
    UpgradeResult {
        device: DeviceAddress,
        session: Uuid,
        result: UpgradeResult,
    },
    UpgradeNeedsConfirmation {
        device: DeviceAddress,
        session: Uuid,
        confirmation: Confirmation,
    },
    UpgradeProgress {
        device: DeviceAddress,
        session: Uuid,
        progress: u8,
    },
    UpgradeStateChanged {
        device: DeviceAddress,
        session: Uuid,
        state: UpgradeState,
    },
    ApplicationVersion {
        device: DeviceAddress,
        version: ApplicationVersion,
    },
    ButtonConfiguration {
        device: DeviceAddress,
        configuration: ButtonConfiguration,
    },
    ButtonActionUpdated {
        device: DeviceAddress,
        success: bool,
    },
    EqualizerState {
        device: DeviceAddress,
        state: EqualizerState,
    },
    EqualizerPresets {
        device: DeviceAddress,
        presets: Vec<EqualizerPreset>,
    },
    EqualizerPresetSelected {
        device: DeviceAddress,
        value: Option<u8>,
        success: bool,
    },
}

impl CoreEvent {
    /// Device the event concerns, if any.
    pub fn device(&self) -> Option<&DeviceAddress> {
        match self {
            CoreEvent::DeviceListUpdated { .. } => None,
            CoreEvent::ConnectionStateChanged { device, .. }
            | CoreEvent::UpgradeResult { device, .. }
            | CoreEvent::UpgradeNeedsConfirmation { device, .. }
            | CoreEvent::UpgradeProgress { device, .. }
            | CoreEvent::UpgradeStateChanged { device, .. }
            | CoreEvent::ApplicationVersion { device, .. }
            | CoreEvent::ButtonConfiguration { device, .. }
            | CoreEvent::ButtonActionUpdated { device, .. }
            | CoreEvent::EqualizerState { device, .. }
            | CoreEvent::EqualizerPresets { device, .. }
            | CoreEvent::EqualizerPresetSelected { device, .. } => Some(device),
        }
    }
}

/// Fan-out of [`CoreEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: CoreEvent) {
        log::trace!("Emitting {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Drive `listener` from a background task until the bus closes or the
    /// returned handle is aborted.
    pub fn spawn_listener<L>(&self, mut listener: L) -> JoinHandle<()>
    where
        L: EventListener + Send + 'static,
    {
        let mut subscription = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                dispatch(&mut listener, &event);
            }
        })
    }
}

/// Receiving end of the bus. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<CoreEvent>,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<CoreEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("Event subscriber lagged, {} events dropped", missed);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<CoreEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(missed)) => {
                    log::warn!("Event subscriber lagged, {} events dropped", missed);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

/// Typed callbacks, one per event. Unimplemented callbacks ignore the event.
#[allow(unused_variables)]
pub trait EventListener {
    fn on_device_list_updated(&mut self, devices: &[Device]) {}

    fn on_connection_state_changed(&mut self, device: &DeviceAddress, state: ConnectionState) {}

    fn on_upgrade_result(&mut self, device: &DeviceAddress, session: Uuid, result: UpgradeResult) {}

    fn on_upgrade_needs_confirmation(
        &mut self,
        device: &DeviceAddress,
        session: Uuid,
        confirmation: &Confirmation,
    ) {
    }

    fn on_upgrade_progress(&mut self, device: &DeviceAddress, session: Uuid, progress: u8) {}

    fn on_upgrade_state_changed(&mut self, device: &DeviceAddress, session: Uuid, state: UpgradeState) {}

    fn on_application_version(&mut self, device: &DeviceAddress, version: &ApplicationVersion) {}

    fn on_button_configuration(&mut self, device: &DeviceAddress, configuration: &ButtonConfiguration) {}

    fn on_button_action_updated(&mut self, device: &DeviceAddress, success: bool) {}

    fn on_equalizer_state(&mut self, device: &DeviceAddress, state: &EqualizerState) {}

    fn on_equalizer_presets(&mut self, device: &DeviceAddress, presets: &[EqualizerPreset]) {}

    fn on_equalizer_preset_selected(&mut self, device: &DeviceAddress, value: Option<u8>, success: bool) {}
}

/// Route one event to its callback.
pub fn dispatch<L: EventListener + ?Sized>(listener: &mut L, event: &CoreEvent) {
    match event {
        CoreEvent::DeviceListUpdated { devices } => listener.on_device_list_updated(devices),
        CoreEvent::ConnectionStateChanged { device, connection_state } => {
            listener.on_connection_state_changed(device, *connection_state)
        }
        CoreEvent::UpgradeResult { device, session, result } => {
            listener.on_upgrade_result(device, *session, *result)
        }
        CoreEvent::UpgradeNeedsConfirmation { device, session, confirmation } => {
            listener.on_upgrade_needs_confirmation(device, *session, confirmation)
        }
        CoreEvent::UpgradeProgress { device, session, progress } => {
            listener.on_upgrade_progress(device, *session, *progress)
        }
        CoreEvent::UpgradeStateChanged { device, session, state } => {
            listener.on_upgrade_state_changed(device, *session, *state)
        }
        CoreEvent::ApplicationVersion { device, version } => {
            listener.on_application_version(device, version)
        }
        CoreEvent::ButtonConfiguration { device, configuration } => {
            listener.on_button_configuration(device, configuration)
        }
        CoreEvent::ButtonActionUpdated { device, success } => {
            listener.on_button_action_updated(device, *success)
        }
        CoreEvent::EqualizerState { device, state } => listener.on_equalizer_state(device, state),
        CoreEvent::EqualizerPresets { device, presets } => {
            listener.on_equalizer_presets(device, presets)
        }
        CoreEvent::EqualizerPresetSelected { device, value, success } => {
            listener.on_equalizer_preset_selected(device, *value, *success)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        progress: Vec<u8>,
        results: Vec<UpgradeResult>,
    }

    impl EventListener for Recorder {
        fn on_upgrade_progress(&mut self, _device: &DeviceAddress, _session: Uuid, progress: u8) {
            self.progress.push(progress);
        }

        fn on_upgrade_result(&mut self, _device: &DeviceAddress, _session: Uuid, result: UpgradeResult) {
            self.results.push(result);
        }
    }

    fn progress(value: u8) -> CoreEvent {
        CoreEvent::UpgradeProgress {
            device: DeviceAddress::new("AA"),
            session: Uuid::nil(),
            progress: value,
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        second.unsubscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(progress(10));
        assert_eq!(first.recv().await, Some(progress(10)));
        assert!(first.try_recv().is_none());
    }

    #[test]
    fn test_lagging_subscriber_skips_ahead() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        for value in 0..5 {
            bus.emit(progress(value));
        }
        assert_eq!(sub.try_recv(), Some(progress(3)));
        assert_eq!(sub.try_recv(), Some(progress(4)));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_dispatch_routes_by_variant() {
        let mut recorder = Recorder::default();
        dispatch(&mut recorder, &progress(42));
        dispatch(
            &mut recorder,
            &CoreEvent::UpgradeResult {
                device: DeviceAddress::new("AA"),
                session: Uuid::nil(),
                result: UpgradeResult::Complete,
            },
        );
        dispatch(&mut recorder, &CoreEvent::DeviceListUpdated { devices: vec![] });
        assert_eq!(recorder.progress, vec![42]);
        assert_eq!(recorder.results, vec![UpgradeResult::Complete]);
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(progress(7)).unwrap();
        assert_eq!(json["event"], "upgradeProgress");
        assert_eq!(json["data"]["progress"], 7);
        assert_eq!(json["data"]["device"], "AA");
    }
}
