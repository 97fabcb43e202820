use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::{ConnectionState, Device, DeviceAddress, DeviceError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::transport::{Connector, DeviceProtocol, SharedProtocol};

struct ConnectedDevice {
    protocol: SharedProtocol,
    link_watch: JoinHandle<()>,
}

/// Device registry: discovery, connection management and per-device links.
///
/// Every connected device gets its own [`SharedProtocol`], so several
/// devices can be driven concurrently while requests to one device stay
/// serialized.
#[derive(Clone)]
pub struct DeviceManager {
    connector: Arc<dyn Connector>,
    devices: Arc<RwLock<HashMap<DeviceAddress, Device>>>,
    connected: Arc<Mutex<HashMap<DeviceAddress, ConnectedDevice>>>,
    events: EventBus,
    operation_timeout: Duration,
}

impl DeviceManager {
    pub fn new(connector: Arc<dyn Connector>, events: EventBus, operation_timeout: Duration) -> Self {
        Self {
            connector,
            devices: Arc::new(RwLock::new(HashMap::new())),
            connected: Arc::new(Mutex::new(HashMap::new())),
            events,
            operation_timeout,
        }
    }

    /// Scan for devices and merge them into the registry.
    ///
    /// Known devices keep their connection state; only name and last-seen
    /// time are refreshed.
    pub async fn discover_devices(&self) -> Result<Vec<Device>> {
        let found = self.connector.discover().await?;

        let snapshot = {
            let mut devices_guard = self.devices.write().await;
            for info in &found {
                let address = DeviceAddress::new(info.address.clone());
                match devices_guard.get_mut(&address) {
                    Some(existing) => {
                        existing.name = info.name.clone();
                        existing.last_seen = chrono::Utc::now();
                    }
                    None => {
                        log::info!("Discovered device {} ({})", info.name, info.address);
                        devices_guard.insert(address, Device::from_discovered(info));
                    }
                }
            }
            let mut all: Vec<Device> = devices_guard.values().cloned().collect();
            all.sort_by(|a, b| a.address.cmp(&b.address));
            all
        };

        self.events.emit(CoreEvent::DeviceListUpdated {
            devices: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// Get all known devices
    pub async fn get_devices(&self) -> Vec<Device> {
        let devices_guard = self.devices.read().await;
        let mut all: Vec<Device> = devices_guard.values().cloned().collect();
        all.sort_by(|a, b| a.address.cmp(&b.address));
        all
    }

    pub async fn get_device(&self, address: &DeviceAddress) -> Option<Device> {
        let devices_guard = self.devices.read().await;
        devices_guard.get(address).cloned()
    }

    /// Open a link to a discovered device.
    pub async fn connect_device(&self, address: &DeviceAddress) -> Result<Device> {
        if self.get_device(address).await.is_none() {
            return Err(DeviceError::NotFound);
        }

        let mut connected_guard = self.connected.lock().await;
        if connected_guard.contains_key(address) {
            return Err(DeviceError::AlreadyConnected);
        }

        self.set_connection_state(address, ConnectionState::Connecting).await;
        log::info!("Connecting to device {}", address);

        let link = match self.connector.open(address.as_str()).await {
            Ok(link) => link,
            Err(e) => {
                log::error!("Connection to {} failed: {}", address, e);
                self.set_connection_state(address, ConnectionState::Disconnected).await;
                return Err(DeviceError::Transport(e));
            }
        };

        let link_state = link.link_state();
        let protocol = DeviceProtocol::new(link, self.operation_timeout).shared();
        let link_watch = self.spawn_link_watch(address.clone(), link_state);
        connected_guard.insert(address.clone(), ConnectedDevice { protocol, link_watch });
        drop(connected_guard);

        self.set_connection_state(address, ConnectionState::Connected).await;
        log::info!("Successfully connected to device {}", address);
        self.get_device(address).await.ok_or(DeviceError::NotFound)
    }

    pub async fn disconnect_device(&self, address: &DeviceAddress) -> Result<()> {
        let entry = {
            let mut connected_guard = self.connected.lock().await;
            connected_guard.remove(address)
        };
        let entry = entry.ok_or(DeviceError::NotConnected)?;

        entry.link_watch.abort();
        entry.protocol.lock().await.disconnect();
        self.set_connection_state(address, ConnectionState::Disconnected).await;
        log::info!("Disconnected from device {}", address);
        Ok(())
    }

    /// Request/response channel of a connected device.
    pub async fn protocol(&self, address: &DeviceAddress) -> Result<SharedProtocol> {
        let connected_guard = self.connected.lock().await;
        connected_guard
            .get(address)
            .map(|entry| Arc::clone(&entry.protocol))
            .ok_or(DeviceError::NotConnected)
    }

    pub async fn connected_devices(&self) -> Vec<DeviceAddress> {
        let connected_guard = self.connected.lock().await;
        let mut addresses: Vec<DeviceAddress> = connected_guard.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Record a connection state change and notify observers if it differs.
    pub async fn set_connection_state(&self, address: &DeviceAddress, state: ConnectionState) {
        apply_connection_state(&self.devices, &self.events, address, state).await;
    }

    fn spawn_link_watch(
        &self,
        address: DeviceAddress,
        mut link_state: tokio::sync::watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let devices = Arc::clone(&self.devices);
        let events = self.events.clone();
        tokio::spawn(async move {
            while link_state.changed().await.is_ok() {
                let up = *link_state.borrow_and_update();
                let state = if up {
                    ConnectionState::Connected
                } else {
                    log::warn!("Link to {} went down", address);
                    ConnectionState::Disconnected
                };
                apply_connection_state(&devices, &events, &address, state).await;
            }
        })
    }
}

async fn apply_connection_state(
    devices: &RwLock<HashMap<DeviceAddress, Device>>,
    events: &EventBus,
    address: &DeviceAddress,
    state: ConnectionState,
) {
    let changed = {
        let mut devices_guard = devices.write().await;
        match devices_guard.get_mut(address) {
            Some(device) if device.connection_state != state => {
                device.update_connection_state(state);
                true
            }
            _ => false,
        }
    };

    if changed {
        log::debug!("Device {} is now {:?}", address, state);
        events.emit(CoreEvent::ConnectionStateChanged {
            device: address.clone(),
            connection_state: state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockConnector, MockDevice};

    fn manager(connector: MockConnector) -> (DeviceManager, EventBus) {
        let events = EventBus::new(32);
        let manager = DeviceManager::new(Arc::new(connector), events.clone(), Duration::from_millis(200));
        (manager, events)
    }

    #[tokio::test]
    async fn test_discovery_preserves_connection_state() {
        let connector = MockConnector::new()
            .with_device("AA", "Left Bud", MockDevice::new())
            .with_device("BB", "Right Bud", MockDevice::new());
        let (manager, _events) = manager(connector);

        assert_eq!(manager.discover_devices().await.unwrap().len(), 2);
        let address = DeviceAddress::new("AA");
        manager.connect_device(&address).await.unwrap();

        let devices = manager.discover_devices().await.unwrap();
        let aa = devices.iter().find(|d| d.address == address).unwrap();
        assert_eq!(aa.connection_state, ConnectionState::Connected);
        assert_eq!(manager.connected_devices().await, vec![address]);
    }

    #[tokio::test]
    async fn test_connect_errors() {
        let (manager, _events) = manager(MockConnector::new().with_device("AA", "Bud", MockDevice::new()));
        let address = DeviceAddress::new("AA");
        assert!(matches!(manager.connect_device(&address).await, Err(DeviceError::NotFound)));

        manager.discover_devices().await.unwrap();
        manager.connect_device(&address).await.unwrap();
        assert!(matches!(
            manager.connect_device(&address).await,
            Err(DeviceError::AlreadyConnected)
        ));

        manager.disconnect_device(&address).await.unwrap();
        assert!(matches!(manager.protocol(&address).await, Err(DeviceError::NotConnected)));
        assert!(matches!(
            manager.disconnect_device(&address).await,
            Err(DeviceError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_link_loss_is_reported() {
        let device = MockDevice::new();
        let (manager, events) = manager(MockConnector::new().with_device("AA", "Bud", device.clone()));
        let address = DeviceAddress::new("AA");
        manager.discover_devices().await.unwrap();
        manager.connect_device(&address).await.unwrap();

        let mut sub = events.subscribe();
        device.drop_link();

        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            CoreEvent::ConnectionStateChanged {
                device: address.clone(),
                connection_state: ConnectionState::Disconnected,
            }
        );
        assert!(!manager.get_device(&address).await.unwrap().is_connected());
    }
}
