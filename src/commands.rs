use std::path::Path;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use tokio::sync::RwLock;

use crate::config::{
    ConfigError, ConfigExchange, CurrentButtonConf, DefaultButtonConf, EqualizerState,
};
use crate::device::{ApplicationVersion, Device, DeviceAddress, DeviceError, DeviceManager};
use crate::events::{EventBus, Subscription};
use crate::settings::DfuSettings;
use crate::transport::{Connector, SerialConnector};
use crate::update::{SessionHandle, UpgradeError, UpgradeOption, UpgradeService, UpgradeSession};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("No device connected")]
    NoDeviceSelected,

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Upgrade(#[from] UpgradeError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// The presentation layer only ever shows the message.
impl Serialize for CommandError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

pub type CommandResult<T> = Result<T, CommandError>;

/// Command surface for the presentation layer.
///
/// Commands act on the selected device, which is the one most recently
/// connected. Results of long-running work arrive as events on
/// [`DfuCore::subscribe`].
#[derive(Clone)]
pub struct DfuCore {
    settings: DfuSettings,
    events: EventBus,
    devices: DeviceManager,
    upgrades: UpgradeService,
    config: ConfigExchange,
    selected: Arc<RwLock<Option<DeviceAddress>>>,
}

impl DfuCore {
    /// Build a core over `connector`. Settings are validated first.
    pub fn new(connector: Arc<dyn Connector>, settings: DfuSettings) -> CommandResult<Self> {
        settings
            .validate()
            .map_err(|e| CommandError::InvalidSettings(e.to_string()))?;

        let events = EventBus::new(settings.event_capacity);
        let devices = DeviceManager::new(connector, events.clone(), settings.operation_timeout());
        let upgrades = UpgradeService::new(devices.clone(), events.clone(), settings.clone());
        let config = ConfigExchange::new(
            devices.clone(),
            upgrades.clone(),
            events.clone(),
            settings.config_retry_limit,
        );

        Ok(Self {
            settings,
            events,
            devices,
            upgrades,
            config,
            selected: Arc::new(RwLock::new(None)),
        })
    }

    /// Core talking to devices over serial ports.
    pub fn with_serial(settings: DfuSettings) -> CommandResult<Self> {
        Self::new(Arc::new(SerialConnector::new()), settings)
    }

    pub fn settings(&self) -> &DfuSettings {
        &self.settings
    }

    pub fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    pub fn upgrades(&self) -> &UpgradeService {
        &self.upgrades
    }

    pub fn config(&self) -> &ConfigExchange {
        &self.config
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Scan for devices
    pub async fn update_device_list(&self) -> CommandResult<Vec<Device>> {
        Ok(self.devices.discover_devices().await?)
    }

    /// Connect to a device and make it the target of later commands
    pub async fn connect(&self, device: &DeviceAddress) -> CommandResult<Device> {
        let connected = self.devices.connect_device(device).await?;
        *self.selected.write().await = Some(device.clone());
        Ok(connected)
    }

    /// Disconnect the selected device
    pub async fn disconnect(&self) -> CommandResult<()> {
        let device = self.selected_device().await?;
        if let Some(handle) = self.upgrades.current_session(&device).await {
            self.upgrades.cancel_upgrade(&handle).await?;
        }
        self.devices.disconnect_device(&device).await?;
        *self.selected.write().await = None;
        Ok(())
    }

    /// Switch to another already connected device
    pub async fn select_device(&self, device: &DeviceAddress) -> CommandResult<()> {
        if !self.devices.connected_devices().await.contains(device) {
            return Err(DeviceError::NotConnected.into());
        }
        *self.selected.write().await = Some(device.clone());
        Ok(())
    }

    pub async fn selected_device(&self) -> CommandResult<DeviceAddress> {
        self.selected.read().await.clone().ok_or(CommandError::NoDeviceSelected)
    }

    /// Upgrade the selected device with the image at `path`
    pub async fn start_upgrade(&self, path: impl AsRef<Path>) -> CommandResult<SessionHandle> {
        let device = self.selected_device().await?;
        Ok(self.upgrades.start_upgrade(&device, path).await?)
    }

    pub async fn cancel_upgrade(&self) -> CommandResult<()> {
        let handle = self.current_handle().await?;
        Ok(self.upgrades.cancel_upgrade(&handle).await?)
    }

    pub async fn resolve_confirmation(&self, option: UpgradeOption) -> CommandResult<()> {
        let handle = self.current_handle().await?;
        Ok(self.upgrades.resolve_confirmation(&handle, option).await?)
    }

    /// Snapshot of the selected device's latest session
    pub async fn upgrade_session(&self) -> CommandResult<UpgradeSession> {
        let handle = self.current_handle().await?;
        Ok(self.upgrades.session(&handle).await?)
    }

    pub async fn get_application_version(&self) -> CommandResult<ApplicationVersion> {
        let device = self.selected_device().await?;
        Ok(self.config.get_application_version(&device).await?)
    }

    pub async fn get_current_button_actions(&self) -> CommandResult<CurrentButtonConf> {
        let device = self.selected_device().await?;
        Ok(self.config.get_current_button_actions(&device).await?)
    }

    pub async fn get_default_button_actions(&self) -> CommandResult<DefaultButtonConf> {
        let device = self.selected_device().await?;
        Ok(self.config.get_default_button_actions(&device).await?)
    }

    pub async fn config_button_actions(&self, conf: &CurrentButtonConf) -> CommandResult<bool> {
        let device = self.selected_device().await?;
        Ok(self.config.set_button_actions(&device, conf).await?)
    }

    pub async fn refresh_equalizer_info(&self) -> CommandResult<EqualizerState> {
        let device = self.selected_device().await?;
        Ok(self.config.refresh_equalizer_info(&device).await?)
    }

    pub async fn select_equalizer_preset(&self, index: usize) -> CommandResult<bool> {
        let device = self.selected_device().await?;
        Ok(self.config.select_equalizer_preset(&device, index).await?)
    }

    async fn current_handle(&self) -> CommandResult<SessionHandle> {
        let device = self.selected_device().await?;
        self.upgrades
            .current_session(&device)
            .await
            .ok_or(CommandError::Upgrade(UpgradeError::SessionNotFound))
    }
}
