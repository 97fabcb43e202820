use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use super::{
    ButtonConfiguration, ConfigError, CurrentButtonConf, DefaultButtonConf, EqualizerState, Result,
};
use crate::device::{ApplicationVersion, DeviceAddress, DeviceManager};
use crate::events::{CoreEvent, EventBus};
use crate::transport::{CommandId, PayloadReader, Reply, TransportError};
use crate::update::UpgradeService;

/// Plain request/response reads and writes of device features.
///
/// Reads may run at any time. Writes are refused with
/// [`ConfigError::DeviceBusy`] while the device is being upgraded.
#[derive(Clone)]
pub struct ConfigExchange {
    devices: DeviceManager,
    upgrades: UpgradeService,
    events: EventBus,
    retry_limit: u32,
    buttons: Arc<RwLock<HashMap<DeviceAddress, ButtonConfiguration>>>,
    equalizers: Arc<RwLock<HashMap<DeviceAddress, EqualizerState>>>,
}

impl ConfigExchange {
    pub fn new(devices: DeviceManager, upgrades: UpgradeService, events: EventBus, retry_limit: u32) -> Self {
        Self {
            devices,
            upgrades,
            events,
            retry_limit: retry_limit.max(1),
            buttons: Arc::new(RwLock::new(HashMap::new())),
            equalizers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get_application_version(&self, device: &DeviceAddress) -> Result<ApplicationVersion> {
        let body = self.request_ok(device, CommandId::GetApplicationVersion, Vec::new()).await?;
        let raw = PayloadReader::new(&body).read_short_string().map_err(malformed)?;
        let version = ApplicationVersion::parse(&raw);
        log::info!("Device {} runs application version {}", device, version.raw);

        self.events.emit(CoreEvent::ApplicationVersion {
            device: device.clone(),
            version: version.clone(),
        });
        Ok(version)
    }

    pub async fn get_current_button_actions(&self, device: &DeviceAddress) -> Result<CurrentButtonConf> {
        let body = self.request_ok(device, CommandId::GetCurrentButtonActions, Vec::new()).await?;
        let current = CurrentButtonConf::decode(&body).map_err(malformed)?;
        log::debug!("Read {} current button bindings from {}", current.actions.len(), device);

        self.publish_buttons(device, |conf| conf.current = Some(current.clone())).await;
        Ok(current)
    }

    pub async fn get_default_button_actions(&self, device: &DeviceAddress) -> Result<DefaultButtonConf> {
        let body = self.request_ok(device, CommandId::GetDefaultButtonActions, Vec::new()).await?;
        let default = DefaultButtonConf::decode(&body).map_err(malformed)?;
        log::debug!("Read {} default button bindings from {}", default.actions.len(), device);

        self.publish_buttons(device, |conf| conf.default = Some(default.clone())).await;
        Ok(default)
    }

    /// Write a button mapping. A device refusal yields `Ok(false)`.
    pub async fn set_button_actions(&self, device: &DeviceAddress, conf: &CurrentButtonConf) -> Result<bool> {
        conf.validate()?;
        self.ensure_idle(device).await?;

        let outcome = self.write(device, CommandId::SetButtonActions, conf.encode()).await;
        let success = match outcome {
            Ok(Reply::Ok(_)) => {
                log::info!("Updated button actions on {}", device);
                let mut buttons_guard = self.buttons.write().await;
                buttons_guard.entry(device.clone()).or_default().current = Some(conf.clone());
                true
            }
            Ok(Reply::Rejected(code)) => {
                log::warn!("Device {} refused button actions (code 0x{:02X})", device, code);
                false
            }
            Ok(other) => {
                self.emit_button_update(device, false);
                return Err(unexpected(CommandId::SetButtonActions, &other));
            }
            Err(ConfigError::DeviceBusy) => return Err(ConfigError::DeviceBusy),
            Err(e) => {
                self.emit_button_update(device, false);
                return Err(e);
            }
        };

        self.emit_button_update(device, success);
        Ok(success)
    }

    pub async fn refresh_equalizer_info(&self, device: &DeviceAddress) -> Result<EqualizerState> {
        let body = self.request_ok(device, CommandId::GetEqualizerInfo, Vec::new()).await?;
        let state = EqualizerState::decode(&body).map_err(malformed)?;
        log::debug!(
            "Equalizer on {}: ready={}, {} presets, selected={:?}",
            device,
            state.ready,
            state.available_presets.len(),
            state.selected_preset_value
        );

        self.equalizers.write().await.insert(device.clone(), state.clone());
        self.events.emit(CoreEvent::EqualizerState {
            device: device.clone(),
            state: state.clone(),
        });
        self.events.emit(CoreEvent::EqualizerPresets {
            device: device.clone(),
            presets: state.available_presets.clone(),
        });
        Ok(state)
    }

    /// Select the preset at `index` of the advertised list.
    ///
    /// The list is fetched first if it was never read. A device refusal
    /// yields `Ok(false)`.
    pub async fn select_equalizer_preset(&self, device: &DeviceAddress, index: usize) -> Result<bool> {
        self.ensure_idle(device).await?;

        let cached = self.equalizers.read().await.get(device).cloned();
        let state = match cached {
            Some(state) => state,
            None => self.refresh_equalizer_info(device).await?,
        };
        let preset = state.preset_at(index).ok_or(ConfigError::InvalidPreset(index))?.clone();

        let reply = self
            .write(device, CommandId::SelectEqualizerPreset, vec![preset.value])
            .await?;
        let (selected, success) = match reply {
            Reply::Ok(body) => {
                let selected = body.first().copied().unwrap_or(preset.value);
                log::info!("Selected equalizer preset '{}' on {}", preset.name, device);
                let mut equalizers_guard = self.equalizers.write().await;
                if let Some(cached) = equalizers_guard.get_mut(device) {
                    cached.selected_preset_value = Some(selected);
                }
                (Some(selected), true)
            }
            Reply::Rejected(code) => {
                log::warn!(
                    "Device {} refused equalizer preset {} (code 0x{:02X})",
                    device,
                    preset.value,
                    code
                );
                (state.selected_preset_value, false)
            }
            other => return Err(unexpected(CommandId::SelectEqualizerPreset, &other)),
        };

        self.events.emit(CoreEvent::EqualizerPresetSelected {
            device: device.clone(),
            value: selected,
            success,
        });
        Ok(success)
    }

    /// Last button configuration read from or written to the device.
    pub async fn button_configuration(&self, device: &DeviceAddress) -> ButtonConfiguration {
        let buttons_guard = self.buttons.read().await;
        buttons_guard.get(device).cloned().unwrap_or_default()
    }

    async fn ensure_idle(&self, device: &DeviceAddress) -> Result<()> {
        if self.upgrades.is_busy(device).await {
            log::warn!("Refusing configuration write to {}: upgrade in progress", device);
            return Err(ConfigError::DeviceBusy);
        }
        Ok(())
    }

    async fn publish_buttons<F>(&self, device: &DeviceAddress, update: F)
    where
        F: FnOnce(&mut ButtonConfiguration),
    {
        let configuration = {
            let mut buttons_guard = self.buttons.write().await;
            let entry = buttons_guard.entry(device.clone()).or_default();
            update(entry);
            entry.clone()
        };
        self.events.emit(CoreEvent::ButtonConfiguration {
            device: device.clone(),
            configuration,
        });
    }

    fn emit_button_update(&self, device: &DeviceAddress, success: bool) {
        self.events.emit(CoreEvent::ButtonActionUpdated {
            device: device.clone(),
            success,
        });
    }

    /// Request that must be accepted; refusals become [`ConfigError::Rejected`].
    async fn request_ok(&self, device: &DeviceAddress, command: CommandId, payload: Vec<u8>) -> Result<Vec<u8>> {
        match self.request(device, command, payload).await? {
            Reply::Ok(body) => Ok(body),
            Reply::Rejected(code) => {
                log::warn!("Device {} rejected {:?} (code 0x{:02X})", device, command, code);
                Err(ConfigError::Rejected(code))
            }
            other => Err(unexpected(command, &other)),
        }
    }

    async fn request(&self, device: &DeviceAddress, command: CommandId, payload: Vec<u8>) -> Result<Reply> {
        self.exchange(device, command, payload, false).await
    }

    /// Like [`Self::request`], but every attempt is refused with
    /// [`ConfigError::DeviceBusy`] once an upgrade session is active.
    async fn write(&self, device: &DeviceAddress, command: CommandId, payload: Vec<u8>) -> Result<Reply> {
        self.exchange(device, command, payload, true).await
    }

    /// One exchange, retried on transient failures and "busy" replies.
    async fn exchange(
        &self,
        device: &DeviceAddress,
        command: CommandId,
        payload: Vec<u8>,
        refuse_when_busy: bool,
    ) -> Result<Reply> {
        let protocol = self.devices.protocol(device).await?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = {
                // upgrades start under this lock, see UpgradeService::start_upgrade_with_image
                let mut protocol_guard = protocol.lock().await;
                if refuse_when_busy {
                    self.ensure_idle(device).await?;
                }
                protocol_guard.exchange(command, payload.clone()).await
            };
            match outcome {
                Ok(Reply::Pending(retry_after_ms)) if attempt < self.retry_limit => {
                    log::debug!("{:?} pending on {}, retry in {} ms", command, device, retry_after_ms);
                    tokio::time::sleep(Duration::from_millis(retry_after_ms as u64)).await;
                }
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_transient() && attempt < self.retry_limit => {
                    log::warn!(
                        "{:?} to {} failed (attempt {}/{}): {}",
                        command,
                        device,
                        attempt,
                        self.retry_limit,
                        e
                    );
                }
                Err(e) => {
                    log::error!("{:?} to {} failed: {}", command, device, e);
                    return Err(malformed(e));
                }
            }
        }
    }
}

/// Framing faults are reported as malformed replies; everything else stays a transport error.
fn malformed(error: TransportError) -> ConfigError {
    match error {
        TransportError::Frame(detail) => ConfigError::Malformed(detail),
        other => ConfigError::Transport(other),
    }
}

fn unexpected(command: CommandId, reply: &Reply) -> ConfigError {
    ConfigError::Malformed(format!("unexpected {:?} reply to {:?}", reply, command))
}
