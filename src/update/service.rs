use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::image::{FirmwareImage, ImageLoader};
use super::models::{Result, SessionHandle, UpgradeError, UpgradeOption, UpgradeSession, UpgradeState};
use super::session::{SessionDriver, SessionShared};
use crate::device::{DeviceAddress, DeviceManager};
use crate::events::EventBus;
use crate::settings::DfuSettings;

/// Starts and tracks firmware upgrade sessions, at most one per device.
///
/// Sessions on different devices run independently. The last session of a
/// device stays queryable after it ends until a new one replaces it.
#[derive(Clone)]
pub struct UpgradeService {
    devices: DeviceManager,
    events: EventBus,
    settings: DfuSettings,
    sessions: Arc<RwLock<HashMap<DeviceAddress, Arc<SessionShared>>>>,
}

impl UpgradeService {
    pub fn new(devices: DeviceManager, events: EventBus, settings: DfuSettings) -> Self {
        Self {
            devices,
            events,
            settings,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Load the image at `path` and start upgrading `device` with it.
    ///
    /// Fails before any device traffic when the device is already upgrading
    /// or the image cannot be loaded.
    pub async fn start_upgrade(&self, device: &DeviceAddress, path: impl AsRef<Path>) -> Result<SessionHandle> {
        if self.is_busy(device).await {
            log::warn!("Refusing upgrade of {}: session already active", device);
            return Err(UpgradeError::AlreadyUpgrading(device.clone()));
        }

        let image = ImageLoader::new(self.settings.chunk_size).load(path).await?;
        self.start_upgrade_with_image(device, image).await
    }

    /// Start upgrading `device` with an already loaded image.
    pub async fn start_upgrade_with_image(
        &self,
        device: &DeviceAddress,
        image: FirmwareImage,
    ) -> Result<SessionHandle> {
        let protocol = self.devices.protocol(device).await?;

        // Configuration writes check for an active session under this same
        // lock, so none can slip in once the session exists.
        let protocol_guard = protocol.lock().await;
        let shared = {
            let mut sessions_guard = self.sessions.write().await;
            if sessions_guard.get(device).is_some_and(|s| s.is_active()) {
                log::warn!("Refusing upgrade of {}: session already active", device);
                return Err(UpgradeError::AlreadyUpgrading(device.clone()));
            }
            let shared = Arc::new(SessionShared::new(device.clone(), Arc::new(image), self.events.clone()));
            sessions_guard.insert(device.clone(), Arc::clone(&shared));
            shared
        };
        drop(protocol_guard);

        shared.announce();
        let driver = SessionDriver::new(
            Arc::clone(&shared),
            protocol,
            self.devices.clone(),
            self.settings.clone(),
        );
        tokio::spawn(driver.run());

        Ok(shared.handle())
    }

    /// Request cancellation. Cancelling a finished session is a no-op.
    pub async fn cancel_upgrade(&self, handle: &SessionHandle) -> Result<()> {
        let shared = self.lookup(handle).await?;
        shared.cancel().await;
        Ok(())
    }

    /// Answer the confirmation the session is waiting on.
    pub async fn resolve_confirmation(&self, handle: &SessionHandle, option: UpgradeOption) -> Result<()> {
        let shared = self.lookup(handle).await?;
        shared.resolve(option).await
    }

    pub async fn session(&self, handle: &SessionHandle) -> Result<UpgradeSession> {
        let shared = self.lookup(handle).await?;
        Ok(shared.snapshot().await)
    }

    /// Snapshot of the device's running session, if any.
    pub async fn active_session(&self, device: &DeviceAddress) -> Option<UpgradeSession> {
        let shared = {
            let sessions_guard = self.sessions.read().await;
            sessions_guard.get(device).filter(|s| s.is_active()).cloned()
        };
        match shared {
            Some(shared) => Some(shared.snapshot().await),
            None => None,
        }
    }

    /// Handle of the device's most recent session, finished or not.
    pub async fn current_session(&self, device: &DeviceAddress) -> Option<SessionHandle> {
        let sessions_guard = self.sessions.read().await;
        sessions_guard.get(device).map(|s| s.handle())
    }

    /// Current upgrade state of a device; `END` when nothing is running.
    pub async fn state(&self, device: &DeviceAddress) -> UpgradeState {
        let sessions_guard = self.sessions.read().await;
        sessions_guard
            .get(device)
            .map(|s| s.state())
            .filter(|state| !state.is_terminal())
            .unwrap_or(UpgradeState::End)
    }

    pub async fn is_busy(&self, device: &DeviceAddress) -> bool {
        let sessions_guard = self.sessions.read().await;
        sessions_guard.get(device).is_some_and(|s| s.is_active())
    }

    /// Wait for the session to reach a terminal state and return its final snapshot.
    pub async fn wait_for_completion(&self, handle: &SessionHandle) -> Result<UpgradeSession> {
        let shared = self.lookup(handle).await?;
        shared.wait_terminal().await;
        Ok(shared.snapshot().await)
    }

    async fn lookup(&self, handle: &SessionHandle) -> Result<Arc<SessionShared>> {
        let sessions_guard = self.sessions.read().await;
        sessions_guard
            .get(&handle.device)
            .filter(|s| s.handle().id == handle.id)
            .cloned()
            .ok_or(UpgradeError::SessionNotFound)
    }
}
