use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Tunables for the upgrade engine and the configuration exchange.
///
/// Every field has a default, so a settings file only needs to carry the
/// values it wants to override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DfuSettings {
    /// Bytes per transfer chunk during UPLOAD.
    pub chunk_size: usize,
    /// Attempts per chunk (or per request) before the link is declared lost.
    pub chunk_retry_limit: u32,
    /// Upper bound for one request/response exchange.
    pub operation_timeout_ms: u64,
    /// Budget for RECONNECTING before the session is aborted.
    pub reconnect_timeout_ms: u64,
    /// Pause between two reconnect attempts.
    pub reconnect_interval_ms: u64,
    /// Budget for the device to come back after REBOOT.
    pub reboot_timeout_ms: u64,
    /// How many "validation still running" replies are tolerated.
    pub validation_poll_limit: u32,
    /// Attempts for configuration reads/writes on transient link failures.
    pub config_retry_limit: u32,
    /// Event buffer per subscriber.
    pub event_capacity: usize,
}

impl Default for DfuSettings {
    fn default() -> Self {
        Self {
            chunk_size: 240,
            chunk_retry_limit: 3,
            operation_timeout_ms: 5_000,
            reconnect_timeout_ms: 30_000,
            reconnect_interval_ms: 1_000,
            reboot_timeout_ms: 60_000,
            validation_poll_limit: 20,
            config_retry_limit: 3,
            event_capacity: 256,
        }
    }
}

impl DfuSettings {
    /// Load settings from a JSON file. Missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings = Self::from_json_str(&content)
            .with_context(|| format!("Invalid settings file {}", path.display()))?;
        log::info!("Loaded DFU settings from {}", path.display());
        Ok(settings)
    }

    /// Parse settings from a JSON document.
    pub fn from_json_str(content: &str) -> anyhow::Result<Self> {
        let settings: Self = serde_json::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        if self.chunk_size > crate::transport::frame::MAX_PAYLOAD - 8 {
            bail!(
                "chunk_size {} exceeds the maximum frame payload",
                self.chunk_size
            );
        }
        if self.chunk_retry_limit == 0 || self.config_retry_limit == 0 {
            bail!("retry limits must allow at least one attempt");
        }
        if self.operation_timeout_ms == 0 {
            bail!("operation_timeout_ms must be greater than zero");
        }
        if self.event_capacity == 0 {
            bail!("event_capacity must be greater than zero");
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn reboot_timeout(&self) -> Duration {
        Duration::from_millis(self.reboot_timeout_ms)
    }
}
