use std::fmt;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::transport::DiscoveredDevice;

/// Opaque peripheral identifier (BD_ADDR, port name, ...). Device identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// Device connection state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub address: DeviceAddress,
    pub name: String,
    pub connection_state: ConnectionState,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn new(address: DeviceAddress, name: String) -> Self {
        Self {
            address,
            name,
            connection_state: ConnectionState::Disconnected,
            last_seen: Utc::now(),
        }
    }

    pub fn from_discovered(info: &DiscoveredDevice) -> Self {
        Self::new(DeviceAddress::new(info.address.clone()), info.name.clone())
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection_state, ConnectionState::Connected)
    }

    pub fn update_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
        self.last_seen = Utc::now();
    }
}

/// Firmware version string reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationVersion {
    pub raw: String,
    /// Parsed form, when the device reports a semantic version.
    pub version: Option<Version>,
}

impl ApplicationVersion {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let version = Version::parse(trimmed.strip_prefix('v').unwrap_or(trimmed)).ok();
        Self {
            raw: raw.to_string(),
            version,
        }
    }
}
