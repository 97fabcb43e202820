pub mod frame;
pub mod mock;
pub mod protocol;
pub mod serial;

pub use frame::{CommandId, Frame, FrameDecoder};
pub use protocol::{DeviceProtocol, PayloadReader, Reply, SharedProtocol};
pub use serial::{SerialConnector, SerialLink};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// A peripheral reported by a [`Connector`] scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Link disconnected")]
    Disconnected,

    #[error("Communication timeout")]
    Timeout,

    #[error("Frame error: {0}")]
    Frame(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

impl TransportError {
    /// The link itself is gone; retrying on it is pointless until it is reopened.
    pub fn is_link_down(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected
                | TransportError::ConnectionFailed(_)
                | TransportError::PortNotFound(_)
        )
    }

    /// Worth another attempt on the same link.
    pub fn is_transient(&self) -> bool {
        !self.is_link_down()
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Bidirectional frame channel to one connected device.
///
/// Link loss is reported two ways: the next `send`/`receive` fails with
/// [`TransportError::Disconnected`], and the receiver returned by
/// [`Transport::link_state`] flips to `false`.
#[async_trait]
pub trait Transport: Send {
    /// Send one encoded frame.
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Wait for the next inbound frame.
    async fn receive(&mut self) -> Result<Frame>;

    /// Re-establish the link to the same device.
    async fn reconnect(&mut self) -> Result<()>;

    /// Close the link.
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Watch channel carrying the current link state (`true` = up).
    fn link_state(&self) -> watch::Receiver<bool>;
}

/// Discovers devices and opens links to them.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>>;

    async fn open(&self, address: &str) -> Result<Box<dyn Transport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(TransportError::Disconnected.is_link_down());
        assert!(TransportError::ConnectionFailed("gone".into()).is_link_down());
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::Frame("crc".into()).is_transient());
        assert_eq!(TransportError::Timeout.to_string(), "Communication timeout");
    }
}
