pub mod manager;
pub mod models;

pub use manager::DeviceManager;
pub use models::*;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found")]
    NotFound,

    #[error("Device already connected")]
    AlreadyConnected,

    #[error("Device not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
