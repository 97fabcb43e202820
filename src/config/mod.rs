pub mod buttons;
pub mod equalizer;
pub mod exchange;

pub use buttons::{
    ButtonAction, ButtonActionMap, ButtonBinding, ButtonConfiguration, CurrentButtonConf,
    DefaultButtonConf, EarSide, Gesture,
};
pub use equalizer::{EqualizerPreset, EqualizerState};
pub use exchange::ConfigExchange;

use crate::device::DeviceError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Device is busy with a firmware upgrade")]
    DeviceBusy,

    #[error("Device rejected the request (code 0x{0:02X})")]
    Rejected(u8),

    #[error("Malformed device reply: {0}")]
    Malformed(String),

    #[error("No equalizer preset at index {0}")]
    InvalidPreset(usize),

    #[error("Invalid button configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
