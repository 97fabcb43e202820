use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::image::{FirmwareImage, ImageError};
use crate::device::{DeviceAddress, DeviceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpgradeState {
    Initialisation,
    Upload,
    Validation,
    Reboot,
    Verification,
    Complete,
    Reconnecting,
    Aborting,
    Aborted,
    End,
}

impl UpgradeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UpgradeState::Complete | UpgradeState::Aborted | UpgradeState::End)
    }
}

/// Terminal outcome of a session. Emitted exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpgradeResult {
    SilentCommit,
    Complete,
    UpgradeInProgressWithDifferentId,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationKind {
    BatteryLowOnDevice,
    Commit,
    InProgress,
    TransferComplete,
    WarningFileIsDifferent,
}

impl ConfirmationKind {
    pub fn code(self) -> u8 {
        match self {
            ConfirmationKind::BatteryLowOnDevice => 0x01,
            ConfirmationKind::Commit => 0x02,
            ConfirmationKind::InProgress => 0x03,
            ConfirmationKind::TransferComplete => 0x04,
            ConfirmationKind::WarningFileIsDifferent => 0x05,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(ConfirmationKind::BatteryLowOnDevice),
            0x02 => Some(ConfirmationKind::Commit),
            0x03 => Some(ConfirmationKind::InProgress),
            0x04 => Some(ConfirmationKind::TransferComplete),
            0x05 => Some(ConfirmationKind::WarningFileIsDifferent),
            _ => None,
        }
    }

    /// Options the device accepts for this kind, in presentation order.
    pub fn allowed_options(self) -> &'static [UpgradeOption] {
        use UpgradeOption::*;
        match self {
            ConfirmationKind::BatteryLowOnDevice => &[Cancel, SilentCommit],
            ConfirmationKind::Commit => &[Confirm, Cancel],
            ConfirmationKind::InProgress => &[Confirm, Cancel],
            ConfirmationKind::TransferComplete => &[Abort, InteractiveCommit, SilentCommit],
            ConfirmationKind::WarningFileIsDifferent => &[Cancel, Confirm, Abort],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpgradeOption {
    Cancel,
    Abort,
    Confirm,
    InteractiveCommit,
    SilentCommit,
}

impl UpgradeOption {
    pub fn code(self) -> u8 {
        match self {
            UpgradeOption::Cancel => 0x00,
            UpgradeOption::Abort => 0x01,
            UpgradeOption::Confirm => 0x02,
            UpgradeOption::InteractiveCommit => 0x03,
            UpgradeOption::SilentCommit => 0x04,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(UpgradeOption::Cancel),
            0x01 => Some(UpgradeOption::Abort),
            0x02 => Some(UpgradeOption::Confirm),
            0x03 => Some(UpgradeOption::InteractiveCommit),
            0x04 => Some(UpgradeOption::SilentCommit),
            _ => None,
        }
    }

    /// Options that end the session instead of letting it proceed.
    pub fn terminates(self) -> bool {
        matches!(self, UpgradeOption::Cancel | UpgradeOption::Abort)
    }
}

/// A device-raised checkpoint awaiting a caller decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    pub kind: ConfirmationKind,
    pub allowed_options: Vec<UpgradeOption>,
}

impl Confirmation {
    pub fn new(kind: ConfirmationKind) -> Self {
        Self {
            kind,
            allowed_options: kind.allowed_options().to_vec(),
        }
    }

    pub fn allows(&self, option: UpgradeOption) -> bool {
        self.allowed_options.contains(&option)
    }
}

/// Why a session left the happy path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    LinkError { detail: String },
    ProtocolRejected { code: u8 },
    ReconnectTimeout,
    ValidationTimeout,
    /// The device kept answering "busy" outside validation.
    BusyTimeout,
    /// The device acknowledged a chunk that was never sent.
    UnexpectedAck { expected: u32, acked: u32 },
    IntegrityCheckFailed { detail: String },
    Cancelled,
}

/// Identifies one session on one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: Uuid,
    pub device: DeviceAddress,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeSession {
    pub id: Uuid,
    pub device: DeviceAddress,
    pub image: FirmwareImage,
    pub state: UpgradeState,
    pub progress: u8,
    pub pending_confirmation: Option<Confirmation>,
    pub last_error: Option<ErrorKind>,
    pub result: Option<UpgradeResult>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UpgradeSession {
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            device: self.device.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("Invalid firmware image: {0}")]
    InvalidImage(#[from] ImageError),

    #[error("Device {0} already has an upgrade in progress")]
    AlreadyUpgrading(DeviceAddress),

    #[error("No confirmation pending")]
    NoConfirmationPending,

    #[error("Option {0:?} is not allowed for the pending confirmation")]
    InvalidOption(UpgradeOption),

    #[error("Upgrade session not found")]
    SessionNotFound,

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

pub type Result<T> = std::result::Result<T, UpgradeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(UpgradeState::Complete.is_terminal());
        assert!(UpgradeState::Aborted.is_terminal());
        assert!(UpgradeState::End.is_terminal());
        assert!(!UpgradeState::Aborting.is_terminal());
        assert!(!UpgradeState::Reconnecting.is_terminal());
    }

    #[test]
    fn test_confirmation_option_sets() {
        let warning = Confirmation::new(ConfirmationKind::WarningFileIsDifferent);
        assert_eq!(
            warning.allowed_options,
            vec![UpgradeOption::Cancel, UpgradeOption::Confirm, UpgradeOption::Abort]
        );
        assert!(!warning.allows(UpgradeOption::SilentCommit));

        let battery = Confirmation::new(ConfirmationKind::BatteryLowOnDevice);
        assert!(battery.allows(UpgradeOption::SilentCommit));
        assert!(!battery.allows(UpgradeOption::Confirm));
    }

    #[test]
    fn test_codes_are_stable() {
        for kind in [
            ConfirmationKind::BatteryLowOnDevice,
            ConfirmationKind::Commit,
            ConfirmationKind::InProgress,
            ConfirmationKind::TransferComplete,
            ConfirmationKind::WarningFileIsDifferent,
        ] {
            assert_eq!(ConfirmationKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(UpgradeOption::from_code(0x04), Some(UpgradeOption::SilentCommit));
        assert_eq!(UpgradeOption::from_code(0x09), None);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&UpgradeState::Initialisation).unwrap(),
            r#""INITIALISATION""#
        );
        assert_eq!(
            serde_json::to_string(&UpgradeResult::UpgradeInProgressWithDifferentId).unwrap(),
            r#""UPGRADE_IN_PROGRESS_WITH_DIFFERENT_ID""#
        );
        assert_eq!(
            serde_json::to_string(&ConfirmationKind::WarningFileIsDifferent).unwrap(),
            r#""WARNING_FILE_IS_DIFFERENT""#
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::UnexpectedAck { expected: 2, acked: 3 }).unwrap(),
            r#"{"kind":"UNEXPECTED_ACK","expected":2,"acked":3}"#
        );
    }
}
