use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::transport::{PayloadReader, Result, TransportError};

// Firmware limit on mappable actions per configuration
const MAX_BINDINGS: usize = 16;

/// Named actions a headset button gesture can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ButtonAction {
    PausePlay,
    NextItem,
    PreviousItem,
    VolumeUp,
    VolumeDown,
    PickHangUp,
    ScreenCall,
    StartVoiceAssistant,
    CancelVoiceAssistant,
}

impl ButtonAction {
    pub const ALL: [ButtonAction; 9] = [
        ButtonAction::PausePlay,
        ButtonAction::NextItem,
        ButtonAction::PreviousItem,
        ButtonAction::VolumeUp,
        ButtonAction::VolumeDown,
        ButtonAction::PickHangUp,
        ButtonAction::ScreenCall,
        ButtonAction::StartVoiceAssistant,
        ButtonAction::CancelVoiceAssistant,
    ];

    pub fn code(self) -> u8 {
        match self {
            ButtonAction::PausePlay => 0x01,
            ButtonAction::NextItem => 0x02,
            ButtonAction::PreviousItem => 0x03,
            ButtonAction::VolumeUp => 0x04,
            ButtonAction::VolumeDown => 0x05,
            ButtonAction::PickHangUp => 0x06,
            ButtonAction::ScreenCall => 0x07,
            ButtonAction::StartVoiceAssistant => 0x08,
            ButtonAction::CancelVoiceAssistant => 0x09,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.code() == code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EarSide {
    Left,
    Right,
    Both,
}

impl EarSide {
    pub fn code(self) -> u8 {
        match self {
            EarSide::Left => 0,
            EarSide::Right => 1,
            EarSide::Both => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(EarSide::Left),
            1 => Some(EarSide::Right),
            2 => Some(EarSide::Both),
            _ => None,
        }
    }

    /// Whether a gesture on `self` can be confused with one on `other`.
    fn overlaps(self, other: EarSide) -> bool {
        self == other || self == EarSide::Both || other == EarSide::Both
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Gesture {
    SingleClick,
    DoubleClick,
    TripleClick,
    LongPressShort,
    LongPressLong,
}

impl Gesture {
    pub fn code(self) -> u8 {
        match self {
            Gesture::SingleClick => 0,
            Gesture::DoubleClick => 1,
            Gesture::TripleClick => 2,
            Gesture::LongPressShort => 3,
            Gesture::LongPressLong => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Gesture::SingleClick),
            1 => Some(Gesture::DoubleClick),
            2 => Some(Gesture::TripleClick),
            3 => Some(Gesture::LongPressShort),
            4 => Some(Gesture::LongPressLong),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonBinding {
    pub ear_side: EarSide,
    pub gesture: Gesture,
}

pub type ButtonActionMap = BTreeMap<ButtonAction, ButtonBinding>;

/// Factory button mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultButtonConf {
    pub actions: ButtonActionMap,
}

/// Mapping currently active on the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentButtonConf {
    pub enabled: bool,
    pub actions: ButtonActionMap,
}

/// Last known default and current mappings of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonConfiguration {
    pub default: Option<DefaultButtonConf>,
    pub current: Option<CurrentButtonConf>,
}

impl DefaultButtonConf {
    pub fn encode(&self) -> Vec<u8> {
        encode_actions(&self.actions)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(payload);
        let actions = decode_actions(&mut reader)?;
        Ok(Self { actions })
    }
}

impl CurrentButtonConf {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.enabled as u8];
        out.extend_from_slice(&encode_actions(&self.actions));
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(payload);
        let enabled = reader.read_u8()? != 0;
        let actions = decode_actions(&mut reader)?;
        Ok(Self { enabled, actions })
    }

    /// Reject mappings where one gesture would trigger two actions.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let bindings: Vec<_> = self.actions.iter().collect();
        for (i, (action, binding)) in bindings.iter().enumerate() {
            for (other_action, other) in &bindings[i + 1..] {
                if binding.gesture == other.gesture && binding.ear_side.overlaps(other.ear_side) {
                    return Err(ConfigError::InvalidConfiguration(format!(
                        "{:?} and {:?} both bound to {:?} on {:?}/{:?}",
                        action, other_action, binding.gesture, binding.ear_side, other.ear_side
                    )));
                }
            }
        }
        Ok(())
    }
}

fn encode_actions(actions: &ButtonActionMap) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + actions.len() * 3);
    out.push(actions.len() as u8);
    for (action, binding) in actions {
        out.push(action.code());
        out.push(binding.ear_side.code());
        out.push(binding.gesture.code());
    }
    out
}

fn decode_actions(reader: &mut PayloadReader<'_>) -> Result<ButtonActionMap> {
    let count = reader.read_u8()? as usize;
    if count > MAX_BINDINGS {
        return Err(TransportError::Frame(format!(
            "Too many button bindings: {} (max {})",
            count, MAX_BINDINGS
        )));
    }

    let mut actions = ButtonActionMap::new();
    for _ in 0..count {
        let (action, ear, gesture) = (reader.read_u8()?, reader.read_u8()?, reader.read_u8()?);
        let action = ButtonAction::from_code(action)
            .ok_or_else(|| TransportError::Frame(format!("Unknown button action 0x{:02X}", action)))?;
        let ear_side = EarSide::from_code(ear)
            .ok_or_else(|| TransportError::Frame(format!("Unknown ear side {}", ear)))?;
        let gesture = Gesture::from_code(gesture)
            .ok_or_else(|| TransportError::Frame(format!("Unknown gesture {}", gesture)))?;
        actions.insert(action, ButtonBinding { ear_side, gesture });
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(ear_side: EarSide, gesture: Gesture) -> ButtonBinding {
        ButtonBinding { ear_side, gesture }
    }

    #[test]
    fn test_current_conf_wire_layout() {
        let mut conf = CurrentButtonConf { enabled: true, actions: ButtonActionMap::new() };
        conf.actions.insert(ButtonAction::VolumeUp, bind(EarSide::Right, Gesture::LongPressShort));

        let bytes = conf.encode();
        assert_eq!(bytes, vec![1, 1, 0x04, 1, 3]);
        assert_eq!(CurrentButtonConf::decode(&bytes).unwrap(), conf);
    }

    #[test]
    fn test_decode_rejects_unknown_codes() {
        assert!(DefaultButtonConf::decode(&[1, 0x7F, 0, 0]).is_err());
        assert!(DefaultButtonConf::decode(&[1, 0x01, 9, 0]).is_err());
        assert!(DefaultButtonConf::decode(&[2, 0x01, 0, 0]).is_err());
    }

    #[test]
    fn test_validate_conflicting_bindings() {
        let mut conf = CurrentButtonConf { enabled: true, actions: ButtonActionMap::new() };
        conf.actions.insert(ButtonAction::NextItem, bind(EarSide::Right, Gesture::DoubleClick));
        conf.actions.insert(ButtonAction::PreviousItem, bind(EarSide::Left, Gesture::DoubleClick));
        assert!(conf.validate().is_ok());

        conf.actions.insert(ButtonAction::PickHangUp, bind(EarSide::Both, Gesture::DoubleClick));
        assert!(matches!(conf.validate(), Err(ConfigError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&bind(EarSide::Both, Gesture::LongPressLong)).unwrap();
        assert_eq!(json, r#"{"earSide":"both","gesture":"longPressLong"}"#);
        assert_eq!(
            serde_json::to_string(&ButtonAction::StartVoiceAssistant).unwrap(),
            r#""startVoiceAssistant""#
        );
    }
}
