use serde::{Deserialize, Serialize};

use crate::transport::{PayloadReader, Result};

// Marker for "no preset selected"
const NO_SELECTION: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EqualizerPreset {
    pub name: String,
    pub value: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EqualizerState {
    pub ready: bool,
    pub available_presets: Vec<EqualizerPreset>,
    pub selected_preset_value: Option<u8>,
}

impl EqualizerState {
    /// Preset at a position of the advertised list.
    pub fn preset_at(&self, index: usize) -> Option<&EqualizerPreset> {
        self.available_presets.get(index)
    }

    pub fn selected_preset(&self) -> Option<&EqualizerPreset> {
        let value = self.selected_preset_value?;
        self.available_presets.iter().find(|p| p.value == value)
    }

    /// Wire layout: `ready | selected (0xFF = none) | count | { value | name_len | name }*`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![
            self.ready as u8,
            self.selected_preset_value.unwrap_or(NO_SELECTION),
            self.available_presets.len() as u8,
        ];
        for preset in &self.available_presets {
            out.push(preset.value);
            out.push(preset.name.len() as u8);
            out.extend_from_slice(preset.name.as_bytes());
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(payload);
        let ready = reader.read_u8()? != 0;
        let selected = reader.read_u8()?;
        let count = reader.read_u8()?;

        let mut available_presets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let value = reader.read_u8()?;
            let name = reader.read_short_string()?;
            available_presets.push(EqualizerPreset { name, value });
        }

        Ok(Self {
            ready,
            available_presets,
            selected_preset_value: (selected != NO_SELECTION).then_some(selected),
        })
    }
}
