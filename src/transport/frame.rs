//! Binary framing shared by every link.
//!
//! Layout: `SOF | version | len (u16 BE) | command (u16 BE) | payload | crc32 (u32 LE)`.
//! The CRC covers everything from `version` to the end of the payload.
//! Responses echo the request command with [`RESPONSE_FLAG`] set.

use super::{Result, TransportError};

pub const SOF: u8 = 0xFF;
pub const PROTOCOL_VERSION: u8 = 0x01;
pub const RESPONSE_FLAG: u16 = 0x8000;
pub const MAX_PAYLOAD: usize = 4096;

const HEADER_LEN: usize = 6;
const CRC_LEN: usize = 4;

/// Commands understood by the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandId {
    GetApplicationVersion = 0x0300,
    GetCurrentButtonActions = 0x0420,
    GetDefaultButtonActions = 0x0421,
    SetButtonActions = 0x0422,
    GetEqualizerInfo = 0x0430,
    SelectEqualizerPreset = 0x0431,
    UpgradeSync = 0x0601,
    UpgradeData = 0x0602,
    UpgradeValidate = 0x0603,
    UpgradeReboot = 0x0604,
    UpgradeVerify = 0x0605,
    UpgradeConfirm = 0x0606,
    UpgradeAbort = 0x0607,
}

impl CommandId {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn response_code(self) -> u16 {
        self.code() | RESPONSE_FLAG
    }

    pub fn from_code(code: u16) -> Option<Self> {
        let command = match code & !RESPONSE_FLAG {
            0x0300 => Self::GetApplicationVersion,
            0x0420 => Self::GetCurrentButtonActions,
            0x0421 => Self::GetDefaultButtonActions,
            0x0422 => Self::SetButtonActions,
            0x0430 => Self::GetEqualizerInfo,
            0x0431 => Self::SelectEqualizerPreset,
            0x0601 => Self::UpgradeSync,
            0x0602 => Self::UpgradeData,
            0x0603 => Self::UpgradeValidate,
            0x0604 => Self::UpgradeReboot,
            0x0605 => Self::UpgradeVerify,
            0x0606 => Self::UpgradeConfirm,
            0x0607 => Self::UpgradeAbort,
            _ => return None,
        };
        Some(command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: u16, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }

    pub fn request(command: CommandId, payload: Vec<u8>) -> Self {
        Self::new(command.code(), payload)
    }

    pub fn response(command: CommandId, payload: Vec<u8>) -> Self {
        Self::new(command.response_code(), payload)
    }

    pub fn is_response(&self) -> bool {
        self.command & RESPONSE_FLAG != 0
    }

    pub fn command_id(&self) -> Option<CommandId> {
        CommandId::from_code(self.command)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + CRC_LEN);
        out.push(SOF);
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.command.to_be_bytes());
        out.extend_from_slice(&self.payload);
        let crc = crc32fast::hash(&out[1..]);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decode exactly one frame. Trailing bytes are an error.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut decoder = FrameDecoder::new();
        decoder.push(bytes);
        let frame = decoder
            .next_frame()?
            .ok_or_else(|| TransportError::Frame("Incomplete frame".to_string()))?;
        if decoder.buffered() != 0 {
            return Err(TransportError::Frame(format!(
                "{} trailing bytes after frame",
                decoder.buffered()
            )));
        }
        Ok(frame)
    }
}

/// Reassembles frames from a byte stream that may split or merge them.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// A corrupt frame is consumed and reported as an error so the caller can
    /// keep reading from the same decoder.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.buffer.iter().position(|b| *b == SOF) {
            Some(0) => {}
            Some(start) => {
                log::trace!("Skipping {} bytes before start of frame", start);
                self.buffer.drain(..start);
            }
            None => {
                self.buffer.clear();
                return Ok(None);
            }
        }

        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let version = self.buffer[1];
        if version != PROTOCOL_VERSION {
            self.buffer.drain(..1);
            return Err(TransportError::Frame(format!(
                "Unsupported protocol version 0x{:02X}",
                version
            )));
        }

        let payload_len = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if payload_len > MAX_PAYLOAD {
            self.buffer.drain(..1);
            return Err(TransportError::Frame(format!(
                "Payload length {} exceeds maximum {}",
                payload_len, MAX_PAYLOAD
            )));
        }

        let total = HEADER_LEN + payload_len + CRC_LEN;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame_bytes: Vec<u8> = self.buffer.drain(..total).collect();
        let crc_offset = HEADER_LEN + payload_len;
        let expected = u32::from_le_bytes([
            frame_bytes[crc_offset],
            frame_bytes[crc_offset + 1],
            frame_bytes[crc_offset + 2],
            frame_bytes[crc_offset + 3],
        ]);
        let actual = crc32fast::hash(&frame_bytes[1..crc_offset]);
        if expected != actual {
            return Err(TransportError::Frame(format!(
                "CRC mismatch: expected 0x{:08X}, computed 0x{:08X}",
                expected, actual
            )));
        }

        let command = u16::from_be_bytes([frame_bytes[4], frame_bytes[5]]);
        Ok(Some(Frame::new(
            command,
            frame_bytes[HEADER_LEN..crc_offset].to_vec(),
        )))
    }
}
