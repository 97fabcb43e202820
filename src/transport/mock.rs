//! Scripted in-memory device.
//!
//! Speaks the same frames as real firmware, so everything above the
//! [`Transport`] trait runs unchanged against it. Faults are injected through
//! [`MockBehavior`]; what the device saw is recorded in [`MockState`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;

use super::frame::{CommandId, Frame};
use super::protocol::{PayloadReader, Reply};
use super::{Connector, DiscoveredDevice, Result, Transport, TransportError};
use crate::config::{
    ButtonAction, ButtonBinding, CurrentButtonConf, DefaultButtonConf, EarSide,
    EqualizerPreset, EqualizerState, Gesture,
};
use crate::update::{ConfirmationKind, UpgradeOption};

pub const REJECT_BAD_CHUNK_CRC: u8 = 0x10;
pub const REJECT_BUTTON_WRITE: u8 = 0x20;
pub const REJECT_UNKNOWN_PRESET: u8 = 0x30;

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationScript {
    Accept,
    /// Answer "still validating" `polls` times before accepting.
    Pending { polls: u32, retry_after_ms: u16 },
    /// Hold validation until the host answers this confirmation.
    Confirm(ConfirmationKind),
    Reject(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerificationScript {
    Verified,
    DifferentId,
    Confirm(ConfirmationKind),
    Reject(u8),
}

#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub resume_chunk: u32,
    pub reject_sync: Option<u8>,
    pub sync_confirmation: Option<ConfirmationKind>,
    /// Drop the link (once) when this chunk arrives; the chunk is not acked.
    pub drop_link_at_chunk: Option<u32>,
    /// Stay silent for this chunk the given number of times.
    pub silent_at_chunk: Option<(u32, u32)>,
    pub reject_chunk: Option<(u32, u8)>,
    /// Lose this chunk (once) and answer with the previous chunk's ack.
    pub stale_ack_at_chunk: Option<u32>,
    /// Queue a leftover ack of the previous chunk ahead of this chunk's ack.
    pub duplicate_ack_at_chunk: Option<u32>,
    /// Acknowledge this chunk with the index of the one after it.
    pub ack_ahead_at_chunk: Option<u32>,
    /// Answer "busy, retry after ms" this many times for every chunk.
    pub busy_per_chunk: Option<(u32, u16)>,
    pub refuse_reconnect: bool,
    pub validation: ValidationScript,
    pub verification: VerificationScript,
    /// Stay silent for this many configuration requests.
    pub config_silent_requests: u32,
    pub reject_button_write: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            resume_chunk: 0,
            reject_sync: None,
            sync_confirmation: None,
            drop_link_at_chunk: None,
            silent_at_chunk: None,
            reject_chunk: None,
            stale_ack_at_chunk: None,
            duplicate_ack_at_chunk: None,
            ack_ahead_at_chunk: None,
            busy_per_chunk: None,
            refuse_reconnect: false,
            validation: ValidationScript::Accept,
            verification: VerificationScript::Verified,
            config_silent_requests: 0,
            reject_button_write: false,
        }
    }
}

#[derive(Debug)]
pub struct MockState {
    pub behavior: MockBehavior,
    pub connected: bool,
    pub requests: Vec<CommandId>,
    pub received_chunks: Vec<u32>,
    pub confirmations: Vec<(ConfirmationKind, UpgradeOption)>,
    pub synced_image_id: Option<u32>,
    pub aborts: u32,
    pub reboots: u32,
    pub reconnects: u32,
    pub app_version: String,
    pub current_buttons: CurrentButtonConf,
    pub default_buttons: DefaultButtonConf,
    pub equalizer: EqualizerState,
    drop_fired: bool,
    silent_served: u32,
    stale_fired: bool,
    busy_served: (u32, u32),
    validation_polls: u32,
    drop_after_reply: bool,
    outbox: VecDeque<Frame>,
}

enum Action {
    Reply(Reply),
    Replies(Vec<Reply>),
    ReplyThenDrop(Reply),
    Silent,
    DropLink,
}

impl MockState {
    fn new(behavior: MockBehavior) -> Self {
        let default_buttons = sample_buttons();
        Self {
            behavior,
            connected: false,
            requests: Vec::new(),
            received_chunks: Vec::new(),
            confirmations: Vec::new(),
            synced_image_id: None,
            aborts: 0,
            reboots: 0,
            reconnects: 0,
            app_version: "3.1.0".to_string(),
            current_buttons: CurrentButtonConf {
                enabled: true,
                actions: default_buttons.actions.clone(),
            },
            default_buttons,
            equalizer: EqualizerState {
                ready: true,
                available_presets: vec![
                    EqualizerPreset { name: "Flat".to_string(), value: 0 },
                    EqualizerPreset { name: "Bass Boost".to_string(), value: 1 },
                    EqualizerPreset { name: "Vocal".to_string(), value: 4 },
                ],
                selected_preset_value: Some(0),
            },
            drop_fired: false,
            silent_served: 0,
            stale_fired: false,
            busy_served: (u32::MAX, 0),
            validation_polls: 0,
            drop_after_reply: false,
            outbox: VecDeque::new(),
        }
    }

    fn confirmed(&self, kind: ConfirmationKind) -> bool {
        self.confirmations.iter().any(|(k, option)| {
            *k == kind && matches!(option, UpgradeOption::Confirm | UpgradeOption::InteractiveCommit)
        })
    }

    fn take_config_silence(&mut self) -> bool {
        if self.behavior.config_silent_requests > 0 {
            self.behavior.config_silent_requests -= 1;
            true
        } else {
            false
        }
    }

    fn handle(&mut self, command: CommandId, payload: &[u8]) -> Result<Action> {
        let mut reader = PayloadReader::new(payload);
        let action = match command {
            CommandId::UpgradeSync => {
                let image_id = reader.read_u32()?;
                self.synced_image_id = Some(image_id);
                if let Some(code) = self.behavior.reject_sync {
                    Action::Reply(Reply::Rejected(code))
                } else if let Some(kind) = self.behavior.sync_confirmation.filter(|k| !self.confirmed(*k)) {
                    Action::Reply(Reply::ConfirmationRequired(kind.code()))
                } else {
                    Action::Reply(Reply::Ok(self.behavior.resume_chunk.to_be_bytes().to_vec()))
                }
            }
            CommandId::UpgradeData => {
                let index = reader.read_u32()?;
                let crc = reader.read_u32()?;
                let data = reader.remaining();

                if self.behavior.drop_link_at_chunk == Some(index) && !self.drop_fired {
                    self.drop_fired = true;
                    return Ok(Action::DropLink);
                }
                if let Some((chunk, times)) = self.behavior.silent_at_chunk {
                    if chunk == index && self.silent_served < times {
                        self.silent_served += 1;
                        return Ok(Action::Silent);
                    }
                }
                if let Some((chunk, code)) = self.behavior.reject_chunk {
                    if chunk == index {
                        return Ok(Action::Reply(Reply::Rejected(code)));
                    }
                }
                if self.behavior.stale_ack_at_chunk == Some(index) && !self.stale_fired {
                    self.stale_fired = true;
                    let previous = index.saturating_sub(1);
                    return Ok(Action::Reply(Reply::Ok(previous.to_be_bytes().to_vec())));
                }
                if let Some((times, retry_after_ms)) = self.behavior.busy_per_chunk {
                    if self.busy_served.0 != index {
                        self.busy_served = (index, 0);
                    }
                    if self.busy_served.1 < times {
                        self.busy_served.1 += 1;
                        return Ok(Action::Reply(Reply::Pending(retry_after_ms)));
                    }
                }
                if crc32fast::hash(data) != crc {
                    return Ok(Action::Reply(Reply::Rejected(REJECT_BAD_CHUNK_CRC)));
                }
                self.received_chunks.push(index);
                if self.behavior.ack_ahead_at_chunk == Some(index) {
                    return Ok(Action::Reply(Reply::Ok((index + 1).to_be_bytes().to_vec())));
                }
                let ack = Reply::Ok(index.to_be_bytes().to_vec());
                if self.behavior.duplicate_ack_at_chunk == Some(index) && index > 0 {
                    let leftover = Reply::Ok((index - 1).to_be_bytes().to_vec());
                    return Ok(Action::Replies(vec![leftover, ack]));
                }
                Action::Reply(ack)
            }
            CommandId::UpgradeValidate => match self.behavior.validation.clone() {
                ValidationScript::Accept => Action::Reply(Reply::Ok(Vec::new())),
                ValidationScript::Pending { polls, retry_after_ms } => {
                    if self.validation_polls < polls {
                        self.validation_polls += 1;
                        Action::Reply(Reply::Pending(retry_after_ms))
                    } else {
                        Action::Reply(Reply::Ok(Vec::new()))
                    }
                }
                ValidationScript::Confirm(kind) if !self.confirmed(kind) => {
                    Action::Reply(Reply::ConfirmationRequired(kind.code()))
                }
                ValidationScript::Confirm(_) => Action::Reply(Reply::Ok(Vec::new())),
                ValidationScript::Reject(code) => Action::Reply(Reply::Rejected(code)),
            },
            CommandId::UpgradeConfirm => {
                let kind = reader.read_u8()?;
                let option = reader.read_u8()?;
                match (ConfirmationKind::from_code(kind), UpgradeOption::from_code(option)) {
                    (Some(kind), Some(option)) => {
                        self.confirmations.push((kind, option));
                        Action::Reply(Reply::Ok(Vec::new()))
                    }
                    _ => Action::Reply(Reply::Rejected(0xFF)),
                }
            }
            CommandId::UpgradeReboot => {
                self.reboots += 1;
                Action::ReplyThenDrop(Reply::Ok(Vec::new()))
            }
            CommandId::UpgradeVerify => match self.behavior.verification.clone() {
                VerificationScript::Verified => Action::Reply(Reply::Ok(vec![0])),
                VerificationScript::DifferentId => Action::Reply(Reply::Ok(vec![1])),
                VerificationScript::Confirm(kind) if !self.confirmed(kind) => {
                    Action::Reply(Reply::ConfirmationRequired(kind.code()))
                }
                VerificationScript::Confirm(_) => Action::Reply(Reply::Ok(vec![0])),
                VerificationScript::Reject(code) => Action::Reply(Reply::Rejected(code)),
            },
            CommandId::UpgradeAbort => {
                self.aborts += 1;
                Action::Reply(Reply::Ok(Vec::new()))
            }
            CommandId::GetApplicationVersion => {
                let version = self.app_version.as_bytes();
                let mut body = vec![version.len() as u8];
                body.extend_from_slice(version);
                Action::Reply(Reply::Ok(body))
            }
            CommandId::GetCurrentButtonActions => {
                if self.take_config_silence() {
                    return Ok(Action::Silent);
                }
                Action::Reply(Reply::Ok(self.current_buttons.encode()))
            }
            CommandId::GetDefaultButtonActions => {
                if self.take_config_silence() {
                    return Ok(Action::Silent);
                }
                Action::Reply(Reply::Ok(self.default_buttons.encode()))
            }
            CommandId::SetButtonActions => {
                if self.take_config_silence() {
                    return Ok(Action::Silent);
                }
                if self.behavior.reject_button_write {
                    Action::Reply(Reply::Rejected(REJECT_BUTTON_WRITE))
                } else {
                    self.current_buttons = CurrentButtonConf::decode(payload)?;
                    Action::Reply(Reply::Ok(Vec::new()))
                }
            }
            CommandId::GetEqualizerInfo => {
                if self.take_config_silence() {
                    return Ok(Action::Silent);
                }
                Action::Reply(Reply::Ok(self.equalizer.encode()))
            }
            CommandId::SelectEqualizerPreset => {
                let value = reader.read_u8()?;
                if self.equalizer.available_presets.iter().any(|p| p.value == value) {
                    self.equalizer.selected_preset_value = Some(value);
                    Action::Reply(Reply::Ok(vec![value]))
                } else {
                    Action::Reply(Reply::Rejected(REJECT_UNKNOWN_PRESET))
                }
            }
        };
        Ok(action)
    }
}

fn sample_buttons() -> DefaultButtonConf {
    let mut conf = DefaultButtonConf::default();
    let bindings = [
        (ButtonAction::PausePlay, EarSide::Both, Gesture::SingleClick),
        (ButtonAction::NextItem, EarSide::Right, Gesture::DoubleClick),
        (ButtonAction::PreviousItem, EarSide::Left, Gesture::DoubleClick),
        (ButtonAction::PickHangUp, EarSide::Both, Gesture::TripleClick),
        (ButtonAction::StartVoiceAssistant, EarSide::Both, Gesture::LongPressShort),
    ];
    for (action, ear_side, gesture) in bindings {
        conf.actions.insert(action, ButtonBinding { ear_side, gesture });
    }
    conf
}

/// Handle to one simulated device. Clones share the same state.
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
    link_tx: Arc<watch::Sender<bool>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        let (link_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(MockState::new(behavior))),
            link_tx: Arc::new(link_tx),
        }
    }

    /// Lock the device state for inspection or scripting.
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn configure<F: FnOnce(&mut MockBehavior)>(&self, f: F) {
        f(&mut self.state().behavior);
    }

    /// Open a link to this device.
    pub fn link(&self) -> MockLink {
        self.set_connected(true);
        MockLink { device: self.clone() }
    }

    /// Drop the link from the device side.
    pub fn drop_link(&self) {
        self.set_connected(false);
    }

    fn set_connected(&self, connected: bool) {
        {
            let mut state = self.state();
            state.connected = connected;
            if !connected {
                state.outbox.clear();
            }
        }
        self.link_tx.send_replace(connected);
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MockLink {
    device: MockDevice,
}

#[async_trait]
impl Transport for MockLink {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let frame = Frame::decode(bytes)?;
        let command = frame
            .command_id()
            .ok_or_else(|| TransportError::Frame(format!("Unknown command 0x{:04X}", frame.command)))?;

        let action = {
            let mut state = self.device.state();
            if !state.connected {
                return Err(TransportError::Disconnected);
            }
            state.requests.push(command);
            let action = state.handle(command, &frame.payload)?;
            match action {
                Action::Reply(reply) => {
                    state.outbox.push_back(Frame::response(command, reply.encode()));
                    None
                }
                Action::Replies(replies) => {
                    for reply in replies {
                        state.outbox.push_back(Frame::response(command, reply.encode()));
                    }
                    None
                }
                Action::ReplyThenDrop(reply) => {
                    state.outbox.push_back(Frame::response(command, reply.encode()));
                    state.drop_after_reply = true;
                    None
                }
                Action::Silent => None,
                Action::DropLink => Some(()),
            }
        };

        if action.is_some() {
            log::debug!("Mock device dropping link on {:?}", command);
            self.device.drop_link();
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Frame> {
        let mut went_down = false;
        let next = {
            let mut state = self.device.state();
            match state.outbox.pop_front() {
                Some(frame) => {
                    if state.outbox.is_empty() && state.drop_after_reply {
                        state.drop_after_reply = false;
                        went_down = true;
                    }
                    Some(Ok(frame))
                }
                None if !state.connected => Some(Err(TransportError::Disconnected)),
                None => None,
            }
        };

        if went_down {
            self.device.drop_link();
        }
        match next {
            Some(result) => result,
            // Silent device: wait until the caller's timeout gives up.
            None => std::future::pending().await,
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        {
            let mut state = self.device.state();
            if state.behavior.refuse_reconnect {
                return Err(TransportError::ConnectionFailed("Device unreachable".to_string()));
            }
            state.reconnects += 1;
        }
        self.device.set_connected(true);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.device.set_connected(false);
    }

    fn is_connected(&self) -> bool {
        self.device.state().connected
    }

    fn link_state(&self) -> watch::Receiver<bool> {
        self.device.link_tx.subscribe()
    }
}

/// Connector over a fixed set of mock devices.
#[derive(Clone, Default)]
pub struct MockConnector {
    devices: Vec<(DiscoveredDevice, MockDevice)>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, address: &str, name: &str, device: MockDevice) -> Self {
        self.devices.push((
            DiscoveredDevice {
                address: address.to_string(),
                name: name.to_string(),
            },
            device,
        ));
        self
    }

    pub fn device(&self, address: &str) -> Option<MockDevice> {
        self.devices
            .iter()
            .find(|(info, _)| info.address == address)
            .map(|(_, device)| device.clone())
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        Ok(self.devices.iter().map(|(info, _)| info.clone()).collect())
    }

    async fn open(&self, address: &str) -> Result<Box<dyn Transport>> {
        let device = self
            .device(address)
            .ok_or_else(|| TransportError::PortNotFound(address.to_string()))?;
        Ok(Box::new(device.link()))
    }
}
