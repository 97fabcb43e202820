//! Upgrade session state machine.
//!
//! Each session is driven by one spawned task ([`SessionDriver::run`]) that
//! owns all protocol traffic for the upgrade. Callers interact only through
//! [`SessionShared`]: they can read a snapshot, answer a pending
//! confirmation, or raise the cancel flag. The driver observes that flag at
//! every suspension point (request in flight, confirmation wait, back-off,
//! reconnect), so cancellation takes effect within one operation timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout, Instant};
use uuid::Uuid;

use super::confirmation::ConfirmationBroker;
use super::image::FirmwareImage;
use super::models::{
    Confirmation, ConfirmationKind, ErrorKind, Result, SessionHandle, UpgradeError,
    UpgradeOption, UpgradeResult, UpgradeSession, UpgradeState,
};
use crate::device::{ConnectionState, DeviceAddress, DeviceManager};
use crate::events::{CoreEvent, EventBus};
use crate::settings::DfuSettings;
use crate::transport::{CommandId, PayloadReader, Reply, SharedProtocol};

// Verify reply body: the device runs the new image, or another upgrade
// with a different image id is already in progress.
const VERIFY_ACTIVE: u8 = 0x00;
const VERIFY_DIFFERENT_ID: u8 = 0x01;

struct SessionInner {
    state: UpgradeState,
    progress: u8,
    acked_bytes: u64,
    last_error: Option<ErrorKind>,
    result: Option<UpgradeResult>,
    broker: ConfirmationBroker,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// State of one session, shared between its driver and the service.
pub(crate) struct SessionShared {
    id: Uuid,
    device: DeviceAddress,
    image: Arc<FirmwareImage>,
    inner: Mutex<SessionInner>,
    cancel_tx: watch::Sender<bool>,
    state_tx: watch::Sender<UpgradeState>,
    events: EventBus,
}

impl SessionShared {
    pub(crate) fn new(device: DeviceAddress, image: Arc<FirmwareImage>, events: EventBus) -> Self {
        let now = Utc::now();
        let (cancel_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(UpgradeState::Initialisation);
        Self {
            id: Uuid::new_v4(),
            device,
            image,
            inner: Mutex::new(SessionInner {
                state: UpgradeState::Initialisation,
                progress: 0,
                acked_bytes: 0,
                last_error: None,
                result: None,
                broker: ConfirmationBroker::new(),
                started_at: now,
                updated_at: now,
            }),
            cancel_tx,
            state_tx,
            events,
        }
    }

    pub(crate) fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            device: self.device.clone(),
        }
    }

    pub(crate) fn state(&self) -> UpgradeState {
        *self.state_tx.borrow()
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Publish the initial state and progress of a fresh session.
    pub(crate) fn announce(&self) {
        self.events.emit(CoreEvent::UpgradeStateChanged {
            device: self.device.clone(),
            session: self.id,
            state: UpgradeState::Initialisation,
        });
        self.events.emit(CoreEvent::UpgradeProgress {
            device: self.device.clone(),
            session: self.id,
            progress: 0,
        });
    }

    pub(crate) async fn snapshot(&self) -> UpgradeSession {
        let inner = self.inner.lock().await;
        UpgradeSession {
            id: self.id,
            device: self.device.clone(),
            image: (*self.image).clone(),
            state: inner.state,
            progress: inner.progress,
            pending_confirmation: inner.broker.pending().cloned(),
            last_error: inner.last_error.clone(),
            result: inner.result,
            started_at: inner.started_at,
            updated_at: inner.updated_at,
        }
    }

    /// Deliver a caller decision to the waiting driver.
    pub(crate) async fn resolve(&self, option: UpgradeOption) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() || *self.cancel_tx.borrow() {
            return Err(UpgradeError::NoConfirmationPending);
        }
        let confirmation = inner.broker.resolve(option)?;
        log::info!(
            "Upgrade {} on {}: {:?} answered with {:?}",
            self.id,
            self.device,
            confirmation.kind,
            option
        );
        Ok(())
    }

    /// Raise the cancel flag. A pending confirmation is withdrawn first so
    /// its option never reaches the device.
    pub(crate) async fn cancel(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state.is_terminal() {
                return;
            }
            if let Some(confirmation) = inner.broker.discard() {
                log::info!("Discarding pending {:?} confirmation", confirmation.kind);
            }
        }
        log::info!("Upgrade {} on {} cancel requested", self.id, self.device);
        self.cancel_tx.send_replace(true);
    }

    pub(crate) async fn wait_terminal(&self) {
        let mut state_rx = self.state_tx.subscribe();
        loop {
            if state_rx.borrow_and_update().is_terminal() {
                return;
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Active phases of an upgrade, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initialisation,
    Upload,
    Validation,
    Reboot,
    Verification,
}

impl Phase {
    fn state(self) -> UpgradeState {
        match self {
            Phase::Initialisation => UpgradeState::Initialisation,
            Phase::Upload => UpgradeState::Upload,
            Phase::Validation => UpgradeState::Validation,
            Phase::Reboot => UpgradeState::Reboot,
            Phase::Verification => UpgradeState::Verification,
        }
    }
}

enum Step {
    Next(Phase),
    /// Link lost in the given phase; reconnect and resume it.
    LinkLost(Phase, String),
    Finish(UpgradeResult),
    Abort(ErrorKind),
}

enum Interrupt {
    Cancelled,
    LinkLost(String),
}

pub(crate) struct SessionDriver {
    shared: Arc<SessionShared>,
    protocol: SharedProtocol,
    devices: DeviceManager,
    settings: DfuSettings,
    cancel_rx: watch::Receiver<bool>,
    /// First chunk the device has not acknowledged yet.
    next_chunk: u32,
}

impl SessionDriver {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        protocol: SharedProtocol,
        devices: DeviceManager,
        settings: DfuSettings,
    ) -> Self {
        let cancel_rx = shared.cancel_tx.subscribe();
        Self {
            shared,
            protocol,
            devices,
            settings,
            cancel_rx,
            next_chunk: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        log::info!(
            "Upgrade {} started on {}: {} bytes in {} chunks",
            self.shared.id,
            self.shared.device,
            self.shared.image.total_size,
            self.shared.image.chunk_count()
        );

        let mut phase = Phase::Initialisation;
        loop {
            let step = match phase {
                Phase::Initialisation => self.initialise().await,
                Phase::Upload => self.upload().await,
                Phase::Validation => self.validate().await,
                Phase::Reboot => self.reboot().await,
                Phase::Verification => self.verify().await,
            };

            match step {
                Step::Next(next) => {
                    phase = next;
                    self.transition(next.state()).await;
                }
                Step::LinkLost(resume, detail) => {
                    log::warn!("Link to {} lost during {:?}: {}", self.shared.device, resume, detail);
                    self.shared.inner.lock().await.last_error = Some(ErrorKind::LinkError { detail });
                    self.transition(UpgradeState::Reconnecting).await;
                    self.devices
                        .set_connection_state(&self.shared.device, ConnectionState::Connecting)
                        .await;

                    match self.reconnect_within(self.settings.reconnect_timeout()).await {
                        Ok(()) => {
                            phase = resume;
                            self.transition(resume.state()).await;
                        }
                        Err(kind) => {
                            self.abort(kind).await;
                            return;
                        }
                    }
                }
                Step::Finish(result) => {
                    self.finish(result).await;
                    return;
                }
                Step::Abort(kind) => {
                    self.abort(kind).await;
                    return;
                }
            }
        }
    }

    async fn initialise(&mut self) -> Step {
        let image = Arc::clone(&self.shared.image);
        let total_size = match u32::try_from(image.total_size) {
            Ok(size) => size,
            Err(_) => {
                return Step::Abort(ErrorKind::IntegrityCheckFailed {
                    detail: format!("image of {} bytes is too large to announce", image.total_size),
                })
            }
        };
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&image.image_id().to_be_bytes());
        payload.extend_from_slice(&total_size.to_be_bytes());
        payload.extend_from_slice(&image.chunk_count().to_be_bytes());
        payload.extend_from_slice(&(image.chunk_size as u32).to_be_bytes());

        let mut polls = 0;
        loop {
            match self.request(CommandId::UpgradeSync, payload.clone()).await {
                Err(interrupt) => return interrupted(interrupt, Phase::Initialisation),
                Ok(Reply::Ok(body)) => {
                    let mut resume = PayloadReader::new(&body).read_u32().unwrap_or(0);
                    if resume > image.chunk_count() {
                        log::warn!(
                            "Device asked to resume at chunk {} of {}, restarting transfer",
                            resume,
                            image.chunk_count()
                        );
                        resume = 0;
                    }
                    if resume > 0 {
                        log::info!("Device resumes transfer at chunk {}", resume);
                    }
                    self.next_chunk = resume;
                    self.record_progress(image.offset_of(resume).min(image.total_size)).await;
                    return Step::Next(Phase::Upload);
                }
                Ok(Reply::Pending(ms)) => {
                    if let Some(step) = self.wait_pending(&mut polls, ms, Phase::Initialisation).await {
                        return step;
                    }
                }
                Ok(Reply::ConfirmationRequired(code)) => {
                    if let Some(step) = self.confirmation(code, Phase::Initialisation).await {
                        return step;
                    }
                }
                Ok(Reply::Rejected(code)) => return rejected(CommandId::UpgradeSync, code),
            }
        }
    }

    async fn upload(&mut self) -> Step {
        let image = Arc::clone(&self.shared.image);
        let mut reader = image.chunks_from(self.next_chunk);
        // both reset once a chunk is acknowledged
        let mut polls = 0;
        let mut resends = 0;

        loop {
            let chunk = match reader.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    log::info!("All {} chunks acknowledged", image.chunk_count());
                    return Step::Next(Phase::Validation);
                }
                Err(e) => {
                    return Step::Abort(ErrorKind::IntegrityCheckFailed {
                        detail: e.to_string(),
                    })
                }
            };

            let mut payload = Vec::with_capacity(8 + chunk.data.len());
            payload.extend_from_slice(&chunk.index.to_be_bytes());
            payload.extend_from_slice(&chunk.crc.to_be_bytes());
            payload.extend_from_slice(&chunk.data);

            log::trace!("Sending chunk {} ({} bytes)", chunk.index, chunk.data.len());
            let reply = match self.request(CommandId::UpgradeData, payload).await {
                Ok(reply) => self.skip_stale_acks(chunk.index, reply).await,
                Err(interrupt) => Err(interrupt),
            };

            match reply {
                Err(interrupt) => return interrupted(interrupt, Phase::Upload),
                Ok(None) => {
                    resends += 1;
                    if resends > self.settings.chunk_retry_limit {
                        log::warn!("Chunk {} never acknowledged after {} resends", chunk.index, resends - 1);
                        return Step::LinkLost(
                            Phase::Upload,
                            format!("chunk {} not acknowledged", chunk.index),
                        );
                    }
                    log::warn!("No acknowledgement for chunk {}, resending", chunk.index);
                    reader = image.chunks_from(chunk.index);
                }
                Ok(Some(Reply::Ok(body))) => {
                    let acked = PayloadReader::new(&body).read_u32().unwrap_or(chunk.index);
                    if acked != chunk.index {
                        log::error!("Chunk {} acknowledged as {}", chunk.index, acked);
                        return Step::Abort(ErrorKind::UnexpectedAck {
                            expected: chunk.index,
                            acked,
                        });
                    }
                    polls = 0;
                    resends = 0;
                    self.next_chunk = chunk.index + 1;
                    self.record_progress(chunk.offset + chunk.data.len() as u64).await;
                }
                Ok(Some(Reply::Pending(ms))) => {
                    if let Some(step) = self.wait_pending(&mut polls, ms, Phase::Upload).await {
                        return step;
                    }
                    reader = image.chunks_from(chunk.index);
                }
                Ok(Some(Reply::ConfirmationRequired(code))) => {
                    if let Some(step) = self.confirmation(code, Phase::Upload).await {
                        return step;
                    }
                    reader = image.chunks_from(chunk.index);
                }
                Ok(Some(Reply::Rejected(code))) => return rejected(CommandId::UpgradeData, code),
            }
        }
    }

    /// Drop acknowledgements of earlier chunks (late replies to a request
    /// that already timed out) and wait for the one answering `index`.
    /// `None` means no such reply arrived in time.
    async fn skip_stale_acks(
        &self,
        index: u32,
        first: Reply,
    ) -> std::result::Result<Option<Reply>, Interrupt> {
        let mut reply = first;
        loop {
            let acked = match &reply {
                Reply::Ok(body) => PayloadReader::new(body).read_u32().ok(),
                _ => None,
            };
            match acked {
                Some(acked) if acked < index => {
                    log::debug!("Ignoring stale ack for chunk {} while waiting for {}", acked, index);
                }
                _ => return Ok(Some(reply)),
            }

            let protocol = Arc::clone(&self.protocol);
            let mut cancel_rx = self.cancel_rx.clone();
            let outcome = tokio::select! {
                result = async { protocol.lock().await.await_reply(CommandId::UpgradeData).await } => result,
                _ = wait_cancelled(&mut cancel_rx) => return Err(Interrupt::Cancelled),
            };
            match outcome {
                Ok(next) => reply = next,
                Err(e) if e.is_link_down() => return Err(Interrupt::LinkLost(e.to_string())),
                Err(_) => return Ok(None),
            }
        }
    }

    async fn validate(&mut self) -> Step {
        let mut polls = 0;
        loop {
            match self.request(CommandId::UpgradeValidate, Vec::new()).await {
                Err(interrupt) => return interrupted(interrupt, Phase::Validation),
                Ok(Reply::Ok(_)) => return Step::Next(Phase::Reboot),
                Ok(Reply::Pending(ms)) => {
                    log::debug!("Validation still running, retry in {} ms", ms);
                    if let Some(step) = self.wait_pending(&mut polls, ms, Phase::Validation).await {
                        return step;
                    }
                }
                Ok(Reply::ConfirmationRequired(code)) => {
                    if let Some(step) = self.confirmation(code, Phase::Validation).await {
                        return step;
                    }
                }
                Ok(Reply::Rejected(code)) => return rejected(CommandId::UpgradeValidate, code),
            }
        }
    }

    async fn reboot(&mut self) -> Step {
        let mut polls = 0;
        loop {
            // The device may reset before its reply gets out, so a missing
            // reply counts as success and the request is never repeated.
            match self.request_with(CommandId::UpgradeReboot, Vec::new(), 1).await {
                Ok(Reply::Ok(_)) => break,
                Err(Interrupt::LinkLost(detail)) => {
                    log::info!("No reply to reboot request ({}), device likely rebooted", detail);
                    break;
                }
                Err(Interrupt::Cancelled) => return Step::Abort(ErrorKind::Cancelled),
                Ok(Reply::Pending(ms)) => {
                    if let Some(step) = self.wait_pending(&mut polls, ms, Phase::Reboot).await {
                        return step;
                    }
                }
                Ok(Reply::ConfirmationRequired(code)) => {
                    if let Some(step) = self.confirmation(code, Phase::Reboot).await {
                        return step;
                    }
                }
                Ok(Reply::Rejected(code)) => return rejected(CommandId::UpgradeReboot, code),
            }
        }

        self.wait_for_link_down().await;
        self.devices
            .set_connection_state(&self.shared.device, ConnectionState::Connecting)
            .await;
        match self.reconnect_within(self.settings.reboot_timeout()).await {
            Ok(()) => Step::Next(Phase::Verification),
            Err(kind) => Step::Abort(kind),
        }
    }

    async fn verify(&mut self) -> Step {
        let mut polls = 0;
        loop {
            match self.request(CommandId::UpgradeVerify, Vec::new()).await {
                Err(interrupt) => return interrupted(interrupt, Phase::Verification),
                Ok(Reply::Ok(body)) => {
                    return match body.first().copied().unwrap_or(VERIFY_ACTIVE) {
                        VERIFY_DIFFERENT_ID => {
                            log::warn!("Device reports an upgrade with a different image id in progress");
                            Step::Finish(UpgradeResult::UpgradeInProgressWithDifferentId)
                        }
                        _ => Step::Finish(UpgradeResult::Complete),
                    };
                }
                Ok(Reply::Pending(ms)) => {
                    if let Some(step) = self.wait_pending(&mut polls, ms, Phase::Verification).await {
                        return step;
                    }
                }
                Ok(Reply::ConfirmationRequired(code)) => {
                    if let Some(step) = self.confirmation(code, Phase::Verification).await {
                        return step;
                    }
                }
                Ok(Reply::Rejected(code)) => return rejected(CommandId::UpgradeVerify, code),
            }
        }
    }

    /// Hold the phase until the caller answers a device confirmation.
    /// `None` lets the held phase go on.
    async fn confirmation(&self, code: u8, phase: Phase) -> Option<Step> {
        let kind = match ConfirmationKind::from_code(code) {
            Some(kind) => kind,
            None => {
                log::error!("Device raised unknown confirmation 0x{:02X}", code);
                return Some(Step::Abort(ErrorKind::ProtocolRejected { code }));
            }
        };

        let confirmation = Confirmation::new(kind);
        let answer = {
            let mut inner = self.shared.inner.lock().await;
            inner.updated_at = Utc::now();
            inner.broker.raise(confirmation.clone())
        };
        log::info!("Device requests {:?} confirmation during {:?}", kind, phase);
        self.shared.events.emit(CoreEvent::UpgradeNeedsConfirmation {
            device: self.shared.device.clone(),
            session: self.shared.id,
            confirmation,
        });

        let mut cancel_rx = self.cancel_rx.clone();
        let option = tokio::select! {
            answer = answer => match answer {
                Ok(option) => option,
                // withdrawn by cancel
                Err(_) => return Some(Step::Abort(ErrorKind::Cancelled)),
            },
            _ = wait_cancelled(&mut cancel_rx) => {
                self.shared.inner.lock().await.broker.discard();
                return Some(Step::Abort(ErrorKind::Cancelled));
            }
        };

        let payload = vec![kind.code(), option.code()];
        match self.request(CommandId::UpgradeConfirm, payload).await {
            Err(interrupt) => return Some(interrupted(interrupt, phase)),
            Ok(Reply::Rejected(code)) => return Some(rejected(CommandId::UpgradeConfirm, code)),
            Ok(_) => {}
        }

        match option {
            option if option.terminates() => Some(Step::Abort(ErrorKind::Cancelled)),
            UpgradeOption::SilentCommit => Some(Step::Finish(UpgradeResult::SilentCommit)),
            _ => None,
        }
    }

    async fn request(&self, command: CommandId, payload: Vec<u8>) -> std::result::Result<Reply, Interrupt> {
        self.request_with(command, payload, self.settings.chunk_retry_limit).await
    }

    /// One request with up to `attempts` tries on transient failures.
    ///
    /// A dead link, or retries running out, is reported as `LinkLost`.
    async fn request_with(
        &self,
        command: CommandId,
        payload: Vec<u8>,
        attempts: u32,
    ) -> std::result::Result<Reply, Interrupt> {
        let mut attempt = 0;
        loop {
            if *self.cancel_rx.borrow() {
                return Err(Interrupt::Cancelled);
            }
            attempt += 1;

            let protocol = Arc::clone(&self.protocol);
            let mut cancel_rx = self.cancel_rx.clone();
            let outcome = tokio::select! {
                result = async { protocol.lock().await.exchange(command, payload.clone()).await } => result,
                _ = wait_cancelled(&mut cancel_rx) => return Err(Interrupt::Cancelled),
            };

            match outcome {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_link_down() => return Err(Interrupt::LinkLost(e.to_string())),
                Err(e) if attempt < attempts => {
                    log::warn!("{:?} attempt {}/{} failed: {}, retrying", command, attempt, attempts, e);
                }
                Err(e) => {
                    log::warn!("{:?} failed after {} attempts: {}", command, attempt, e);
                    return Err(Interrupt::LinkLost(e.to_string()));
                }
            }
        }
    }

    /// Back off after a "busy" reply. Gives a step when the session must end.
    async fn wait_pending(&self, polls: &mut u32, retry_after_ms: u16, phase: Phase) -> Option<Step> {
        *polls += 1;
        if *polls > self.settings.validation_poll_limit {
            log::error!("Device still busy during {:?} after {} polls", phase, polls);
            let kind = match phase {
                Phase::Validation => ErrorKind::ValidationTimeout,
                _ => ErrorKind::BusyTimeout,
            };
            return Some(Step::Abort(kind));
        }
        if !self.pause(Duration::from_millis(retry_after_ms as u64)).await {
            return Some(Step::Abort(ErrorKind::Cancelled));
        }
        None
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        let mut cancel_rx = self.cancel_rx.clone();
        tokio::select! {
            _ = sleep(delay) => true,
            _ = wait_cancelled(&mut cancel_rx) => false,
        }
    }

    async fn wait_for_link_down(&self) {
        let mut link_state = self.protocol.lock().await.link_state();
        let wait = async move {
            while *link_state.borrow_and_update() {
                if link_state.changed().await.is_err() {
                    break;
                }
            }
        };
        if timeout(self.settings.operation_timeout(), wait).await.is_err() {
            log::debug!("Link to {} stayed up after reboot request", self.shared.device);
        }
    }

    /// Reopen the link, retrying every `reconnect_interval` until `budget` is spent.
    async fn reconnect_within(&self, budget: Duration) -> std::result::Result<(), ErrorKind> {
        let deadline = Instant::now() + budget;
        let mut attempt = 0u32;

        loop {
            if *self.cancel_rx.borrow() {
                return Err(ErrorKind::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::error!(
                    "Could not reconnect to {} within {:?} ({} attempts)",
                    self.shared.device,
                    budget,
                    attempt
                );
                return Err(ErrorKind::ReconnectTimeout);
            }
            attempt += 1;

            let protocol = Arc::clone(&self.protocol);
            let mut cancel_rx = self.cancel_rx.clone();
            let outcome = tokio::select! {
                result = timeout(remaining, async move { protocol.lock().await.reconnect().await }) => result,
                _ = wait_cancelled(&mut cancel_rx) => return Err(ErrorKind::Cancelled),
            };

            match outcome {
                Ok(Ok(())) => {
                    log::info!("Reconnected to {} after {} attempt(s)", self.shared.device, attempt);
                    self.devices
                        .set_connection_state(&self.shared.device, ConnectionState::Connected)
                        .await;
                    return Ok(());
                }
                Ok(Err(e)) => {
                    log::warn!("Reconnect attempt {} to {} failed: {}", attempt, self.shared.device, e);
                }
                Err(_) => {
                    log::error!("Reconnect to {} timed out after {:?}", self.shared.device, budget);
                    return Err(ErrorKind::ReconnectTimeout);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.pause(self.settings.reconnect_interval().min(remaining)).await {
                return Err(ErrorKind::Cancelled);
            }
        }
    }

    async fn record_progress(&self, acked_bytes: u64) {
        let total = self.shared.image.total_size.max(1);
        let progress = {
            let mut inner = self.shared.inner.lock().await;
            if acked_bytes <= inner.acked_bytes {
                return;
            }
            inner.acked_bytes = acked_bytes;
            let percent = (acked_bytes.min(total) * 100 / total) as u8;
            if percent <= inner.progress {
                return;
            }
            inner.progress = percent;
            inner.updated_at = Utc::now();
            percent
        };

        log::debug!("Upgrade {} progress {}%", self.shared.id, progress);
        self.shared.events.emit(CoreEvent::UpgradeProgress {
            device: self.shared.device.clone(),
            session: self.shared.id,
            progress,
        });
    }

    async fn transition(&self, next: UpgradeState) {
        if self.record_state(next).await {
            self.shared.state_tx.send_replace(next);
        }
    }

    /// Update the state and announce it. Returns `false` if it was already `next`.
    async fn record_state(&self, next: UpgradeState) -> bool {
        {
            let mut inner = self.shared.inner.lock().await;
            if inner.state == next {
                return false;
            }
            log::info!(
                "Upgrade {} on {}: {:?} -> {:?}",
                self.shared.id,
                self.shared.device,
                inner.state,
                next
            );
            inner.state = next;
            inner.updated_at = Utc::now();
        }

        self.shared.events.emit(CoreEvent::UpgradeStateChanged {
            device: self.shared.device.clone(),
            session: self.shared.id,
            state: next,
        });
        true
    }

    async fn finish(&self, result: UpgradeResult) {
        log::info!("Upgrade {} on {} finished: {:?}", self.shared.id, self.shared.device, result);
        self.conclude(UpgradeState::Complete, result).await;
    }

    /// ABORTING, then a best-effort abort notice to the device, then ABORTED.
    async fn abort(&self, kind: ErrorKind) {
        match &kind {
            ErrorKind::Cancelled => log::info!("Upgrade {} on {} cancelled", self.shared.id, self.shared.device),
            other => log::error!("Upgrade {} on {} aborting: {:?}", self.shared.id, self.shared.device, other),
        }
        {
            let mut inner = self.shared.inner.lock().await;
            inner.broker.discard();
            inner.last_error = Some(kind);
        }
        self.transition(UpgradeState::Aborting).await;

        let mut protocol = self.protocol.lock().await;
        if protocol.is_connected() {
            match protocol.exchange(CommandId::UpgradeAbort, Vec::new()).await {
                Ok(_) => log::debug!("Device acknowledged abort"),
                Err(e) => log::warn!("Abort notice to {} failed: {}", self.shared.device, e),
            }
        }
        drop(protocol);

        self.conclude(UpgradeState::Aborted, UpgradeResult::Aborted).await;
    }

    async fn conclude(&self, state: UpgradeState, result: UpgradeResult) {
        let first = {
            let mut inner = self.shared.inner.lock().await;
            inner.broker.discard();
            if inner.result.is_some() {
                false
            } else {
                inner.result = Some(result);
                true
            }
        };

        self.record_state(state).await;
        if first {
            self.shared.events.emit(CoreEvent::UpgradeResult {
                device: self.shared.device.clone(),
                session: self.shared.id,
                result,
            });
        }
        // waiters see the terminal state only once the result is out
        self.shared.state_tx.send_replace(state);
    }
}

fn interrupted(interrupt: Interrupt, phase: Phase) -> Step {
    match interrupt {
        Interrupt::Cancelled => Step::Abort(ErrorKind::Cancelled),
        Interrupt::LinkLost(detail) => Step::LinkLost(phase, detail),
    }
}

fn rejected(command: CommandId, code: u8) -> Step {
    log::error!("Device rejected {:?} with code 0x{:02X}", command, code);
    Step::Abort(ErrorKind::ProtocolRejected { code })
}

async fn wait_cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow_and_update() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_cancelled_sees_flag_set_before_wait() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        timeout(Duration::from_millis(100), wait_cancelled(&mut rx))
            .await
            .unwrap();
    }

    #[test]
    fn test_phase_states() {
        assert_eq!(Phase::Upload.state(), UpgradeState::Upload);
        assert!(!Phase::Verification.state().is_terminal());
    }
}
