use tokio::sync::oneshot;

use super::models::{Confirmation, UpgradeError, UpgradeOption};

struct PendingConfirmation {
    confirmation: Confirmation,
    responder: oneshot::Sender<UpgradeOption>,
}

/// Holds the one outstanding confirmation of a session.
///
/// The session suspends on the receiver returned by [`raise`](Self::raise);
/// [`resolve`](Self::resolve) wakes it with the chosen option, while
/// [`discard`](Self::discard) drops the responder so the session sees the
/// confirmation withdrawn.
#[derive(Default)]
pub struct ConfirmationBroker {
    pending: Option<PendingConfirmation>,
}

impl ConfirmationBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&mut self, confirmation: Confirmation) -> oneshot::Receiver<UpgradeOption> {
        let (responder, receiver) = oneshot::channel();
        if let Some(stale) = self.pending.replace(PendingConfirmation { confirmation, responder }) {
            log::warn!("Replacing unanswered {:?} confirmation", stale.confirmation.kind);
        }
        receiver
    }

    pub fn pending(&self) -> Option<&Confirmation> {
        self.pending.as_ref().map(|p| &p.confirmation)
    }

    /// Answer the pending confirmation.
    ///
    /// An option outside the allowed set is rejected and the confirmation
    /// stays pending.
    pub fn resolve(&mut self, option: UpgradeOption) -> Result<Confirmation, UpgradeError> {
        let pending = self.pending.as_ref().ok_or(UpgradeError::NoConfirmationPending)?;
        if !pending.confirmation.allows(option) {
            return Err(UpgradeError::InvalidOption(option));
        }

        let pending = self.pending.take().ok_or(UpgradeError::NoConfirmationPending)?;
        if pending.responder.send(option).is_err() {
            return Err(UpgradeError::NoConfirmationPending);
        }
        Ok(pending.confirmation)
    }

    pub fn discard(&mut self) -> Option<Confirmation> {
        self.pending.take().map(|p| p.confirmation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::ConfirmationKind;

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let mut broker = ConfirmationBroker::new();
        let receiver = broker.raise(Confirmation::new(ConfirmationKind::Commit));
        assert_eq!(broker.pending().unwrap().kind, ConfirmationKind::Commit);

        broker.resolve(UpgradeOption::Confirm).unwrap();
        assert!(broker.pending().is_none());
        assert_eq!(receiver.await.unwrap(), UpgradeOption::Confirm);
    }

    #[test]
    fn test_invalid_option_keeps_confirmation() {
        let mut broker = ConfirmationBroker::new();
        let _receiver = broker.raise(Confirmation::new(ConfirmationKind::BatteryLowOnDevice));
        assert!(matches!(
            broker.resolve(UpgradeOption::Confirm),
            Err(UpgradeError::InvalidOption(UpgradeOption::Confirm))
        ));
        assert!(broker.pending().is_some());
    }

    #[tokio::test]
    async fn test_discard_withdraws() {
        let mut broker = ConfirmationBroker::new();
        let receiver = broker.raise(Confirmation::new(ConfirmationKind::InProgress));
        assert!(broker.discard().is_some());
        assert!(receiver.await.is_err());
        assert!(matches!(
            broker.resolve(UpgradeOption::Cancel),
            Err(UpgradeError::NoConfirmationPending)
        ));
    }
}
