use chrono::NaiveDate;

use super::{Card, CardStatus};

/// Caller-invoked status changes. Expiry is never an action: it follows from
/// the expiry date alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAction {
    Block,
    Unblock,
}

impl std::fmt::Display for StatusAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusAction::Block => write!(f, "block"),
            StatusAction::Unblock => write!(f, "unblock"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    Expired,
    NotBlocked,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionError::Expired => write!(f, "card has expired"),
            TransitionError::NotBlocked => write!(f, "only blocked cards can be unblocked"),
        }
    }
}

impl std::error::Error for TransitionError {}

/// Resolve the stored status a card moves to under `action`.
///
/// - block: any non-expired card becomes `Blocked` (re-blocking is accepted).
/// - unblock: only a non-expired `Blocked` card becomes `Active`.
pub fn transition(
    card: &Card,
    action: StatusAction,
    today: NaiveDate,
) -> Result<CardStatus, TransitionError> {
    match action {
        StatusAction::Block => {
            if card.is_expired(today) {
                return Err(TransitionError::Expired);
            }
            Ok(CardStatus::Blocked)
        }
        StatusAction::Unblock => {
            if card.status != CardStatus::Blocked {
                return Err(TransitionError::NotBlocked);
            }
            if card.is_expired(today) {
                return Err(TransitionError::Expired);
            }
            Ok(CardStatus::Active)
        }
    }
}

/// Whether a card may take ledger movements right now.
pub fn ensure_transactable(card: &Card, today: NaiveDate) -> Result<(), CardStatus> {
    match card.effective_status(today) {
        CardStatus::Active => Ok(()),
        other => Err(other),
    }
}
