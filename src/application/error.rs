use std::time::Duration;

use thiserror::Error;

use crate::domain::{format_cents, CardId, Cents, EntryId};
use crate::storage::StoreBusy;

#[derive(Error, Debug)]
pub enum AppError {
    /// The card does not exist, or it is not the caller's.
    #[error("Card not found: {0}")]
    CardNotFound(CardId),

    #[error("Ledger entry not found: {0}")]
    EntryNotFound(EntryId),

    #[error("Card {card_id} cannot be used: {reason}")]
    InvalidState { card_id: CardId, reason: String },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Insufficient funds on card {card_id}: available {}, requested {} (recorded as {reference})", money(.balance), money(.requested))]
    InsufficientFunds {
        card_id: CardId,
        balance: Cents,
        requested: Cents,
        /// Reference of the failed entry kept for audit
        reference: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Could not find a free {what} after {attempts} attempts")]
    ExhaustedRetries { what: &'static str, attempts: u32 },

    #[error("{resource} is busy (waited {waited:?}), retry later")]
    Busy { resource: String, waited: Duration },

    #[error("Ledger integrity violation: {0}")]
    IntegrityViolation(String),

    /// Opaque store failure. A busy store is reported as [`AppError::Busy`] instead.
    #[error("Database error: {0}")]
    Database(anyhow::Error),
}

fn money(cents: &Cents) -> String {
    format_cents(*cents)
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(busy) = err.downcast_ref::<StoreBusy>() {
            return AppError::Busy {
                resource: "database".to_string(),
                waited: busy.waited,
            };
        }
        AppError::Database(err)
    }
}

impl AppError {
    /// Whether the same call may succeed if simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Busy { .. })
    }
}
