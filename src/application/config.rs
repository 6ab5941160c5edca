use std::time::Duration;

use crate::domain::Cents;

/// Tunables of the ledger core.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Largest single credit or debit, in cents
    pub max_amount: Cents,
    /// How long a caller waits for a card (or rollup) lock before giving up with `Busy`
    pub lock_timeout: Duration,
    /// How long a connection waits on SQLite's own write lock
    pub busy_timeout: Duration,
    /// Attempts at finding an unused card number or entry reference
    pub id_retry_limit: u32,
    /// Validity of a newly issued card when no expiry is given
    pub card_validity_days: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_amount: 100_000_000,
            lock_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
            id_retry_limit: 256,
            card_validity_days: 365 * 3,
        }
    }
}

impl LedgerConfig {
    pub fn with_max_amount(mut self, max_amount: Cents) -> Self {
        self.max_amount = max_amount;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_id_retry_limit(mut self, limit: u32) -> Self {
        self.id_retry_limit = limit;
        self
    }

    pub fn with_card_validity_days(mut self, days: u64) -> Self {
        self.card_validity_days = days;
        self
    }
}
