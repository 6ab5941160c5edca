use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{Card, CardStatus, Cents, EntryKind, LedgerEntry, UserId};

/// Per-user aggregate of cards and completed ledger entries.
/// It is a cache: it can always be rebuilt with [`compute_rollup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRollup {
    pub user_id: UserId,
    pub total_balance: Cents,
    pub total_cards: i64,
    pub active_cards: i64,
    /// Completed entries only
    pub total_transactions: i64,
    pub total_credited: Cents,
    pub total_debited: Cents,
    pub last_transaction_at: Option<DateTime<Utc>>,
    /// Last change in the underlying cards or entries
    pub updated_at: DateTime<Utc>,
}

/// Rebuild a user's rollup from scratch.
///
/// `entries` may contain any status and any order; only completed entries
/// count, and the most recent one is picked by sequence. The result depends
/// on its inputs and `today` only, so recomputing without intervening
/// activity yields an identical value.
pub fn compute_rollup(
    user_id: &UserId,
    cards: &[Card],
    entries: &[LedgerEntry],
    today: NaiveDate,
) -> AccountRollup {
    let total_balance = cards.iter().map(|c| c.balance).sum();
    let active_cards = cards
        .iter()
        .filter(|c| c.effective_status(today) == CardStatus::Active)
        .count() as i64;

    let completed: Vec<&LedgerEntry> = entries.iter().filter(|e| e.is_completed()).collect();

    let sum_kind = |kind: EntryKind| -> Cents {
        completed
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.amount)
            .sum()
    };

    let last_transaction_at = completed
        .iter()
        .max_by_key(|e| e.sequence)
        .map(|e| e.created_at);

    let updated_at = cards
        .iter()
        .map(|c| c.updated_at)
        .chain(entries.iter().map(|e| e.created_at))
        .max()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    AccountRollup {
        user_id: user_id.clone(),
        total_balance,
        total_cards: cards.len() as i64,
        active_cards,
        total_transactions: completed.len() as i64,
        total_credited: sum_kind(EntryKind::Credit),
        total_debited: sum_kind(EntryKind::Debit),
        last_transaction_at,
        updated_at,
    }
}
