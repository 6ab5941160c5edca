use super::{Cents, EntryKind, LedgerEntry, MAX_BALANCE_CENTS};

/// What applying a movement to a balance would do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The movement fits; this is the new balance.
    Applied { balance_after: Cents },
    /// Debit larger than the balance. The balance must stay as it is.
    InsufficientFunds,
    /// Credit would push the balance past what the balance field can hold.
    ExceedsPrecision,
}

/// Compute the outcome of applying `amount` of `kind` to `balance`.
/// `amount` must already be validated as positive.
pub fn settle(balance: Cents, kind: EntryKind, amount: Cents) -> Settlement {
    match kind {
        EntryKind::Credit => match balance.checked_add(amount) {
            Some(after) if after <= MAX_BALANCE_CENTS => Settlement::Applied {
                balance_after: after,
            },
            _ => Settlement::ExceedsPrecision,
        },
        EntryKind::Debit if amount > balance => Settlement::InsufficientFunds,
        EntryKind::Debit => Settlement::Applied {
            balance_after: balance - amount,
        },
    }
}

/// Replay completed entries (in creation order) on top of an opening balance.
pub fn replay_balance(opening: Cents, entries: &[LedgerEntry]) -> Cents {
    entries
        .iter()
        .fold(opening, |balance, entry| balance + entry.signed_amount())
}

/// A break in the chain of completed entries for one card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// `balance_after` does not equal `balance_before ± amount`.
    Arithmetic { reference: String },
    /// A failed entry moved the balance.
    FailedEntryMoved { reference: String },
    /// Consecutive completed entries do not line up.
    Gap {
        previous: String,
        next: String,
        previous_after: Option<Cents>,
        next_before: Option<Cents>,
    },
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Arithmetic { reference } => {
                write!(f, "entry {} has inconsistent balances", reference)
            }
            ChainError::FailedEntryMoved { reference } => {
                write!(f, "failed entry {} changed the balance", reference)
            }
            ChainError::Gap {
                previous,
                next,
                previous_after,
                next_before,
            } => write!(
                f,
                "entry {} ends at {:?} but {} starts at {:?}",
                previous, previous_after, next, next_before
            ),
        }
    }
}

impl std::error::Error for ChainError {}

/// Check the audit invariants of one card's entries, given in creation order:
/// every completed entry's arithmetic holds, failed entries are no-ops, and
/// each completed entry starts where the previous completed one ended.
pub fn verify_entry_chain(entries: &[LedgerEntry]) -> Result<(), ChainError> {
    let mut previous: Option<&LedgerEntry> = None;

    for entry in entries {
        if entry.is_completed() {
            let expected = entry.balance_before.map(|b| b + entry.signed_amount());
            if expected.is_none() || expected != entry.balance_after {
                return Err(ChainError::Arithmetic {
                    reference: entry.reference.clone(),
                });
            }
            if let Some(prev) = previous {
                if prev.balance_after != entry.balance_before {
                    return Err(ChainError::Gap {
                        previous: prev.reference.clone(),
                        next: entry.reference.clone(),
                        previous_after: prev.balance_after,
                        next_before: entry.balance_before,
                    });
                }
            }
            previous = Some(entry);
        } else if entry.balance_before != entry.balance_after {
            return Err(ChainError::FailedEntryMoved {
                reference: entry.reference.clone(),
            });
        }
    }

    Ok(())
}
