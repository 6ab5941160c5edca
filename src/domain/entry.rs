use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CardId, Cents};

pub type EntryId = Uuid;

/// Maximum length of an entry description, in characters.
pub const MAX_DESCRIPTION_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryKind {
    Credit,
    Debit,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Credit => "credit",
            EntryKind::Debit => "debit",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "credit" => Some(EntryKind::Credit),
            "debit" => Some(EntryKind::Debit),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryStatus {
    Pending,
    Completed,
    Failed,
    Reversed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
            EntryStatus::Reversed => "reversed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(EntryStatus::Pending),
            "completed" => Some(EntryStatus::Completed),
            "failed" => Some(EntryStatus::Failed),
            "reversed" => Some(EntryStatus::Reversed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One credit or debit attempt against a card, successful or not.
/// Entries are write-once: corrections are new entries, never edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    /// Store-wide creation order, assigned by the repository
    pub sequence: i64,
    pub reference: String,
    pub card_id: CardId,
    pub kind: EntryKind,
    /// Amount in cents (always positive)
    pub amount: Cents,
    pub description: String,
    pub status: EntryStatus,
    pub balance_before: Option<Cents>,
    pub balance_after: Option<Cents>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    fn finalized(
        card_id: CardId,
        reference: String,
        kind: EntryKind,
        amount: Cents,
        description: String,
        status: EntryStatus,
        balance_before: Cents,
        balance_after: Cents,
    ) -> Self {
        assert!(amount > 0, "Entry amount must be positive");
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            sequence: 0, // Will be set by repository
            reference,
            card_id,
            kind,
            amount,
            description,
            status,
            balance_before: Some(balance_before),
            balance_after: Some(balance_after),
            created_at: now,
            updated_at: now,
        }
    }

    /// A successfully applied movement.
    pub fn completed(
        card_id: CardId,
        reference: String,
        kind: EntryKind,
        amount: Cents,
        description: String,
        balance_before: Cents,
        balance_after: Cents,
    ) -> Self {
        Self::finalized(
            card_id,
            reference,
            kind,
            amount,
            description,
            EntryStatus::Completed,
            balance_before,
            balance_after,
        )
    }

    /// An attempt that was rejected but is kept for audit; the balance is unchanged.
    pub fn failed(
        card_id: CardId,
        reference: String,
        kind: EntryKind,
        amount: Cents,
        description: String,
        balance: Cents,
    ) -> Self {
        Self::finalized(
            card_id,
            reference,
            kind,
            amount,
            description,
            EntryStatus::Failed,
            balance,
            balance,
        )
    }

    pub fn is_completed(&self) -> bool {
        self.status == EntryStatus::Completed
    }

    /// Signed effect of this entry on the card balance (zero unless completed).
    pub fn signed_amount(&self) -> Cents {
        match (self.status, self.kind) {
            (EntryStatus::Completed, EntryKind::Credit) => self.amount,
            (EntryStatus::Completed, EntryKind::Debit) => -self.amount,
            _ => 0,
        }
    }
}

/// An entry decorated with display-safe card details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryView {
    #[serde(flatten)]
    pub entry: LedgerEntry,
    pub card_masked_number: String,
    pub card_holder_name: String,
}

/// Trim and validate a free-text description.
pub fn normalize_description(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.chars().count() > MAX_DESCRIPTION_LEN {
        return None;
    }
    Some(trimmed.to_string())
}
