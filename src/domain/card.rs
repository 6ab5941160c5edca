use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Cents;

pub type CardId = Uuid;

/// Identity of an already-authenticated caller. The ledger never interprets
/// it beyond equality: it is whatever the authentication layer hands over.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Card status. Only `Active` and `Blocked` are ever stored; `Expired` is
/// derived from the expiry date (see [`Card::effective_status`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CardStatus {
    Active,
    Blocked,
    Expired,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::Active => "active",
            CardStatus::Blocked => "blocked",
            CardStatus::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(CardStatus::Active),
            "blocked" => Some(CardStatus::Blocked),
            "expired" => Some(CardStatus::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for CardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A virtual payment card.
///
/// The full card number and CVV are write-once internal fields and are never
/// serialized; use [`CardView`] for anything shown to a user.
#[derive(Debug, Clone, Serialize)]
pub struct Card {
    pub id: CardId,
    pub user_id: UserId,
    #[serde(skip)]
    pub card_number: String,
    #[serde(skip)]
    pub cvv: String,
    pub holder_name: String,
    pub expiry_date: NaiveDate,
    pub balance: Cents,
    /// Stored status flag, never `Expired`.
    pub status: CardStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Card {
    /// Build a freshly issued card. Identifier generation happens in the
    /// application layer, which has to check uniqueness against the store.
    pub fn issue(
        user_id: UserId,
        card_number: String,
        cvv: String,
        holder_name: String,
        expiry_date: NaiveDate,
        initial_balance: Cents,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            card_number,
            cvv,
            holder_name,
            expiry_date,
            balance: initial_balance,
            status: CardStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expiry_date < today
    }

    /// Status as callers see it: an expired card is `Expired` whatever its stored flag says.
    pub fn effective_status(&self, today: NaiveDate) -> CardStatus {
        if self.is_expired(today) {
            CardStatus::Expired
        } else {
            self.status
        }
    }

    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        &self.user_id == user_id
    }

    pub fn masked_number(&self) -> String {
        mask_card_number(&self.card_number)
    }

    pub fn view(&self, today: NaiveDate) -> CardView {
        CardView {
            id: self.id,
            user_id: self.user_id.clone(),
            masked_number: self.masked_number(),
            holder_name: self.holder_name.clone(),
            expiry_date: self.expiry_date,
            balance: self.balance,
            status: self.effective_status(today),
            is_expired: self.is_expired(today),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Display-safe projection of a [`Card`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardView {
    pub id: CardId,
    pub user_id: UserId,
    pub masked_number: String,
    pub holder_name: String,
    pub expiry_date: NaiveDate,
    pub balance: Cents,
    pub status: CardStatus,
    pub is_expired: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mask all but the last four digits: `XXXX-XXXX-XXXX-1234`.
pub fn mask_card_number(card_number: &str) -> String {
    let digits: Vec<char> = card_number.chars().collect();
    let last_four: String = digits[digits.len().saturating_sub(4)..].iter().collect();
    format!("XXXX-XXXX-XXXX-{}", last_four)
}

/// Default expiry for a card issued on `issued_on`.
pub fn default_expiry(issued_on: NaiveDate, validity_days: u64) -> NaiveDate {
    issued_on
        .checked_add_days(Days::new(validity_days))
        .unwrap_or(NaiveDate::MAX)
}

/// Trim, validate and upper-case a card holder name.
pub fn normalize_holder_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.chars().count() < 3 || trimmed.chars().count() > 100 {
        return None;
    }
    Some(trimmed.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn sample_card(expiry: &str) -> Card {
        Card::issue(
            UserId::new("alice"),
            "4000123412341234".into(),
            "123".into(),
            "ALICE SMITH".into(),
            date(expiry),
            100000,
        )
    }

    #[test]
    fn test_card_status_roundtrip() {
        for status in [CardStatus::Active, CardStatus::Blocked, CardStatus::Expired] {
            assert_eq!(CardStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(CardStatus::from_str("ACTIVE"), Some(CardStatus::Active));
        assert_eq!(CardStatus::from_str("frozen"), None);
    }

    #[test]
    fn test_new_card_is_active() {
        let card = sample_card("2030-01-01");
        assert_eq!(card.status, CardStatus::Active);
        assert_eq!(card.balance, 100000);
    }

    #[test]
    fn test_expiry_is_derived_from_date() {
        let mut card = sample_card("2025-06-30");
        assert!(!card.is_expired(date("2025-06-30")));
        assert!(card.is_expired(date("2025-07-01")));

        card.status = CardStatus::Blocked;
        assert_eq!(card.effective_status(date("2025-06-01")), CardStatus::Blocked);
        assert_eq!(card.effective_status(date("2025-07-01")), CardStatus::Expired);
    }

    #[test]
    fn test_masked_number() {
        let card = sample_card("2030-01-01");
        assert_eq!(card.masked_number(), "XXXX-XXXX-XXXX-1234");
    }

    #[test]
    fn test_view_hides_full_number_and_cvv() {
        let card = sample_card("2030-01-01");
        let json = serde_json::to_string(&card.view(date("2026-01-01"))).unwrap();
        assert!(!json.contains("4000123412341234"));
        assert!(!json.contains("\"cvv\""));
        assert!(json.contains("XXXX-XXXX-XXXX-1234"));

        let raw = serde_json::to_string(&card).unwrap();
        assert!(!raw.contains("4000123412341234"));
    }

    #[test]
    fn test_default_expiry_is_three_years_of_days() {
        assert_eq!(default_expiry(date("2025-01-01"), 1095), date("2028-01-01"));
    }

    #[test]
    fn test_normalize_holder_name() {
        assert_eq!(normalize_holder_name("  jane doe "), Some("JANE DOE".into()));
        assert_eq!(normalize_holder_name("jo"), None);
        assert_eq!(normalize_holder_name("    "), None);
    }
}
