use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::info;

use crate::domain::{
    default_expiry, format_cents, generate_card_number, generate_cvv, normalize_holder_name,
    replay_balance, verify_entry_chain, AccountRollup, Card, CardId, CardStatus, CardView, Cents,
    EntryId, EntryKind, EntryStatus, EntryView, LedgerEntry, RetryBudget, UserId,
    MAX_BALANCE_CENTS,
};
use crate::storage::{KeyedLocks, Repository};

use super::{
    AccountAggregator, AppError, CommitEvent, LedgerConfig, LedgerEngine, LifecycleManager,
};

/// Application service providing high-level operations on cards.
/// This is the primary interface for any client (CLI, API, ...).
///
/// Every call takes the caller's identity; cards and entries of other users
/// are reported as not found.
pub struct CardService {
    repo: Arc<Repository>,
    card_locks: Arc<KeyedLocks<CardId>>,
    engine: LedgerEngine,
    lifecycle: LifecycleManager,
    aggregator: Arc<AccountAggregator>,
    config: LedgerConfig,
}

/// Request to issue a card
#[derive(Debug, Clone, Default)]
pub struct NewCard {
    pub holder_name: String,
    pub initial_balance: Cents,
    /// Defaults to `card_validity_days` from today
    pub expiry_date: Option<NaiveDate>,
}

/// Filter for querying a user's entries
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryFilter {
    pub status: Option<EntryStatus>,
    pub kind: Option<EntryKind>,
}

/// Outcome of a successful card audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub card_id: CardId,
    pub balance: Cents,
    pub completed_entries: usize,
    pub failed_entries: usize,
}

impl CardService {
    /// Create a new card service with the given repository.
    pub fn new(repo: Repository, config: LedgerConfig) -> Self {
        let repo = Arc::new(repo);
        let card_locks = Arc::new(KeyedLocks::new());
        let aggregator = Arc::new(AccountAggregator::new(repo.clone(), config.lock_timeout));
        let engine = LedgerEngine::new(
            repo.clone(),
            card_locks.clone(),
            aggregator.clone(),
            config.clone(),
        );
        let lifecycle = LifecycleManager::new(
            repo.clone(),
            card_locks.clone(),
            aggregator.clone(),
            config.lock_timeout,
        );

        Self {
            repo,
            card_locks,
            engine,
            lifecycle,
            aggregator,
            config,
        }
    }

    /// Initialize a new database at the given path.
    pub async fn init(database_path: &str, config: LedgerConfig) -> Result<Self, AppError> {
        let db_url = format!("sqlite:{}?mode=rwc", database_path);
        let repo = Repository::init(&db_url, config.busy_timeout).await?;
        Ok(Self::new(repo, config))
    }

    /// Connect to an existing database.
    pub async fn connect(database_path: &str, config: LedgerConfig) -> Result<Self, AppError> {
        let db_url = format!("sqlite:{}", database_path);
        let repo = Repository::connect(&db_url, config.busy_timeout).await?;
        Ok(Self::new(repo, config))
    }

    // ========================
    // Card operations
    // ========================

    /// Issue a new card to `caller`.
    pub async fn create_card(&self, caller: &UserId, new_card: NewCard) -> Result<CardView, AppError> {
        self.issue_card(caller, new_card, || {
            generate_card_number(&mut rand::thread_rng())
        })
        .await
    }

    async fn issue_card<F>(
        &self,
        caller: &UserId,
        new_card: NewCard,
        mut sample_number: F,
    ) -> Result<CardView, AppError>
    where
        F: FnMut() -> String + Send,
    {
        let holder_name = normalize_holder_name(&new_card.holder_name).ok_or_else(|| {
            AppError::InvalidInput("Holder name must be 3 to 100 characters".to_string())
        })?;
        if !(0..=MAX_BALANCE_CENTS).contains(&new_card.initial_balance) {
            return Err(AppError::InvalidAmount(format!(
                "Initial balance must be between 0.00 and {}",
                format_cents(MAX_BALANCE_CENTS)
            )));
        }

        let today = Utc::now().date_naive();
        let expiry_date = new_card
            .expiry_date
            .unwrap_or_else(|| default_expiry(today, self.config.card_validity_days));

        let mut budget = RetryBudget::new(self.config.id_retry_limit);
        let card_number = loop {
            budget
                .attempt()
                .map_err(|exhausted| AppError::ExhaustedRetries {
                    what: "card number",
                    attempts: exhausted.attempts,
                })?;
            let candidate = sample_number();
            if !self.repo.card_number_exists(&candidate).await? {
                break candidate;
            }
        };
        let cvv = generate_cvv(&mut rand::thread_rng());

        let card = Card::issue(
            caller.clone(),
            card_number,
            cvv,
            holder_name,
            expiry_date,
            new_card.initial_balance,
        );
        self.repo.insert_card(&card).await?;

        info!(
            card_id = %card.id,
            user = %caller,
            balance = %format_cents(card.balance),
            expiry = %card.expiry_date,
            "card issued"
        );

        self.aggregator
            .on_commit(&CommitEvent::CardIssued {
                user_id: caller.clone(),
                card_id: card.id,
            })
            .await;

        Ok(card.view(today))
    }

    async fn owned_card(&self, caller: &UserId, card_id: CardId) -> Result<Card, AppError> {
        self.repo
            .get_card(card_id)
            .await?
            .filter(|card| card.is_owned_by(caller))
            .ok_or(AppError::CardNotFound(card_id))
    }

    /// Get one of the caller's cards.
    pub async fn get_card(&self, caller: &UserId, card_id: CardId) -> Result<CardView, AppError> {
        let card = self.owned_card(caller, card_id).await?;
        Ok(card.view(Utc::now().date_naive()))
    }

    /// List the caller's cards, newest first, optionally by effective status.
    pub async fn list_cards(
        &self,
        caller: &UserId,
        status: Option<CardStatus>,
    ) -> Result<Vec<CardView>, AppError> {
        let today = Utc::now().date_naive();
        Ok(self
            .repo
            .list_cards_for_user(caller)
            .await?
            .iter()
            .map(|card| card.view(today))
            .filter(|view| status.is_none_or(|s| view.status == s))
            .collect())
    }

    pub async fn block_card(&self, caller: &UserId, card_id: CardId) -> Result<CardView, AppError> {
        let card = self.lifecycle.block(caller, card_id).await?;
        Ok(card.view(Utc::now().date_naive()))
    }

    pub async fn unblock_card(
        &self,
        caller: &UserId,
        card_id: CardId,
    ) -> Result<CardView, AppError> {
        let card = self.lifecycle.unblock(caller, card_id).await?;
        Ok(card.view(Utc::now().date_naive()))
    }

    // ========================
    // Ledger operations
    // ========================

    /// Credit or debit one of the caller's cards.
    pub async fn process_transaction(
        &self,
        caller: &UserId,
        card_id: CardId,
        kind: EntryKind,
        amount: Cents,
        description: &str,
    ) -> Result<LedgerEntry, AppError> {
        self.engine
            .apply_as(caller, card_id, kind, amount, description)
            .await
    }

    /// Entries of one of the caller's cards, in creation order.
    pub async fn list_card_entries(
        &self,
        caller: &UserId,
        card_id: CardId,
        status: Option<EntryStatus>,
    ) -> Result<Vec<EntryView>, AppError> {
        let card = self.owned_card(caller, card_id).await?;
        let entries = self.repo.list_entries_for_card(card_id, status).await?;
        Ok(entries
            .into_iter()
            .map(|entry| decorate(entry, &card))
            .collect())
    }

    /// Entries across all of the caller's cards, in creation order.
    pub async fn list_entries(
        &self,
        caller: &UserId,
        filter: EntryFilter,
    ) -> Result<Vec<EntryView>, AppError> {
        let cards: HashMap<CardId, Card> = self
            .repo
            .list_cards_for_user(caller)
            .await?
            .into_iter()
            .map(|card| (card.id, card))
            .collect();
        let entries = self
            .repo
            .list_entries_for_user(caller, filter.status, filter.kind)
            .await?;

        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let card = cards.get(&entry.card_id)?;
                Some(decorate(entry, card))
            })
            .collect())
    }

    pub async fn get_entry(&self, caller: &UserId, entry_id: EntryId) -> Result<EntryView, AppError> {
        let entry = self
            .repo
            .get_entry(entry_id)
            .await?
            .ok_or(AppError::EntryNotFound(entry_id))?;
        let card = self
            .owned_card(caller, entry.card_id)
            .await
            .map_err(|e| match e {
                AppError::CardNotFound(_) => AppError::EntryNotFound(entry_id),
                other => other,
            })?;
        Ok(decorate(entry, &card))
    }

    // ========================
    // Account summary
    // ========================

    pub async fn account_summary(&self, caller: &UserId) -> Result<AccountRollup, AppError> {
        self.aggregator.rollup(caller).await
    }

    pub async fn refresh_summary(&self, caller: &UserId) -> Result<AccountRollup, AppError> {
        self.aggregator.refresh(caller).await
    }

    // ========================
    // Audit
    // ========================

    /// Check that a card's entries chain and replay to the stored balance.
    ///
    /// Ownership is checked first; the card is then re-read under the card
    /// lock so no movement lands between reading it and reading its entries.
    pub async fn audit_card(&self, caller: &UserId, card_id: CardId) -> Result<AuditReport, AppError> {
        self.owned_card(caller, card_id).await?;

        let _guard = self
            .card_locks
            .acquire(&card_id, self.config.lock_timeout)
            .await
            .map_err(|timeout| AppError::Busy {
                resource: format!("card {}", card_id),
                waited: timeout.waited,
            })?;

        let card = self.owned_card(caller, card_id).await?;
        let entries = self.repo.list_entries_for_card(card_id, None).await?;

        verify_entry_chain(&entries).map_err(|e| AppError::IntegrityViolation(e.to_string()))?;

        let completed: Vec<&LedgerEntry> = entries.iter().filter(|e| e.is_completed()).collect();
        let opening = completed
            .first()
            .and_then(|first| first.balance_before)
            .unwrap_or(card.balance);
        let replayed = replay_balance(opening, &entries);
        if replayed != card.balance {
            return Err(AppError::IntegrityViolation(format!(
                "card balance {} does not match replayed entries ({})",
                format_cents(card.balance),
                format_cents(replayed)
            )));
        }

        Ok(AuditReport {
            card_id,
            balance: card.balance,
            completed_entries: completed.len(),
            failed_entries: entries
                .iter()
                .filter(|e| e.status == EntryStatus::Failed)
                .count(),
        })
    }
}

fn decorate(entry: LedgerEntry, card: &Card) -> EntryView {
    EntryView {
        entry,
        card_masked_number: card.masked_number(),
        card_holder_name: card.holder_name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    async fn service() -> (CardService, TempDir) {
        service_with(LedgerConfig::default()).await
    }

    async fn service_with(config: LedgerConfig) -> (CardService, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let service = CardService::init(db_path.to_str().unwrap(), config)
            .await
            .unwrap();
        (service, temp_dir)
    }

    fn new_card(balance: Cents) -> NewCard {
        NewCard {
            holder_name: "alice smith".into(),
            initial_balance: balance,
            expiry_date: None,
        }
    }

    #[tokio::test]
    async fn test_card_number_collisions_exhaust_retries() {
        let (service, _temp) = service().await;
        let alice = UserId::new("alice");
        let view = service.create_card(&alice, new_card(0)).await.unwrap();
        let taken = service.repo.get_card(view.id).await.unwrap().unwrap().card_number;

        let err = service
            .issue_card(&alice, new_card(0), || taken.clone())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::ExhaustedRetries {
                what: "card number",
                attempts: 256
            }
        ));
        assert_eq!(service.list_cards(&alice, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_card_number_resampled_after_collision() {
        let (service, _temp) = service().await;
        let alice = UserId::new("alice");
        let view = service.create_card(&alice, new_card(0)).await.unwrap();
        let taken = service.repo.get_card(view.id).await.unwrap().unwrap().card_number;

        let mut samples = vec!["4000000000000002".to_string(), taken].into_iter();
        let second = service
            .issue_card(&alice, new_card(0), || samples.next_back().unwrap())
            .await
            .unwrap();
        assert_eq!(second.masked_number, "XXXX-XXXX-XXXX-0002");
    }

    #[tokio::test]
    async fn test_issuance_normalizes_holder_and_defaults_expiry() {
        let (service, _temp) = service().await;
        let view = service
            .create_card(&UserId::new("alice"), new_card(100000))
            .await
            .unwrap();
        assert_eq!(view.holder_name, "ALICE SMITH");
        assert_eq!(view.status, CardStatus::Active);
        assert_eq!(
            view.expiry_date,
            default_expiry(Utc::now().date_naive(), 365 * 3)
        );
    }

    #[tokio::test]
    async fn test_audit_of_foreign_card_does_not_wait_for_lock() {
        let config = LedgerConfig::default().with_lock_timeout(std::time::Duration::from_millis(50));
        let (service, _temp) = service_with(config).await;
        let alice = UserId::new("alice");
        let card = service.create_card(&alice, new_card(1000)).await.unwrap();

        let _held = service
            .card_locks
            .acquire(&card.id, std::time::Duration::from_secs(1))
            .await
            .unwrap();
        let err = service
            .audit_card(&UserId::new("bob"), card.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CardNotFound(id) if id == card.id));

        let err = service.audit_card(&alice, card.id).await.unwrap_err();
        assert!(matches!(err, AppError::Busy { .. }));
    }

    #[tokio::test]
    async fn test_audit_detects_balance_drift() {
        let (service, _temp) = service().await;
        let alice = UserId::new("alice");
        let card = service.create_card(&alice, new_card(1000)).await.unwrap();
        service
            .process_transaction(&alice, card.id, EntryKind::Credit, 500, "")
            .await
            .unwrap();
        let report = service.audit_card(&alice, card.id).await.unwrap();
        assert_eq!(report.balance, 1500);
        assert_eq!(report.completed_entries, 1);

        // Balance rewritten behind the ledger's back
        let mut tx = service.repo.begin().await.unwrap();
        Repository::set_card_balance(&mut tx, card.id, 9999, Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let err = service.audit_card(&alice, card.id).await.unwrap_err();
        assert!(matches!(err, AppError::IntegrityViolation(_)));
    }
}
