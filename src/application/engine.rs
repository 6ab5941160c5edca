//! The ledger mutation engine.
//!
//! Every movement on a card runs as one unit of work:
//!
//! 1. take the card's in-process lock (bounded wait, `Busy` on timeout)
//! 2. open a store transaction whose first statement write-locks the card row
//! 3. check ownership, status and expiry against that fresh row, then the amount
//! 4. write the new balance and the entry, or only a failed entry
//! 5. commit, release the lock, then notify the aggregator
//!
//! Dropping the returned future before step 5 drops the transaction, which
//! rolls it back; nothing is half-applied.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, info, warn};

use crate::domain::{
    ensure_transactable, format_cents, generate_reference, normalize_description, settle, CardId,
    Cents, EntryKind, LedgerEntry, RetryBudget, Settlement, UserId, MAX_DESCRIPTION_LEN,
};
use crate::storage::{KeyedLocks, Repository};

use super::{AccountAggregator, AppError, CommitEvent, LedgerConfig};

pub struct LedgerEngine {
    repo: Arc<Repository>,
    card_locks: Arc<KeyedLocks<CardId>>,
    aggregator: Arc<AccountAggregator>,
    config: LedgerConfig,
}

impl LedgerEngine {
    pub fn new(
        repo: Arc<Repository>,
        card_locks: Arc<KeyedLocks<CardId>>,
        aggregator: Arc<AccountAggregator>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            repo,
            card_locks,
            aggregator,
            config,
        }
    }

    /// Apply a credit or debit to a card, whoever owns it.
    ///
    /// Returns the completed entry. A debit larger than the balance records a
    /// failed entry and returns [`AppError::InsufficientFunds`].
    pub async fn apply(
        &self,
        card_id: CardId,
        kind: EntryKind,
        amount: Cents,
        description: &str,
    ) -> Result<LedgerEntry, AppError> {
        self.execute(None, card_id, kind, amount, description).await
    }

    /// Same as [`LedgerEngine::apply`], but a card not owned by `caller` is reported as not found.
    pub async fn apply_as(
        &self,
        caller: &UserId,
        card_id: CardId,
        kind: EntryKind,
        amount: Cents,
        description: &str,
    ) -> Result<LedgerEntry, AppError> {
        self.execute(Some(caller), card_id, kind, amount, description)
            .await
    }

    fn validate_amount(&self, amount: Cents) -> Result<(), AppError> {
        if amount <= 0 {
            return Err(AppError::InvalidAmount(
                "Amount must be positive".to_string(),
            ));
        }
        if amount > self.config.max_amount {
            return Err(AppError::InvalidAmount(format!(
                "Amount {} exceeds the maximum of {}",
                format_cents(amount),
                format_cents(self.config.max_amount)
            )));
        }
        Ok(())
    }

    async fn execute(
        &self,
        caller: Option<&UserId>,
        card_id: CardId,
        kind: EntryKind,
        amount: Cents,
        description: &str,
    ) -> Result<LedgerEntry, AppError> {
        let guard = self
            .card_locks
            .acquire(&card_id, self.config.lock_timeout)
            .await
            .map_err(|timeout| AppError::Busy {
                resource: format!("card {}", card_id),
                waited: timeout.waited,
            })?;

        let mut tx = self.repo.begin().await?;
        let card = self
            .repo
            .claim_card(&mut tx, card_id)
            .await?
            .filter(|card| caller.is_none_or(|user| card.is_owned_by(user)))
            .ok_or(AppError::CardNotFound(card_id))?;

        if let Err(status) = ensure_transactable(&card, Utc::now().date_naive()) {
            warn!(card_id = %card_id, kind = %kind, status = %status, "{kind} rejected");
            return Err(AppError::InvalidState {
                card_id,
                reason: format!("card is {}", status),
            });
        }

        self.validate_amount(amount)?;
        let description = normalize_description(description).ok_or_else(|| {
            AppError::InvalidInput(format!(
                "Description must be at most {} characters",
                MAX_DESCRIPTION_LEN
            ))
        })?;

        let now = Utc::now();
        let reference = self.unused_reference(&mut tx, now).await?;

        match settle(card.balance, kind, amount) {
            Settlement::Applied { balance_after } => {
                Repository::set_card_balance(&mut tx, card_id, balance_after, now).await?;
                let mut entry = LedgerEntry::completed(
                    card_id,
                    reference,
                    kind,
                    amount,
                    description,
                    card.balance,
                    balance_after,
                );
                Repository::insert_entry(&mut tx, &mut entry).await?;
                tx.commit().await.context("Failed to commit ledger entry")?;
                drop(guard);

                info!(
                    card_id = %card_id,
                    reference = %entry.reference,
                    amount = %format_cents(amount),
                    balance_before = %format_cents(card.balance),
                    balance_after = %format_cents(balance_after),
                    "{kind} applied"
                );

                self.aggregator
                    .on_commit(&CommitEvent::EntryRecorded {
                        user_id: card.user_id,
                        card_id,
                        entry_id: entry.id,
                    })
                    .await;

                Ok(entry)
            }
            Settlement::InsufficientFunds => {
                let mut entry = LedgerEntry::failed(
                    card_id,
                    reference,
                    kind,
                    amount,
                    description,
                    card.balance,
                );
                Repository::insert_entry(&mut tx, &mut entry).await?;
                tx.commit().await.context("Failed to commit failed entry")?;
                drop(guard);

                warn!(
                    card_id = %card_id,
                    reference = %entry.reference,
                    amount = %format_cents(amount),
                    balance = %format_cents(card.balance),
                    "{kind} failed: insufficient funds"
                );

                Err(AppError::InsufficientFunds {
                    card_id,
                    balance: card.balance,
                    requested: amount,
                    reference: entry.reference,
                })
            }
            Settlement::ExceedsPrecision => Err(AppError::InvalidAmount(format!(
                "Balance {} plus {} exceeds the card's balance limit",
                format_cents(card.balance),
                format_cents(amount)
            ))),
        }
    }

    /// Sample entry references until one is not in the store.
    async fn unused_reference(
        &self,
        conn: &mut SqliteConnection,
        now: DateTime<Utc>,
    ) -> Result<String, AppError> {
        let mut budget = RetryBudget::new(self.config.id_retry_limit);
        loop {
            budget
                .attempt()
                .map_err(|exhausted| AppError::ExhaustedRetries {
                    what: "entry reference",
                    attempts: exhausted.attempts,
                })?;
            let candidate = generate_reference(&mut rand::thread_rng(), now);
            if !Repository::reference_exists(conn, &candidate).await? {
                return Ok(candidate);
            }
            debug!(reference = %candidate, "entry reference taken, resampling");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::NaiveDate;
    use tempfile::TempDir;

    use super::*;
    use crate::domain::{Card, EntryStatus};

    struct Fixture {
        engine: LedgerEngine,
        locks: Arc<KeyedLocks<CardId>>,
        repo: Arc<Repository>,
        card: Card,
        _temp: TempDir,
    }

    async fn fixture(config: LedgerConfig) -> Fixture {
        let temp = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", temp.path().join("engine.db").display());
        let repo = Arc::new(Repository::init(&url, config.busy_timeout).await.unwrap());
        let locks = Arc::new(KeyedLocks::new());
        let aggregator = Arc::new(AccountAggregator::new(repo.clone(), config.lock_timeout));

        let card = Card::issue(
            UserId::new("alice"),
            "4000000000000001".into(),
            "123".into(),
            "ALICE SMITH".into(),
            NaiveDate::from_ymd_opt(2099, 1, 1).unwrap(),
            10000,
        );
        repo.insert_card(&card).await.unwrap();

        let engine = LedgerEngine::new(repo.clone(), locks.clone(), aggregator, config);
        Fixture {
            engine,
            locks,
            repo,
            card,
            _temp: temp,
        }
    }

    #[tokio::test]
    async fn test_held_card_lock_reports_busy() {
        let f = fixture(LedgerConfig::default().with_lock_timeout(Duration::from_millis(50))).await;

        let held = f.locks.acquire(&f.card.id, Duration::from_secs(1)).await.unwrap();
        let err = f
            .engine
            .apply(f.card.id, EntryKind::Credit, 500, "")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Busy { .. }));
        assert!(err.is_retryable());

        drop(held);
        let entry = f
            .engine
            .apply(f.card.id, EntryKind::Credit, 500, "")
            .await
            .unwrap();
        assert_eq!(entry.balance_after, Some(10500));
    }

    #[tokio::test]
    async fn test_apply_skips_owner_check() {
        let f = fixture(LedgerConfig::default()).await;
        let entry = f
            .engine
            .apply(f.card.id, EntryKind::Debit, 2500, " Coffee ")
            .await
            .unwrap();
        assert_eq!(entry.status, EntryStatus::Completed);
        assert_eq!(entry.description, "Coffee");
        assert_eq!(entry.balance_before, Some(10000));
        assert_eq!(entry.balance_after, Some(7500));

        let err = f
            .engine
            .apply_as(&UserId::new("mallory"), f.card.id, EntryKind::Debit, 100, "")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CardNotFound(id) if id == f.card.id));
    }

    #[tokio::test]
    async fn test_reference_retries_exhausted_leaves_card_untouched() {
        let f = fixture(LedgerConfig::default().with_id_retry_limit(0)).await;
        let err = f
            .engine
            .apply(f.card.id, EntryKind::Credit, 500, "")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::ExhaustedRetries {
                what: "entry reference",
                attempts: 0
            }
        ));

        let card = f.repo.get_card(f.card.id).await.unwrap().unwrap();
        assert_eq!(card.balance, 10000);
        assert!(f.repo.list_entries_for_card(f.card.id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_credit_past_balance_limit_is_rejected() {
        let f = fixture(LedgerConfig::default().with_max_amount(crate::domain::MAX_BALANCE_CENTS))
            .await;
        let err = f
            .engine
            .apply(
                f.card.id,
                EntryKind::Credit,
                crate::domain::MAX_BALANCE_CENTS,
                "",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidAmount(_)));
        assert!(f.repo.list_entries_for_card(f.card.id, None).await.unwrap().is_empty());
    }
}
