use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, warn};

use crate::domain::{compute_rollup, AccountRollup, UserId};
use crate::storage::{KeyedLocks, Repository};

use super::{AppError, CommitEvent};

/// Sole writer of account rollups.
///
/// Every rewrite is a full recomputation from committed cards and entries,
/// done under a per-user lock inside one store transaction, so concurrent
/// refreshes for the same user apply one at a time and the last one to run
/// sees every commit that preceded it.
pub struct AccountAggregator {
    repo: Arc<Repository>,
    locks: KeyedLocks<UserId>,
    lock_timeout: Duration,
}

impl AccountAggregator {
    pub fn new(repo: Arc<Repository>, lock_timeout: Duration) -> Self {
        Self {
            repo,
            locks: KeyedLocks::new(),
            lock_timeout,
        }
    }

    /// Rebuild and store the user's rollup.
    pub async fn recompute(&self, user_id: &UserId) -> Result<AccountRollup, AppError> {
        let _guard = self
            .locks
            .acquire(user_id, self.lock_timeout)
            .await
            .map_err(|timeout| AppError::Busy {
                resource: format!("rollup of {}", user_id),
                waited: timeout.waited,
            })?;

        let mut tx = self.repo.begin().await?;
        self.repo.claim_rollup(&mut tx, user_id).await?;
        let cards = Repository::cards_for_user_in(&mut tx, user_id).await?;
        let entries = Repository::completed_entries_for_user_in(&mut tx, user_id).await?;

        let rollup = compute_rollup(user_id, &cards, &entries, Utc::now().date_naive());
        Repository::upsert_rollup(&mut tx, &rollup).await?;
        tx.commit().await.context("Failed to commit account rollup")?;

        debug!(
            user = %user_id,
            cards = rollup.total_cards,
            transactions = rollup.total_transactions,
            "rollup recomputed"
        );
        Ok(rollup)
    }

    /// The stored rollup, computed on first request.
    pub async fn rollup(&self, user_id: &UserId) -> Result<AccountRollup, AppError> {
        match self.repo.get_rollup(user_id).await? {
            Some(rollup) => Ok(rollup),
            None => self.recompute(user_id).await,
        }
    }

    /// Explicit refresh on caller request.
    pub async fn refresh(&self, user_id: &UserId) -> Result<AccountRollup, AppError> {
        self.recompute(user_id).await
    }

    /// Post-commit hook. The event is already durable; a failure here only
    /// leaves the cache stale until the next recompute.
    pub async fn on_commit(&self, event: &CommitEvent) {
        if let Err(e) = self.recompute(event.user_id()).await {
            warn!(
                user = %event.user_id(),
                card_id = %event.card_id(),
                error = %e,
                "rollup recompute failed after commit"
            );
        }
    }
}
