use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};

use crate::domain::{transition, Card, CardId, StatusAction, UserId};
use crate::storage::{KeyedLocks, Repository};

use super::{AccountAggregator, AppError, CommitEvent};

/// Block / unblock, under the same per-card lock as the ledger engine so a
/// status change never interleaves with an in-flight movement.
pub struct LifecycleManager {
    repo: Arc<Repository>,
    card_locks: Arc<KeyedLocks<CardId>>,
    aggregator: Arc<AccountAggregator>,
    lock_timeout: Duration,
}

impl LifecycleManager {
    pub fn new(
        repo: Arc<Repository>,
        card_locks: Arc<KeyedLocks<CardId>>,
        aggregator: Arc<AccountAggregator>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            card_locks,
            aggregator,
            lock_timeout,
        }
    }

    pub async fn block(&self, caller: &UserId, card_id: CardId) -> Result<Card, AppError> {
        self.change_status(caller, card_id, StatusAction::Block).await
    }

    pub async fn unblock(&self, caller: &UserId, card_id: CardId) -> Result<Card, AppError> {
        self.change_status(caller, card_id, StatusAction::Unblock)
            .await
    }

    async fn change_status(
        &self,
        caller: &UserId,
        card_id: CardId,
        action: StatusAction,
    ) -> Result<Card, AppError> {
        let guard = self
            .card_locks
            .acquire(&card_id, self.lock_timeout)
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
            .filter(|card| card.is_owned_by(caller))
            .ok_or(AppError::CardNotFound(card_id))?;

        let status = match transition(&card, action, Utc::now().date_naive()) {
            Ok(status) => status,
            Err(e) => {
                warn!(card_id = %card_id, reason = %e, "{action} rejected");
                return Err(AppError::InvalidState {
                    card_id,
                    reason: e.to_string(),
                });
            }
        };

        let now = Utc::now();
        Repository::set_card_status(&mut tx, card_id, status, now).await?;
        tx.commit().await.context("Failed to commit status change")?;
        drop(guard);

        info!(card_id = %card_id, status = %status, "card {action}ed");

        let card = Card {
            status,
            updated_at: now,
            ..card
        };
        self.aggregator
            .on_commit(&CommitEvent::StatusChanged {
                user_id: card.user_id.clone(),
                card_id,
                status,
            })
            .await;

        Ok(card)
    }
}
