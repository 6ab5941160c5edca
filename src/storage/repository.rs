use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::domain::{
    AccountRollup, Card, CardId, CardStatus, EntryId, EntryKind, EntryStatus, LedgerEntry, UserId,
};

use super::MIGRATION_001_INITIAL;

const CARD_COLUMNS: &str = "id, user_id, card_number, cvv, holder_name, expiry_date, balance_cents, status, created_at, updated_at";

const ENTRY_COLUMNS: &str = "e.id, e.sequence, e.reference, e.card_id, e.kind, e.amount_cents, e.description, e.status, e.balance_before_cents, e.balance_after_cents, e.created_at, e.updated_at";

/// Fixed-width RFC 3339 so that stored timestamps sort as text and round-trip exactly.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// SQLite's single write lock stayed taken by another connection for longer
/// than `busy_timeout`. Every card shares that lock, so this is contention
/// on the store as a whole rather than on one card.
#[derive(Debug, thiserror::Error)]
#[error("database write lock still taken after {waited:?} ({operation})")]
pub struct StoreBusy {
    pub operation: &'static str,
    pub waited: Duration,
}

/// SQLITE_BUSY (5) or SQLITE_LOCKED (6), including their extended codes.
fn is_busy(err: &sqlx::Error) -> bool {
    let Some(db) = err.as_database_error() else {
        return false;
    };
    db.code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}

fn parse_timestamp(s: &str, what: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid {} timestamp", what))?
        .with_timezone(&Utc))
}

/// Repository for persisting and querying cards, ledger entries and rollups.
///
/// Read methods run on the pool. Methods that take a `&mut SqliteConnection`
/// are meant to run inside a transaction obtained from [`Repository::begin`].
pub struct Repository {
    pool: SqlitePool,
    busy_timeout: Duration,
}

impl Repository {
    /// Create a new repository with the given SQLite connection pool.
    /// `busy_timeout` is what the pool's connections were configured with.
    pub fn new(pool: SqlitePool, busy_timeout: Duration) -> Self {
        Self { pool, busy_timeout }
    }

    /// Wrap a failed first write of a unit of work. A busy store becomes
    /// [`StoreBusy`]; anything else keeps its context.
    fn write_error(&self, err: sqlx::Error, operation: &'static str) -> anyhow::Error {
        if is_busy(&err) {
            anyhow::Error::new(StoreBusy {
                operation,
                waited: self.busy_timeout,
            })
        } else {
            anyhow::Error::new(err).context(operation)
        }
    }

    /// Connect to a SQLite database, creating the file if it doesn't exist.
    /// `busy_timeout` bounds how long a connection waits on SQLite's own write lock.
    pub async fn connect(database_url: &str, busy_timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("Invalid database URL")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool, busy_timeout))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    /// Initialize a database (connect + migrate).
    pub async fn init(database_url: &str, busy_timeout: Duration) -> Result<Self> {
        let repo = Self::connect(database_url, busy_timeout).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    /// Start a store transaction. Dropping it without commit rolls back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool.begin().await.context("Failed to begin transaction")
    }

    // ========================
    // Card operations
    // ========================

    /// Save a newly issued card.
    pub async fn insert_card(&self, card: &Card) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cards (id, user_id, card_number, cvv, holder_name, expiry_date, balance_cents, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(card.id.to_string())
        .bind(card.user_id.as_str())
        .bind(&card.card_number)
        .bind(&card.cvv)
        .bind(&card.holder_name)
        .bind(card.expiry_date.to_string())
        .bind(card.balance)
        .bind(card.status.as_str())
        .bind(timestamp(card.created_at))
        .bind(timestamp(card.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| self.write_error(e, "Failed to save card"))?;
        Ok(())
    }

    /// Get a card by ID.
    pub async fn get_card(&self, id: CardId) -> Result<Option<Card>> {
        let row = sqlx::query(&format!("SELECT {} FROM cards WHERE id = ?", CARD_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch card")?;

        row.as_ref().map(Self::row_to_card).transpose()
    }

    pub async fn card_number_exists(&self, card_number: &str) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM cards WHERE card_number = ?) AS taken")
            .bind(card_number)
            .fetch_one(&self.pool)
            .await
            .context("Failed to check card number")?;
        Ok(row.get::<i64, _>("taken") != 0)
    }

    /// List a user's cards, newest first.
    pub async fn list_cards_for_user(&self, user_id: &UserId) -> Result<Vec<Card>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM cards WHERE user_id = ? ORDER BY created_at DESC, rowid DESC",
            CARD_COLUMNS
        ))
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list cards")?;

        rows.iter().map(Self::row_to_card).collect()
    }

    /// Take the store write lock on a card row and return its current state.
    ///
    /// This is the first statement of every mutating transaction: a no-op
    /// update makes SQLite acquire its write lock before anything is read,
    /// so the returned row cannot go stale before commit.
    pub async fn claim_card(
        &self,
        conn: &mut SqliteConnection,
        id: CardId,
    ) -> Result<Option<Card>> {
        let row = sqlx::query(&format!(
            "UPDATE cards SET updated_at = updated_at WHERE id = ? RETURNING {}",
            CARD_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| self.write_error(e, "Failed to claim card"))?;

        row.as_ref().map(Self::row_to_card).transpose()
    }

    pub async fn set_card_balance(
        conn: &mut SqliteConnection,
        id: CardId,
        balance: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE cards SET balance_cents = ?, updated_at = ? WHERE id = ?")
            .bind(balance)
            .bind(timestamp(now))
            .bind(id.to_string())
            .execute(&mut *conn)
            .await
            .context("Failed to update card balance")?;
        Ok(())
    }

    pub async fn set_card_status(
        conn: &mut SqliteConnection,
        id: CardId,
        status: CardStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        anyhow::ensure!(status != CardStatus::Expired, "Expired is never stored");
        sqlx::query("UPDATE cards SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(timestamp(now))
            .bind(id.to_string())
            .execute(&mut *conn)
            .await
            .context("Failed to update card status")?;
        Ok(())
    }

    fn row_to_card(row: &sqlx::sqlite::SqliteRow) -> Result<Card> {
        let id_str: String = row.get("id");
        let user_id: String = row.get("user_id");
        let expiry_str: String = row.get("expiry_date");
        let status_str: String = row.get("status");
        let created_at_str: String = row.get("created_at");
        let updated_at_str: String = row.get("updated_at");

        Ok(Card {
            id: Uuid::parse_str(&id_str).context("Invalid card ID")?,
            user_id: UserId::new(user_id),
            card_number: row.get("card_number"),
            cvv: row.get("cvv"),
            holder_name: row.get("holder_name"),
            expiry_date: NaiveDate::parse_from_str(&expiry_str, "%Y-%m-%d")
                .context("Invalid expiry date")?,
            balance: row.get("balance_cents"),
            status: CardStatus::from_str(&status_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid card status: {}", status_str))?,
            created_at: parse_timestamp(&created_at_str, "created_at")?,
            updated_at: parse_timestamp(&updated_at_str, "updated_at")?,
        })
    }

    // ========================
    // Ledger entry operations
    // ========================

    /// Save a new entry. Assigns the next sequence number.
    pub async fn insert_entry(conn: &mut SqliteConnection, entry: &mut LedgerEntry) -> Result<()> {
        entry.sequence = Self::next_sequence(conn).await?;

        sqlx::query(
            r#"
            INSERT INTO ledger_entries (id, sequence, reference, card_id, kind, amount_cents, description, status, balance_before_cents, balance_after_cents, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.sequence)
        .bind(&entry.reference)
        .bind(entry.card_id.to_string())
        .bind(entry.kind.as_str())
        .bind(entry.amount)
        .bind(&entry.description)
        .bind(entry.status.as_str())
        .bind(entry.balance_before)
        .bind(entry.balance_after)
        .bind(timestamp(entry.created_at))
        .bind(timestamp(entry.updated_at))
        .execute(&mut *conn)
        .await
        .context("Failed to save ledger entry")?;

        Ok(())
    }

    /// Get the next sequence number and increment the counter.
    async fn next_sequence(conn: &mut SqliteConnection) -> Result<i64> {
        let row = sqlx::query(
            r#"
            UPDATE sequence_counter
            SET value = value + 1
            WHERE name = 'entry_sequence'
            RETURNING value
            "#,
        )
        .fetch_one(&mut *conn)
        .await
        .context("Failed to get next sequence number")?;

        Ok(row.get("value"))
    }

    pub async fn reference_exists(conn: &mut SqliteConnection, reference: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM ledger_entries WHERE reference = ?) AS taken",
        )
        .bind(reference)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to check entry reference")?;
        Ok(row.get::<i64, _>("taken") != 0)
    }

    /// Get an entry by ID.
    pub async fn get_entry(&self, id: EntryId) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries e WHERE e.id = ?",
            ENTRY_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch ledger entry")?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    /// List a card's entries in creation order, optionally filtered by status.
    pub async fn list_entries_for_card(
        &self,
        card_id: CardId,
        status: Option<EntryStatus>,
    ) -> Result<Vec<LedgerEntry>> {
        let mut query = format!(
            "SELECT {} FROM ledger_entries e WHERE e.card_id = ?",
            ENTRY_COLUMNS
        );
        if status.is_some() {
            query.push_str(" AND e.status = ?");
        }
        query.push_str(" ORDER BY e.sequence");

        let mut sql_query = sqlx::query(&query).bind(card_id.to_string());
        if let Some(status) = status {
            sql_query = sql_query.bind(status.as_str());
        }

        let rows = sql_query
            .fetch_all(&self.pool)
            .await
            .context("Failed to list entries for card")?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    /// List entries across all of a user's cards, in creation order.
    pub async fn list_entries_for_user(
        &self,
        user_id: &UserId,
        status: Option<EntryStatus>,
        kind: Option<EntryKind>,
    ) -> Result<Vec<LedgerEntry>> {
        let mut query = format!(
            "SELECT {} FROM ledger_entries e JOIN cards c ON c.id = e.card_id WHERE c.user_id = ?",
            ENTRY_COLUMNS
        );
        if status.is_some() {
            query.push_str(" AND e.status = ?");
        }
        if kind.is_some() {
            query.push_str(" AND e.kind = ?");
        }
        query.push_str(" ORDER BY e.sequence");

        let mut sql_query = sqlx::query(&query).bind(user_id.as_str());
        if let Some(status) = status {
            sql_query = sql_query.bind(status.as_str());
        }
        if let Some(kind) = kind {
            sql_query = sql_query.bind(kind.as_str());
        }

        let rows = sql_query
            .fetch_all(&self.pool)
            .await
            .context("Failed to list entries for user")?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<LedgerEntry> {
        let id_str: String = row.get("id");
        let card_id_str: String = row.get("card_id");
        let kind_str: String = row.get("kind");
        let status_str: String = row.get("status");
        let created_at_str: String = row.get("created_at");
        let updated_at_str: String = row.get("updated_at");

        Ok(LedgerEntry {
            id: Uuid::parse_str(&id_str).context("Invalid entry ID")?,
            sequence: row.get("sequence"),
            reference: row.get("reference"),
            card_id: Uuid::parse_str(&card_id_str).context("Invalid card ID")?,
            kind: EntryKind::from_str(&kind_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid entry kind: {}", kind_str))?,
            amount: row.get("amount_cents"),
            description: row.get("description"),
            status: EntryStatus::from_str(&status_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid entry status: {}", status_str))?,
            balance_before: row.get("balance_before_cents"),
            balance_after: row.get("balance_after_cents"),
            created_at: parse_timestamp(&created_at_str, "created_at")?,
            updated_at: parse_timestamp(&updated_at_str, "updated_at")?,
        })
    }

    // ========================
    // Rollup operations
    // ========================

    pub async fn get_rollup(&self, user_id: &UserId) -> Result<Option<AccountRollup>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, total_balance_cents, total_cards, active_cards, total_transactions,
                   total_credited_cents, total_debited_cents, last_transaction_at, updated_at
            FROM account_rollups
            WHERE user_id = ?
            "#,
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch account rollup")?;

        row.as_ref().map(Self::row_to_rollup).transpose()
    }

    /// Take the store write lock for a rollup rewrite, creating the user's
    /// row on first use. Same role as [`Repository::claim_card`].
    pub async fn claim_rollup(&self, conn: &mut SqliteConnection, user_id: &UserId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO account_rollups (user_id, total_balance_cents, total_cards, active_cards, total_transactions,
                                         total_credited_cents, total_debited_cents, last_transaction_at, updated_at)
            VALUES (?, 0, 0, 0, 0, 0, 0, NULL, ?)
            ON CONFLICT (user_id) DO UPDATE SET updated_at = account_rollups.updated_at
            "#,
        )
        .bind(user_id.as_str())
        .bind(timestamp(DateTime::<Utc>::UNIX_EPOCH))
        .execute(&mut *conn)
        .await
        .map_err(|e| self.write_error(e, "Failed to claim account rollup"))?;
        Ok(())
    }

    /// Replace a user's rollup in full (insert on first use).
    pub async fn upsert_rollup(conn: &mut SqliteConnection, rollup: &AccountRollup) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO account_rollups (user_id, total_balance_cents, total_cards, active_cards, total_transactions,
                                         total_credited_cents, total_debited_cents, last_transaction_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE SET
                total_balance_cents = excluded.total_balance_cents,
                total_cards = excluded.total_cards,
                active_cards = excluded.active_cards,
                total_transactions = excluded.total_transactions,
                total_credited_cents = excluded.total_credited_cents,
                total_debited_cents = excluded.total_debited_cents,
                last_transaction_at = excluded.last_transaction_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(rollup.user_id.as_str())
        .bind(rollup.total_balance)
        .bind(rollup.total_cards)
        .bind(rollup.active_cards)
        .bind(rollup.total_transactions)
        .bind(rollup.total_credited)
        .bind(rollup.total_debited)
        .bind(rollup.last_transaction_at.map(timestamp))
        .bind(timestamp(rollup.updated_at))
        .execute(&mut *conn)
        .await
        .context("Failed to save account rollup")?;
        Ok(())
    }

    /// Cards of a user, read on a transaction's connection.
    pub async fn cards_for_user_in(conn: &mut SqliteConnection, user_id: &UserId) -> Result<Vec<Card>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM cards WHERE user_id = ? ORDER BY created_at DESC, rowid DESC",
            CARD_COLUMNS
        ))
        .bind(user_id.as_str())
        .fetch_all(&mut *conn)
        .await
        .context("Failed to list cards")?;

        rows.iter().map(Self::row_to_card).collect()
    }

    /// Completed entries of a user, read on a transaction's connection.
    pub async fn completed_entries_for_user_in(
        conn: &mut SqliteConnection,
        user_id: &UserId,
    ) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries e JOIN cards c ON c.id = e.card_id WHERE c.user_id = ? AND e.status = 'completed' ORDER BY e.sequence",
            ENTRY_COLUMNS
        ))
        .bind(user_id.as_str())
        .fetch_all(&mut *conn)
        .await
        .context("Failed to list completed entries")?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    fn row_to_rollup(row: &sqlx::sqlite::SqliteRow) -> Result<AccountRollup> {
        let user_id: String = row.get("user_id");
        let last_transaction_str: Option<String> = row.get("last_transaction_at");
        let updated_at_str: String = row.get("updated_at");

        Ok(AccountRollup {
            user_id: UserId::new(user_id),
            total_balance: row.get("total_balance_cents"),
            total_cards: row.get("total_cards"),
            active_cards: row.get("active_cards"),
            total_transactions: row.get("total_transactions"),
            total_credited: row.get("total_credited_cents"),
            total_debited: row.get("total_debited_cents"),
            last_transaction_at: last_transaction_str
                .map(|s| parse_timestamp(&s, "last_transaction_at"))
                .transpose()?,
            updated_at: parse_timestamp(&updated_at_str, "updated_at")?,
        })
    }
}
