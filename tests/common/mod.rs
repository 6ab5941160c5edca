// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use anyhow::Result;
use cardledger::application::{CardService, LedgerConfig, NewCard};
use cardledger::domain::{CardView, Cents, UserId};
use chrono::{Days, NaiveDate, Utc};
use tempfile::TempDir;

/// Helper to create a test service with a temporary database
pub async fn test_service() -> Result<(CardService, TempDir)> {
    test_service_with(LedgerConfig::default()).await
}

pub async fn test_service_with(config: LedgerConfig) -> Result<(CardService, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let service = CardService::init(db_path.to_str().unwrap(), config).await?;
    Ok((service, temp_dir))
}

/// URL of the database behind a service made by [`test_service_with`],
/// for opening a second, independent connection to it
pub fn database_url(temp_dir: &TempDir) -> String {
    format!("sqlite:{}", temp_dir.path().join("test.db").display())
}

pub fn alice() -> UserId {
    UserId::new("alice")
}

pub fn bob() -> UserId {
    UserId::new("bob")
}

/// Issue a card with the default expiry
pub async fn issue_card(service: &CardService, user: &UserId, balance: Cents) -> Result<CardView> {
    Ok(service
        .create_card(
            user,
            NewCard {
                holder_name: "Test Holder".into(),
                initial_balance: balance,
                expiry_date: None,
            },
        )
        .await?)
}

/// Issue a card that expired yesterday
pub async fn issue_expired_card(
    service: &CardService,
    user: &UserId,
    balance: Cents,
) -> Result<CardView> {
    Ok(service
        .create_card(
            user,
            NewCard {
                holder_name: "Old Holder".into(),
                initial_balance: balance,
                expiry_date: Some(days_ago(1)),
            },
        )
        .await?)
}

pub fn days_ago(days: u64) -> NaiveDate {
    Utc::now()
        .date_naive()
        .checked_sub_days(Days::new(days))
        .unwrap()
}
