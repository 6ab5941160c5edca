mod common;

use anyhow::Result;
use cardledger::application::{AppError, EntryFilter};
use cardledger::domain::{EntryKind, EntryStatus, MAX_BALANCE_CENTS};
use common::{alice, bob, issue_card, test_service};

#[tokio::test]
async fn test_credit_debit_scenario() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let user = alice();
    let card = issue_card(&service, &user, 100000).await?;

    // 1000.00 + 500.00
    let credit = service
        .process_transaction(&user, card.id, EntryKind::Credit, 50000, "Top up")
        .await?;
    assert_eq!(credit.status, EntryStatus::Completed);
    assert_eq!(credit.balance_before, Some(100000));
    assert_eq!(credit.balance_after, Some(150000));

    // Overdraw: recorded as failed, balance untouched
    let err = service
        .process_transaction(&user, card.id, EntryKind::Debit, 200000, "Too much")
        .await
        .unwrap_err();
    let failed_reference = match err {
        AppError::InsufficientFunds {
            balance,
            requested,
            reference,
            ..
        } => {
            assert_eq!(balance, 150000);
            assert_eq!(requested, 200000);
            reference
        }
        other => panic!("expected insufficient funds, got {other}"),
    };
    assert_eq!(service.get_card(&user, card.id).await?.balance, 150000);

    let debit = service
        .process_transaction(&user, card.id, EntryKind::Debit, 20000, "Groceries")
        .await?;
    assert_eq!(debit.balance_before, Some(150000));
    assert_eq!(debit.balance_after, Some(130000));
    assert_eq!(service.get_card(&user, card.id).await?.balance, 130000);

    let entries = service.list_card_entries(&user, card.id, None).await?;
    assert_eq!(entries.len(), 3);
    let failed = &entries[1].entry;
    assert_eq!(failed.reference, failed_reference);
    assert_eq!(failed.status, EntryStatus::Failed);
    assert_eq!(failed.balance_before, Some(150000));
    assert_eq!(failed.balance_after, Some(150000));
    assert!(entries.windows(2).all(|w| w[0].entry.sequence < w[1].entry.sequence));

    let report = service.audit_card(&user, card.id).await?;
    assert_eq!(report.balance, 130000);
    assert_eq!(report.completed_entries, 2);
    assert_eq!(report.failed_entries, 1);

    Ok(())
}

#[tokio::test]
async fn test_reference_format() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let user = alice();
    let card = issue_card(&service, &user, 0).await?;

    let entry = service
        .process_transaction(&user, card.id, EntryKind::Credit, 100, "")
        .await?;
    assert_eq!(entry.reference.len(), 3 + 14 + 8);
    assert!(entry.reference.starts_with("TXN"));
    assert!(entry.reference[3..17].chars().all(|c| c.is_ascii_digit()));
    assert!(
        entry.reference[17..]
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    );
    Ok(())
}

#[tokio::test]
async fn test_invalid_amounts_are_rejected() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let user = alice();
    let card = issue_card(&service, &user, 1000).await?;

    for amount in [0, -500, 100_000_001] {
        let err = service
            .process_transaction(&user, card.id, EntryKind::Credit, amount, "")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidAmount(_)), "amount {amount}");
    }

    // Exactly the ceiling is fine
    service
        .process_transaction(&user, card.id, EntryKind::Credit, 100_000_000, "")
        .await?;

    assert_eq!(service.list_card_entries(&user, card.id, None).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_overlong_description_is_rejected() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let user = alice();
    let card = issue_card(&service, &user, 1000).await?;

    let err = service
        .process_transaction(&user, card.id, EntryKind::Debit, 100, &"x".repeat(256))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let entry = service
        .process_transaction(&user, card.id, EntryKind::Debit, 100, &"x".repeat(255))
        .await?;
    assert_eq!(entry.description.len(), 255);
    Ok(())
}

#[tokio::test]
async fn test_initial_balance_is_bounded() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let user = alice();

    let err = issue_card(&service, &user, -1).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AppError>(),
        Some(AppError::InvalidAmount(_))
    ));

    let err = issue_card(&service, &user, MAX_BALANCE_CENTS + 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AppError>(),
        Some(AppError::InvalidAmount(_))
    ));

    let card = issue_card(&service, &user, MAX_BALANCE_CENTS).await?;
    let err = service
        .process_transaction(&user, card.id, EntryKind::Credit, 1, "")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidAmount(_)));
    Ok(())
}

#[tokio::test]
async fn test_foreign_card_is_not_found() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let card = issue_card(&service, &alice(), 5000).await?;
    let intruder = bob();

    let err = service
        .process_transaction(&intruder, card.id, EntryKind::Debit, 100, "")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::CardNotFound(id) if id == card.id));

    assert!(matches!(
        service.get_card(&intruder, card.id).await,
        Err(AppError::CardNotFound(_))
    ));
    assert!(matches!(
        service.list_card_entries(&intruder, card.id, None).await,
        Err(AppError::CardNotFound(_))
    ));
    assert!(matches!(
        service.audit_card(&intruder, card.id).await,
        Err(AppError::CardNotFound(_))
    ));
    assert_eq!(service.get_card(&alice(), card.id).await?.balance, 5000);
    Ok(())
}

#[tokio::test]
async fn test_entry_lookup_and_filters() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let user = alice();
    let first = issue_card(&service, &user, 10000).await?;
    let second = issue_card(&service, &user, 0).await?;
    let other = issue_card(&service, &bob(), 10000).await?;

    let credit = service
        .process_transaction(&user, second.id, EntryKind::Credit, 3000, "Salary")
        .await?;
    service
        .process_transaction(&user, first.id, EntryKind::Debit, 2000, "Lunch")
        .await?;
    let _ = service
        .process_transaction(&user, second.id, EntryKind::Debit, 9000, "Rent")
        .await;
    service
        .process_transaction(&bob(), other.id, EntryKind::Debit, 100, "Bob's")
        .await?;

    let all = service.list_entries(&user, EntryFilter::default()).await?;
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|v| v.entry.card_id != other.id));

    let debits = service
        .list_entries(
            &user,
            EntryFilter {
                kind: Some(EntryKind::Debit),
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(debits.len(), 2);

    let failed = service
        .list_entries(
            &user,
            EntryFilter {
                status: Some(EntryStatus::Failed),
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].entry.description, "Rent");

    let completed_on_second = service
        .list_card_entries(&user, second.id, Some(EntryStatus::Completed))
        .await?;
    assert_eq!(completed_on_second.len(), 1);

    let view = service.get_entry(&user, credit.id).await?;
    assert_eq!(view.entry.reference, credit.reference);
    assert_eq!(view.card_masked_number, second.masked_number);
    assert_eq!(view.card_holder_name, "TEST HOLDER");

    assert!(matches!(
        service.get_entry(&bob(), credit.id).await,
        Err(AppError::EntryNotFound(id)) if id == credit.id
    ));
    Ok(())
}

#[tokio::test]
async fn test_views_hide_card_secrets() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let user = alice();
    let card = issue_card(&service, &user, 0).await?;
    let entry = service
        .process_transaction(&user, card.id, EntryKind::Credit, 100, "")
        .await?;

    assert!(card.masked_number.starts_with("XXXX-XXXX-XXXX-"));
    assert_eq!(card.masked_number.len(), 19);

    let card_json = serde_json::to_value(service.get_card(&user, card.id).await?)?;
    assert!(card_json.get("card_number").is_none());
    assert!(card_json.get("cvv").is_none());
    assert_eq!(card_json["masked_number"], card.masked_number.as_str());

    let entry_json = serde_json::to_value(service.get_entry(&user, entry.id).await?)?;
    assert_eq!(entry_json["card_masked_number"], card.masked_number.as_str());
    assert_eq!(entry_json["reference"], entry.reference.as_str());
    Ok(())
}
