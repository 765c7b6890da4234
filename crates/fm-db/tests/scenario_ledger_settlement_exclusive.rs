//! The partial unique indexes are the authority for the settlement
//! protocol: one reservation per operation, one terminal settlement
//! (capture XOR refund) per operation.

use fm_db::ledger::{entry_type, NewLedgerEntry, UQ_RESERVATION, UQ_SETTLE};
use fm_schemas::UserTier;
use uuid::Uuid;

#[tokio::test]
async fn settlement_rows_are_exclusive_per_operation() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };

    let user_id = fm_testkit::seed_funded_user(&pool, UserTier::Free, 10).await?;
    let operation_id = Uuid::new_v4();

    let mut conn = pool.acquire().await?;

    // First reservation lands.
    fm_db::ledger::insert_entry(
        &mut conn,
        &NewLedgerEntry {
            user_id,
            operation_id: Some(operation_id),
            amount: -1,
            entry_type: entry_type::RESERVATION,
            description: "first".into(),
        },
    )
    .await?;

    // Second reservation for the same operation violates the partial index.
    let err = fm_db::ledger::insert_entry(
        &mut conn,
        &NewLedgerEntry {
            user_id,
            operation_id: Some(operation_id),
            amount: -1,
            entry_type: entry_type::RESERVATION,
            description: "second".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(fm_db::is_unique_violation(&err, UQ_RESERVATION));

    // Capture lands once.
    fm_db::ledger::insert_entry(
        &mut conn,
        &NewLedgerEntry {
            user_id,
            operation_id: Some(operation_id),
            amount: 0,
            entry_type: entry_type::DEBIT_CAPTURE,
            description: "capture".into(),
        },
    )
    .await?;

    // A refund after the capture violates the settle index: terminal
    // settlement is exclusive.
    let err = fm_db::ledger::insert_entry(
        &mut conn,
        &NewLedgerEntry {
            user_id,
            operation_id: Some(operation_id),
            amount: 1,
            entry_type: entry_type::REFUND,
            description: "late refund".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(fm_db::is_unique_violation(&err, UQ_SETTLE));

    Ok(())
}

#[tokio::test]
async fn reservations_for_different_operations_coexist() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };

    let user_id = fm_testkit::seed_funded_user(&pool, UserTier::Free, 10).await?;
    let mut conn = pool.acquire().await?;

    for _ in 0..3 {
        fm_db::ledger::insert_entry(
            &mut conn,
            &NewLedgerEntry {
                user_id,
                operation_id: Some(Uuid::new_v4()),
                amount: -1,
                entry_type: entry_type::RESERVATION,
                description: "one of several".into(),
            },
        )
        .await?;
    }

    let balance = fm_db::ledger::balance(&mut conn, user_id).await?;
    assert_eq!(balance, 7);

    Ok(())
}
