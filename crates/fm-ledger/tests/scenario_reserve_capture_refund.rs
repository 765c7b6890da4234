//! Reservation/capture/refund semantics and the balance laws:
//! `reserve; refund` is a no-op on balance, `reserve; capture` debits
//! exactly the reserved amount.

use fm_ledger::{Ledger, ReserveOutcome, SettleOutcome};
use fm_schemas::UserTier;
use uuid::Uuid;

#[tokio::test]
async fn reserve_boundary_at_exact_balance() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let ledger = Ledger::new(pool.clone());

    // balance == amount succeeds…
    let user = fm_testkit::seed_funded_user(&pool, UserTier::Free, 3).await?;
    let out = ledger.reserve(user, Uuid::new_v4(), 3, "exact").await?;
    assert!(matches!(out, ReserveOutcome::Ok { .. }));
    assert_eq!(ledger.balance(user).await?, 0);

    // …balance == amount - 1 does not.
    let poorer = fm_testkit::seed_funded_user(&pool, UserTier::Free, 2).await?;
    let out = ledger.reserve(poorer, Uuid::new_v4(), 3, "too much").await?;
    assert_eq!(
        out,
        ReserveOutcome::InsufficientFunds {
            balance: 2,
            required: 3
        }
    );
    // Failed reservation leaves no trace.
    assert_eq!(ledger.balance(poorer).await?, 2);
    assert_eq!(fm_db::ledger::entries_for_user(&pool, poorer).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn reserve_then_capture_debits_exactly_amount() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let ledger = Ledger::new(pool.clone());

    let user = fm_testkit::seed_funded_user(&pool, UserTier::Pro, 5).await?;
    let op = Uuid::new_v4();

    ledger.reserve(user, op, 2, "capture case").await?;
    assert_eq!(ledger.balance(user).await?, 3);

    let out = ledger.capture(op).await?;
    assert!(matches!(out, SettleOutcome::Ok { .. }));

    // The capture marker is zero-amount: the balance already reflected the
    // debit at reservation time.
    assert_eq!(ledger.balance(user).await?, 3);

    let entries = fm_db::ledger::entries_for_user(&pool, user).await?;
    let capture = entries
        .iter()
        .find(|e| e.entry_type == "debit_capture")
        .expect("capture row");
    assert_eq!(capture.amount, 0);

    Ok(())
}

#[tokio::test]
async fn reserve_then_refund_is_noop_on_balance() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let ledger = Ledger::new(pool.clone());

    let user = fm_testkit::seed_funded_user(&pool, UserTier::Free, 5).await?;
    let op = Uuid::new_v4();

    ledger.reserve(user, op, 2, "refund case").await?;
    assert_eq!(ledger.balance(user).await?, 3);

    let out = ledger.refund(op, "worker failed").await?;
    assert!(matches!(out, SettleOutcome::Ok { .. }));
    assert_eq!(ledger.balance(user).await?, 5);

    Ok(())
}

#[tokio::test]
async fn settlement_is_exclusive_and_idempotent() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let ledger = Ledger::new(pool.clone());

    let user = fm_testkit::seed_funded_user(&pool, UserTier::Free, 5).await?;
    let op = Uuid::new_v4();
    ledger.reserve(user, op, 1, "exclusive").await?;

    assert!(matches!(ledger.capture(op).await?, SettleOutcome::Ok { .. }));
    // Late refund (janitor racing a worker) observes the existing settle.
    assert_eq!(ledger.refund(op, "late").await?, SettleOutcome::AlreadySettled);
    // Repeat capture too.
    assert_eq!(ledger.capture(op).await?, SettleOutcome::AlreadySettled);

    Ok(())
}

#[tokio::test]
async fn double_reserve_rejected() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let ledger = Ledger::new(pool.clone());

    let user = fm_testkit::seed_funded_user(&pool, UserTier::Free, 5).await?;
    let op = Uuid::new_v4();

    assert!(matches!(
        ledger.reserve(user, op, 1, "first").await?,
        ReserveOutcome::Ok { .. }
    ));
    assert_eq!(
        ledger.reserve(user, op, 1, "second").await?,
        ReserveOutcome::AlreadyReserved
    );
    assert_eq!(ledger.balance(user).await?, 4);

    Ok(())
}

#[tokio::test]
async fn settle_without_reservation_is_not_found() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let ledger = Ledger::new(pool.clone());

    assert_eq!(ledger.capture(Uuid::new_v4()).await?, SettleOutcome::NotFound);
    assert_eq!(
        ledger.refund(Uuid::new_v4(), "nothing").await?,
        SettleOutcome::NotFound
    );

    Ok(())
}
