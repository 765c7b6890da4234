//! Credit ledger with explicit reservation / capture / refund.
//!
//! A single append-only entry log is the source of truth; the balance is
//! always `sum(amount)`. A reservation debits immediately (negative row), so
//! a user's visible balance already reflects pending charges. Capture is a
//! zero-amount marker terminating the reservation; refund mirrors the
//! reservation amount back. Exclusivity rides on two partial unique indexes,
//! not application checks:
//!
//! - at most one `reservation` row per operation
//! - at most one of {`debit_capture`, `refund`} per operation
//!
//! The `*_in` functions run inside a caller-supplied connection so the
//! pipeline and workers can fold ledger writes into their own transactions.
//! [`Ledger`] wraps a pool for standalone use.

use anyhow::{bail, Context, Result};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use fm_db::ledger::{self, entry_type, NewLedgerEntry, UQ_RESERVATION, UQ_SETTLE};
use fm_db::is_unique_violation;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Ok { entry_id: i64 },
    InsufficientFunds { balance: i64, required: i64 },
    AlreadyReserved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    Ok { entry_id: i64 },
    /// No reservation exists for the operation.
    NotFound,
    /// A capture or refund already landed; terminal settlement is exclusive.
    AlreadySettled,
}

// ---------------------------------------------------------------------------
// Transactional surface
// ---------------------------------------------------------------------------

/// Reserve `amount` credits for an operation inside the caller's
/// transaction.
///
/// Locks the user's account row, recomputes the balance, and appends a
/// negative `reservation` entry. The row lock serializes concurrent reserves
/// for the same user, closing the check-then-debit race.
pub async fn reserve_in(
    conn: &mut PgConnection,
    user_id: Uuid,
    operation_id: Uuid,
    amount: i64,
    description: &str,
) -> Result<ReserveOutcome> {
    if amount <= 0 {
        bail!("reserve amount must be > 0, got {amount}");
    }

    if !ledger::lock_user(conn, user_id).await? {
        bail!("reserve for unknown user {user_id}");
    }

    let balance = ledger::balance(conn, user_id).await?;
    if balance < amount {
        return Ok(ReserveOutcome::InsufficientFunds {
            balance,
            required: amount,
        });
    }

    let entry = NewLedgerEntry {
        user_id,
        operation_id: Some(operation_id),
        amount: -amount,
        entry_type: entry_type::RESERVATION,
        description: description.to_string(),
    };

    match ledger::insert_entry(conn, &entry).await {
        Ok(entry_id) => Ok(ReserveOutcome::Ok { entry_id }),
        Err(e) if is_unique_violation(&e, UQ_RESERVATION) => Ok(ReserveOutcome::AlreadyReserved),
        Err(e) => Err(anyhow::Error::new(e).context("reserve insert failed")),
    }
}

/// Capture a reservation inside the caller's transaction: a zero-amount
/// `debit_capture` marker (the reservation already debited the balance).
pub async fn capture_in(conn: &mut PgConnection, operation_id: Uuid) -> Result<SettleOutcome> {
    let Some(reservation) = ledger::find_reservation(conn, operation_id).await? else {
        return Ok(SettleOutcome::NotFound);
    };

    if ledger::find_settlement(conn, operation_id).await?.is_some() {
        return Ok(SettleOutcome::AlreadySettled);
    }

    let entry = NewLedgerEntry {
        user_id: reservation.user_id,
        operation_id: Some(operation_id),
        amount: 0,
        entry_type: entry_type::DEBIT_CAPTURE,
        description: format!("capture of reservation {}", reservation.entry_id),
    };

    match ledger::insert_entry(conn, &entry).await {
        Ok(entry_id) => Ok(SettleOutcome::Ok { entry_id }),
        // Backstop for the check/insert race; the index is authoritative.
        Err(e) if is_unique_violation(&e, UQ_SETTLE) => Ok(SettleOutcome::AlreadySettled),
        Err(e) => Err(anyhow::Error::new(e).context("capture insert failed")),
    }
}

/// Refund a reservation inside the caller's transaction: a positive entry
/// mirroring the reservation, net zero over the pair.
pub async fn refund_in(
    conn: &mut PgConnection,
    operation_id: Uuid,
    reason: &str,
) -> Result<SettleOutcome> {
    let Some(reservation) = ledger::find_reservation(conn, operation_id).await? else {
        return Ok(SettleOutcome::NotFound);
    };

    if ledger::find_settlement(conn, operation_id).await?.is_some() {
        return Ok(SettleOutcome::AlreadySettled);
    }

    let entry = NewLedgerEntry {
        user_id: reservation.user_id,
        operation_id: Some(operation_id),
        amount: reservation.amount.abs(),
        entry_type: entry_type::REFUND,
        description: reason.to_string(),
    };

    match ledger::insert_entry(conn, &entry).await {
        Ok(entry_id) => Ok(SettleOutcome::Ok { entry_id }),
        Err(e) if is_unique_violation(&e, UQ_SETTLE) => Ok(SettleOutcome::AlreadySettled),
        Err(e) => Err(anyhow::Error::new(e).context("refund insert failed")),
    }
}

/// Append a positive `addition` entry (credits purchased or granted); not
/// tied to any operation.
pub async fn credit_in(
    conn: &mut PgConnection,
    user_id: Uuid,
    amount: i64,
    description: &str,
) -> Result<i64> {
    if amount <= 0 {
        bail!("credit amount must be > 0, got {amount}");
    }

    let entry = NewLedgerEntry {
        user_id,
        operation_id: None,
        amount,
        entry_type: entry_type::ADDITION,
        description: description.to_string(),
    };

    ledger::insert_entry(conn, &entry)
        .await
        .context("credit insert failed")
}

// ---------------------------------------------------------------------------
// Pool wrapper
// ---------------------------------------------------------------------------

/// Standalone ledger handle: each call is its own transaction.
#[derive(Clone)]
pub struct Ledger {
    pool: PgPool,
}

impl Ledger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn reserve(
        &self,
        user_id: Uuid,
        operation_id: Uuid,
        amount: i64,
        description: &str,
    ) -> Result<ReserveOutcome> {
        let mut tx = self.pool.begin().await.context("reserve begin")?;
        let out = reserve_in(&mut tx, user_id, operation_id, amount, description).await?;
        if matches!(out, ReserveOutcome::Ok { .. }) {
            tx.commit().await.context("reserve commit")?;
        } else {
            tx.rollback().await.context("reserve rollback")?;
        }
        Ok(out)
    }

    pub async fn capture(&self, operation_id: Uuid) -> Result<SettleOutcome> {
        let mut tx = self.pool.begin().await.context("capture begin")?;
        let out = capture_in(&mut tx, operation_id).await?;
        if matches!(out, SettleOutcome::Ok { .. }) {
            tx.commit().await.context("capture commit")?;
        } else {
            tx.rollback().await.context("capture rollback")?;
        }
        Ok(out)
    }

    pub async fn refund(&self, operation_id: Uuid, reason: &str) -> Result<SettleOutcome> {
        let mut tx = self.pool.begin().await.context("refund begin")?;
        let out = refund_in(&mut tx, operation_id, reason).await?;
        if matches!(out, SettleOutcome::Ok { .. }) {
            tx.commit().await.context("refund commit")?;
        } else {
            tx.rollback().await.context("refund rollback")?;
        }
        Ok(out)
    }

    pub async fn credit(&self, user_id: Uuid, amount: i64, description: &str) -> Result<i64> {
        let mut tx = self.pool.begin().await.context("credit begin")?;
        let entry_id = credit_in(&mut tx, user_id, amount, description).await?;
        tx.commit().await.context("credit commit")?;
        Ok(entry_id)
    }

    /// Snapshot-consistent balance: `sum(amount)` over all committed entries.
    pub async fn balance(&self, user_id: Uuid) -> Result<i64> {
        ledger::balance_of(&self.pool, user_id).await
    }
}
