//! Append-only ledger entry store.
//!
//! Rows are never updated or deleted. The reservation/settlement protocol
//! rides on two partial unique indexes:
//!
//! - `uq_ledger_reservation` — at most one reservation per operation
//! - `uq_ledger_settle`      — at most one of {debit_capture, refund} per
//!                             operation (terminal settlement is exclusive)
//!
//! Outcome mapping (insufficient funds, already settled, ...) lives in
//! `fm-ledger`; this module is SQL only.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

pub const UQ_RESERVATION: &str = "uq_ledger_reservation";
pub const UQ_SETTLE: &str = "uq_ledger_settle";

pub mod entry_type {
    pub const RESERVATION: &str = "reservation";
    pub const DEBIT_CAPTURE: &str = "debit_capture";
    pub const REFUND: &str = "refund";
    pub const ADDITION: &str = "addition";
    pub const ADJUSTMENT: &str = "adjustment";
}

#[derive(Debug, Clone)]
pub struct LedgerEntryRow {
    pub entry_id: i64,
    pub user_id: Uuid,
    pub operation_id: Option<Uuid>,
    pub amount: i64,
    pub entry_type: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub user_id: Uuid,
    pub operation_id: Option<Uuid>,
    pub amount: i64,
    pub entry_type: &'static str,
    pub description: String,
}

/// Take a `FOR UPDATE` lock on the user's account row. Returns `false` when
/// the user does not exist. Serializes concurrent balance checks for the
/// same user until the surrounding transaction commits.
pub async fn lock_user(conn: &mut PgConnection, user_id: Uuid) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        select user_id
        from users
        where user_id = $1
        for update
        "#,
    )
    .bind(user_id)
    .fetch_optional(conn)
    .await
    .context("lock_user failed")?;

    Ok(row.is_some())
}

/// Balance inside the caller's transaction (sees its own uncommitted rows).
pub async fn balance(conn: &mut PgConnection, user_id: Uuid) -> Result<i64> {
    let (sum,): (i64,) = sqlx::query_as(
        r#"
        select coalesce(sum(amount), 0)::bigint
        from ledger_entries
        where user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_one(conn)
    .await
    .context("balance failed")?;

    Ok(sum)
}

/// Snapshot-consistent balance read off the pool.
pub async fn balance_of(pool: &PgPool, user_id: Uuid) -> Result<i64> {
    let mut conn = pool.acquire().await.context("acquire for balance_of")?;
    balance(&mut conn, user_id).await
}

/// Raw append. Unique violations surface as `sqlx::Error`; callers map them
/// with [`crate::is_unique_violation`] against [`UQ_RESERVATION`] /
/// [`UQ_SETTLE`].
pub async fn insert_entry(
    conn: &mut PgConnection,
    entry: &NewLedgerEntry,
) -> Result<i64, sqlx::Error> {
    let (entry_id,): (i64,) = sqlx::query_as(
        r#"
        insert into ledger_entries (user_id, operation_id, amount, entry_type, description)
        values ($1, $2, $3, $4, $5)
        returning entry_id
        "#,
    )
    .bind(entry.user_id)
    .bind(entry.operation_id)
    .bind(entry.amount)
    .bind(entry.entry_type)
    .bind(&entry.description)
    .fetch_one(conn)
    .await?;

    Ok(entry_id)
}

pub async fn find_reservation(
    conn: &mut PgConnection,
    operation_id: Uuid,
) -> Result<Option<LedgerEntryRow>> {
    let row = sqlx::query(
        r#"
        select entry_id, user_id, operation_id, amount, entry_type, description, created_at
        from ledger_entries
        where operation_id = $1
          and entry_type = 'reservation'
        "#,
    )
    .bind(operation_id)
    .fetch_optional(conn)
    .await
    .context("find_reservation failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(map_entry_row(&row)?))
}

pub async fn find_settlement(
    conn: &mut PgConnection,
    operation_id: Uuid,
) -> Result<Option<LedgerEntryRow>> {
    let row = sqlx::query(
        r#"
        select entry_id, user_id, operation_id, amount, entry_type, description, created_at
        from ledger_entries
        where operation_id = $1
          and entry_type in ('debit_capture', 'refund')
        "#,
    )
    .bind(operation_id)
    .fetch_optional(conn)
    .await
    .context("find_settlement failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(map_entry_row(&row)?))
}

pub async fn entries_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<LedgerEntryRow>> {
    let rows = sqlx::query(
        r#"
        select entry_id, user_id, operation_id, amount, entry_type, description, created_at
        from ledger_entries
        where user_id = $1
        order by entry_id asc
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("entries_for_user failed")?;

    rows.iter().map(map_entry_row).collect()
}

/// Janitor query: reservations created before `cutoff` with no settlement
/// row, oldest first.
pub async fn orphan_reservations(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<LedgerEntryRow>> {
    let rows = sqlx::query(
        r#"
        select r.entry_id, r.user_id, r.operation_id, r.amount, r.entry_type,
               r.description, r.created_at
        from ledger_entries r
        where r.entry_type = 'reservation'
          and r.created_at < $1
          and not exists (
              select 1
              from ledger_entries s
              where s.operation_id = r.operation_id
                and s.entry_type in ('debit_capture', 'refund')
          )
        order by r.created_at asc
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("orphan_reservations failed")?;

    rows.iter().map(map_entry_row).collect()
}

fn map_entry_row(row: &sqlx::postgres::PgRow) -> Result<LedgerEntryRow> {
    Ok(LedgerEntryRow {
        entry_id: row.try_get("entry_id")?,
        user_id: row.try_get("user_id")?,
        operation_id: row.try_get("operation_id")?,
        amount: row.try_get("amount")?,
        entry_type: row.try_get("entry_type")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}
