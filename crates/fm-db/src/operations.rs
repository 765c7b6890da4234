//! Operation rows with a guarded status lifecycle.
//!
//! Transitions are enforced with `update ... where status = any(from)` so
//! concurrent writers race safely: exactly one wins, the loser observes
//! `false` and re-reads.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fm_schemas::{OperationKind, OperationStatus};
use serde_json::Value;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct OperationRow {
    pub operation_id: Uuid,
    pub asset_id: String,
    pub owner_id: Uuid,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub params: Value,
    pub params_fingerprint: String,
    pub result_path: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOperation {
    pub operation_id: Uuid,
    pub asset_id: String,
    pub owner_id: Uuid,
    pub kind: OperationKind,
    pub params: Value,
    pub params_fingerprint: String,
}

/// Insert a pending operation row inside the caller's transaction.
pub async fn insert_operation(conn: &mut PgConnection, op: &NewOperation) -> Result<()> {
    sqlx::query(
        r#"
        insert into operations (
          operation_id, asset_id, owner_id, kind, status, params, params_fingerprint
        ) values (
          $1, $2, $3, $4, 'pending', $5, $6
        )
        "#,
    )
    .bind(op.operation_id)
    .bind(&op.asset_id)
    .bind(op.owner_id)
    .bind(op.kind.as_str())
    .bind(&op.params)
    .bind(&op.params_fingerprint)
    .execute(conn)
    .await
    .context("insert_operation failed")?;

    Ok(())
}

pub async fn fetch_operation(pool: &PgPool, operation_id: Uuid) -> Result<Option<OperationRow>> {
    let sql = select_sql("where operation_id = $1");
    let row = sqlx::query(&sql)
        .bind(operation_id)
        .fetch_optional(pool)
        .await
        .context("fetch_operation failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(map_operation_row(&row)?))
}

/// Idempotency probe: newest non-failed operation with an identical
/// fingerprint for the same asset and kind.
pub async fn find_equivalent(
    pool: &PgPool,
    asset_id: &str,
    kind: OperationKind,
    params_fingerprint: &str,
) -> Result<Option<OperationRow>> {
    let sql = select_sql(
        r#"
        where asset_id = $1
          and kind = $2
          and params_fingerprint = $3
          and status in ('pending', 'processing', 'completed')
        order by created_at desc
        limit 1
        "#,
    );
    let row = sqlx::query(&sql)
    .bind(asset_id)
    .bind(kind.as_str())
    .bind(params_fingerprint)
    .fetch_optional(pool)
    .await
    .context("find_equivalent failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(map_operation_row(&row)?))
}

/// Guarded status transition inside the caller's transaction.
///
/// Returns `true` if a row moved from one of `from` to `to`; `false` when the
/// row is missing or already elsewhere (a concurrent writer won).
pub async fn transition_status(
    conn: &mut PgConnection,
    operation_id: Uuid,
    from: &[OperationStatus],
    to: OperationStatus,
    result_path: Option<&str>,
    error_message: Option<&str>,
) -> Result<bool> {
    let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();

    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update operations
           set status        = $1,
               result_path   = coalesce($2, result_path),
               error_message = coalesce($3, error_message),
               updated_at    = now()
         where operation_id = $4
           and status = any($5)
        returning operation_id
        "#,
    )
    .bind(to.as_str())
    .bind(result_path)
    .bind(error_message)
    .bind(operation_id)
    .bind(&from)
    .fetch_optional(conn)
    .await
    .context("transition_status failed")?;

    Ok(row.is_some())
}

/// Whether a completed operation of `kind` exists for the asset (e.g. the
/// already-extracted precondition for extract_audio).
pub async fn has_completed_kind(
    pool: &PgPool,
    asset_id: &str,
    kind: OperationKind,
) -> Result<bool> {
    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1
            from operations
            where asset_id = $1
              and kind = $2
              and status = 'completed'
        )
        "#,
    )
    .bind(asset_id)
    .bind(kind.as_str())
    .fetch_one(pool)
    .await
    .context("has_completed_kind failed")?;

    Ok(exists)
}

/// Status peek inside the caller's transaction (used after a lost
/// transition race to decide how to proceed).
pub async fn fetch_status(
    conn: &mut PgConnection,
    operation_id: Uuid,
) -> Result<Option<OperationStatus>> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        select status
        from operations
        where operation_id = $1
        "#,
    )
    .bind(operation_id)
    .fetch_optional(conn)
    .await
    .context("fetch_status failed")?;

    match row {
        Some((s,)) => Ok(Some(OperationStatus::parse(&s)?)),
        None => Ok(None),
    }
}

/// Restoration scan: every operation that may still need a job.
pub async fn restorable_operations(pool: &PgPool) -> Result<Vec<OperationRow>> {
    let sql = select_sql(
        r#"
        where status in ('pending', 'processing')
        order by created_at asc
        "#,
    );
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .context("restorable_operations failed")?;

    rows.iter().map(map_operation_row).collect()
}

fn select_sql(suffix: &str) -> String {
    format!(
        r#"
        select operation_id, asset_id, owner_id, kind, status, params,
               params_fingerprint, result_path, error_message,
               created_at, updated_at
        from operations
        {suffix}
        "#
    )
}

fn map_operation_row(row: &sqlx::postgres::PgRow) -> Result<OperationRow> {
    Ok(OperationRow {
        operation_id: row.try_get("operation_id")?,
        asset_id: row.try_get("asset_id")?,
        owner_id: row.try_get("owner_id")?,
        kind: OperationKind::parse(&row.try_get::<String, _>("kind")?)?,
        status: OperationStatus::parse(&row.try_get::<String, _>("status")?)?,
        params: row.try_get("params")?,
        params_fingerprint: row.try_get("params_fingerprint")?,
        result_path: row.try_get("result_path")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
