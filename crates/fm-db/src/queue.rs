//! Durable job queue store.
//!
//! Ready jobs are claimed with `FOR UPDATE SKIP LOCKED`, priority first and
//! FIFO within a priority class. The partial unique index
//! `uq_queue_live_operation` allows at most one ready-or-active job per
//! operation, which makes enqueue and boot-time restoration idempotent.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QueueJobRow {
    pub seq: i64,
    pub job_id: String,
    pub operation_id: Uuid,
    pub kind: String,
    pub asset_id: String,
    pub owner_id: Uuid,
    pub payload: Value,
    pub priority: i16,
    pub attempts: i32,
    pub status: String,
    pub enqueued_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewQueueJob {
    pub operation_id: Uuid,
    pub kind: String,
    pub asset_id: String,
    pub owner_id: Uuid,
    pub payload: Value,
    pub priority: i16,
}

/// Enqueue a ready job.
///
/// Returns `Some(job_id)` on insert, `None` when a live (ready or active)
/// job already exists for the operation.
pub async fn enqueue(pool: &PgPool, job: &NewQueueJob) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        insert into queue_jobs (
          operation_id, kind, asset_id, owner_id, payload, priority
        ) values (
          $1, $2, $3, $4, $5, $6
        )
        on conflict (operation_id) where status in ('ready', 'active') do nothing
        returning job_id
        "#,
    )
    .bind(job.operation_id)
    .bind(&job.kind)
    .bind(&job.asset_id)
    .bind(job.owner_id)
    .bind(&job.payload)
    .bind(job.priority)
    .fetch_optional(pool)
    .await
    .context("enqueue failed")?;

    Ok(row.map(|(job_id,)| job_id))
}

/// Atomically claim one ready, due job for `worker_id`.
///
/// Priority overrides FIFO: lower priority integer always wins; within a
/// class, oldest enqueue first. Non-blocking — returns `None` when nothing
/// is ready.
pub async fn claim_one(pool: &PgPool, worker_id: &str) -> Result<Option<QueueJobRow>> {
    let row = sqlx::query(
        r#"
        with next_job as (
            select seq
            from queue_jobs
            where status = 'ready'
              and next_attempt_at <= now()
            order by priority asc, enqueued_at asc, seq asc
            limit 1
            for update skip locked
        )
        update queue_jobs
           set status     = 'active',
               claimed_by = $1,
               claimed_at = now()
         where seq in (select seq from next_job)
        returning seq, job_id, operation_id, kind, asset_id, owner_id, payload,
                  priority, attempts, status, enqueued_at, next_attempt_at,
                  claimed_by, claimed_at, last_error
        "#,
    )
    .bind(worker_id)
    .fetch_optional(pool)
    .await
    .context("claim_one failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(map_job_row(&row)?))
}

/// Terminal success: active → done.
pub async fn mark_done(pool: &PgPool, job_id: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update queue_jobs
           set status = 'done'
         where job_id = $1
           and status = 'active'
        returning seq
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await
    .context("mark_done failed")?;

    Ok(row.is_some())
}

/// Retryable failure: active → ready with bumped attempts and a scheduled
/// next attempt.
pub async fn retry_later(
    pool: &PgPool,
    job_id: &str,
    next_attempt_at: DateTime<Utc>,
    error: &str,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update queue_jobs
           set status          = 'ready',
               attempts        = attempts + 1,
               next_attempt_at = $2,
               claimed_by      = null,
               claimed_at      = null,
               last_error      = $3
         where job_id = $1
           and status = 'active'
        returning seq
        "#,
    )
    .bind(job_id)
    .bind(next_attempt_at)
    .bind(error)
    .fetch_optional(pool)
    .await
    .context("retry_later failed")?;

    Ok(row.is_some())
}

/// Attempts exhausted or permanent failure: active → dead.
pub async fn mark_dead(pool: &PgPool, job_id: &str, error: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update queue_jobs
           set status     = 'dead',
               attempts   = attempts + 1,
               last_error = $2
         where job_id = $1
           and status = 'active'
        returning seq
        "#,
    )
    .bind(job_id)
    .bind(error)
    .fetch_optional(pool)
    .await
    .context("mark_dead failed")?;

    Ok(row.is_some())
}

/// Boot-time recovery: any job still `active` belonged to a dead worker
/// process; return them all to `ready`. Returns the number released.
pub async fn release_all_active(pool: &PgPool) -> Result<u64> {
    let res = sqlx::query(
        r#"
        update queue_jobs
           set status     = 'ready',
               claimed_by = null,
               claimed_at = null
         where status = 'active'
        "#,
    )
    .execute(pool)
    .await
    .context("release_all_active failed")?;

    Ok(res.rows_affected())
}

/// The live (ready or active) job for an operation, if any.
pub async fn live_job_for_operation(
    pool: &PgPool,
    operation_id: Uuid,
) -> Result<Option<QueueJobRow>> {
    let row = sqlx::query(
        r#"
        select seq, job_id, operation_id, kind, asset_id, owner_id, payload,
               priority, attempts, status, enqueued_at, next_attempt_at,
               claimed_by, claimed_at, last_error
        from queue_jobs
        where operation_id = $1
          and status in ('ready', 'active')
        "#,
    )
    .bind(operation_id)
    .fetch_optional(pool)
    .await
    .context("live_job_for_operation failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(map_job_row(&row)?))
}

/// Count of ready jobs (daemon status surface).
pub async fn ready_count(pool: &PgPool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
        from queue_jobs
        where status = 'ready'
        "#,
    )
    .fetch_one(pool)
    .await
    .context("ready_count failed")?;

    Ok(n)
}

fn map_job_row(row: &sqlx::postgres::PgRow) -> Result<QueueJobRow> {
    Ok(QueueJobRow {
        seq: row.try_get("seq")?,
        job_id: row.try_get("job_id")?,
        operation_id: row.try_get("operation_id")?,
        kind: row.try_get("kind")?,
        asset_id: row.try_get("asset_id")?,
        owner_id: row.try_get("owner_id")?,
        payload: row.try_get("payload")?,
        priority: row.try_get("priority")?,
        attempts: row.try_get("attempts")?,
        status: row.try_get("status")?,
        enqueued_at: row.try_get("enqueued_at")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: row.try_get("claimed_at")?,
        last_error: row.try_get("last_error")?,
    })
}
