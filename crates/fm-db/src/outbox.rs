//! Durable outbox event store.
//!
//! Rows are written inside business transactions and drained by the relay:
//! `pending → claimed → published`, with `failed` deliveries returning to
//! `pending` (bounded attempts) and exhausting to `dead`. Claims use
//! `FOR UPDATE SKIP LOCKED` so a second relay instance can never grab the
//! same row.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool, Row};

#[derive(Debug, Clone)]
pub struct OutboxEventRow {
    pub event_id: i64,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: Value,
    pub idempotency_key: String,
    pub status: String,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: Value,
    pub idempotency_key: String,
}

/// Insert an event inside the caller's transaction.
///
/// Idempotent: a second insert with the same `idempotency_key` is a no-op
/// that returns the existing row's id.
pub async fn insert_event(conn: &mut PgConnection, ev: &NewOutboxEvent) -> Result<i64> {
    let inserted: Option<(i64,)> = sqlx::query_as(
        r#"
        insert into outbox_events (
          event_type, aggregate_type, aggregate_id, payload, idempotency_key
        ) values (
          $1, $2, $3, $4, $5
        )
        on conflict (idempotency_key) do nothing
        returning event_id
        "#,
    )
    .bind(&ev.event_type)
    .bind(&ev.aggregate_type)
    .bind(&ev.aggregate_id)
    .bind(&ev.payload)
    .bind(&ev.idempotency_key)
    .fetch_optional(&mut *conn)
    .await
    .context("insert_event failed")?;

    if let Some((event_id,)) = inserted {
        return Ok(event_id);
    }

    let (event_id,): (i64,) = sqlx::query_as(
        r#"
        select event_id
        from outbox_events
        where idempotency_key = $1
        "#,
    )
    .bind(&ev.idempotency_key)
    .fetch_one(conn)
    .await
    .context("insert_event existing-row lookup failed")?;

    Ok(event_id)
}

/// Atomically claim up to `batch_size` due rows for exclusive delivery.
///
/// Due means `status = 'pending'` and `next_attempt_at <= now()`. Claimed
/// rows are returned in `event_id` order (per-aggregate commit order).
pub async fn claim_due_batch(
    pool: &PgPool,
    batch_size: i64,
    claimer: &str,
) -> Result<Vec<OutboxEventRow>> {
    let rows = sqlx::query(
        r#"
        with to_claim as (
            select event_id
            from outbox_events
            where status = 'pending'
              and next_attempt_at <= now()
            order by event_id asc
            limit $1
            for update skip locked
        )
        update outbox_events
           set status     = 'claimed',
               claimed_at = now(),
               claimed_by = $2
         where event_id in (select event_id from to_claim)
        returning event_id, event_type, aggregate_type, aggregate_id, payload,
                  idempotency_key, status, attempts, next_attempt_at,
                  claimed_by, claimed_at, created_at
        "#,
    )
    .bind(batch_size)
    .bind(claimer)
    .fetch_all(pool)
    .await
    .context("claim_due_batch failed")?;

    let mut out: Vec<OutboxEventRow> = rows.iter().map(map_event_row).collect::<Result<_>>()?;
    out.sort_by_key(|r| r.event_id);
    Ok(out)
}

/// Terminal success: claimed → published. Published never regresses.
pub async fn mark_published(pool: &PgPool, event_id: i64) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update outbox_events
           set status = 'published'
         where event_id = $1
           and status = 'claimed'
        returning event_id
        "#,
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await
    .context("mark_published failed")?;

    Ok(row.is_some())
}

/// Failed delivery with attempts remaining: claimed → pending, rescheduled.
pub async fn mark_retry(
    pool: &PgPool,
    event_id: i64,
    next_attempt_at: DateTime<Utc>,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update outbox_events
           set status          = 'pending',
               attempts        = attempts + 1,
               next_attempt_at = $2,
               claimed_by      = null,
               claimed_at      = null
         where event_id = $1
           and status = 'claimed'
        returning event_id
        "#,
    )
    .bind(event_id)
    .bind(next_attempt_at)
    .fetch_optional(pool)
    .await
    .context("mark_retry failed")?;

    Ok(row.is_some())
}

/// Attempts exhausted: claimed → dead (terminal). A dead event never blocks
/// later events.
pub async fn mark_dead(pool: &PgPool, event_id: i64) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update outbox_events
           set status   = 'dead',
               attempts = attempts + 1
         where event_id = $1
           and status = 'claimed'
        returning event_id
        "#,
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await
    .context("mark_dead failed")?;

    Ok(row.is_some())
}

/// Crash recovery: rows stuck in `claimed` longer than `claim_ttl_secs` go
/// back to `pending` for the next tick. Returns the number reaped.
pub async fn reap_stale_claims(pool: &PgPool, claim_ttl_secs: i64) -> Result<u64> {
    let res = sqlx::query(
        r#"
        update outbox_events
           set status     = 'pending',
               claimed_by = null,
               claimed_at = null
         where status = 'claimed'
           and claimed_at < now() - make_interval(secs => $1::double precision)
        "#,
    )
    .bind(claim_ttl_secs)
    .execute(pool)
    .await
    .context("reap_stale_claims failed")?;

    Ok(res.rows_affected())
}

pub async fn fetch_by_key(pool: &PgPool, idempotency_key: &str) -> Result<Option<OutboxEventRow>> {
    let row = sqlx::query(
        r#"
        select event_id, event_type, aggregate_type, aggregate_id, payload,
               idempotency_key, status, attempts, next_attempt_at,
               claimed_by, claimed_at, created_at
        from outbox_events
        where idempotency_key = $1
        "#,
    )
    .bind(idempotency_key)
    .fetch_optional(pool)
    .await
    .context("fetch_by_key failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(map_event_row(&row)?))
}

fn map_event_row(row: &sqlx::postgres::PgRow) -> Result<OutboxEventRow> {
    Ok(OutboxEventRow {
        event_id: row.try_get("event_id")?,
        event_type: row.try_get("event_type")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        payload: row.try_get("payload")?,
        idempotency_key: row.try_get("idempotency_key")?,
        status: row.try_get("status")?,
        attempts: row.try_get("attempts")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: row.try_get("claimed_at")?,
        created_at: row.try_get("created_at")?,
    })
}
