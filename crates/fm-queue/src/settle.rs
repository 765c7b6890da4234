//! Terminal settlement: operation row + ledger + outbox in ONE transaction.
//!
//! If the transaction commits, the world is consistent; if it aborts, no
//! partial state is observable and the janitor has nothing to reconcile but
//! a still-open reservation. The subprocess never runs inside any of these
//! transactions — the worker commits `started` first, executes, then opens
//! the terminal transaction.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::warn;

use fm_db::operations;
use fm_db::outbox::{self, NewOutboxEvent};
use fm_ledger::{capture_in, refund_in, SettleOutcome};
use fm_schemas::events::{event_type, lifecycle_key, LifecyclePayload};
use fm_schemas::{JobPayload, OperationStatus};

/// Outcome of the start transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDisposition {
    /// The operation is ours to execute.
    Run,
    /// The operation is already terminal (cancelled or settled elsewhere);
    /// drop the job without running.
    AlreadyTerminal,
    /// No operation row exists; drop the job.
    Missing,
}

/// Transition `pending → processing` and record `job.started`.
///
/// Interrupted work restored in `processing` state is re-run, not skipped:
/// the transition no-ops but the idempotent outbox insert keeps the event
/// single, and execution proceeds (output paths are deterministic).
pub async fn settle_started(pool: &PgPool, job: &JobPayload) -> Result<StartDisposition> {
    let mut tx = pool.begin().await.context("settle_started begin")?;

    let moved = operations::transition_status(
        &mut tx,
        job.operation_id,
        &[OperationStatus::Pending],
        OperationStatus::Processing,
        None,
        None,
    )
    .await?;

    if !moved {
        match operations::fetch_status(&mut tx, job.operation_id).await? {
            Some(OperationStatus::Processing) => {
                // Interrupted previous run; fall through and re-execute.
            }
            Some(status) if status.is_terminal() => {
                tx.rollback().await.context("settle_started rollback")?;
                return Ok(StartDisposition::AlreadyTerminal);
            }
            Some(_) | None => {
                tx.rollback().await.context("settle_started rollback")?;
                return Ok(StartDisposition::Missing);
            }
        }
    }

    let mut payload = LifecyclePayload::queued(job.operation_id, &job.asset_id, job.owner_id, job.kind);
    payload.status = OperationStatus::Processing;

    outbox::insert_event(
        &mut tx,
        &NewOutboxEvent {
            event_type: event_type::JOB_STARTED.to_string(),
            aggregate_type: "operation".to_string(),
            aggregate_id: job.operation_id.to_string(),
            payload: serde_json::to_value(&payload).context("serialize job.started payload")?,
            idempotency_key: lifecycle_key(job.operation_id, "started"),
        },
    )
    .await?;

    tx.commit().await.context("settle_started commit")?;
    Ok(StartDisposition::Run)
}

/// Success path: `processing → completed`, capture the reservation, record
/// `job.completed`. Returns `false` when a concurrent writer settled the
/// operation first (this worker's result is discarded).
pub async fn settle_completed(pool: &PgPool, job: &JobPayload, result_path: &str) -> Result<bool> {
    let mut tx = pool.begin().await.context("settle_completed begin")?;

    let moved = operations::transition_status(
        &mut tx,
        job.operation_id,
        &[OperationStatus::Processing],
        OperationStatus::Completed,
        Some(result_path),
        None,
    )
    .await?;

    if !moved {
        tx.rollback().await.context("settle_completed rollback")?;
        return Ok(false);
    }

    match capture_in(&mut tx, job.operation_id).await? {
        SettleOutcome::Ok { .. } | SettleOutcome::AlreadySettled => {}
        SettleOutcome::NotFound => {
            // Reservation vanished — accounting hole. Complete the work
            // anyway; the janitor counts this class.
            warn!(operation_id = %job.operation_id, "capture found no reservation");
        }
    }

    let mut payload = LifecyclePayload::queued(job.operation_id, &job.asset_id, job.owner_id, job.kind);
    payload.status = OperationStatus::Completed;
    payload.result_path = Some(result_path.to_string());

    outbox::insert_event(
        &mut tx,
        &NewOutboxEvent {
            event_type: event_type::JOB_COMPLETED.to_string(),
            aggregate_type: "operation".to_string(),
            aggregate_id: job.operation_id.to_string(),
            payload: serde_json::to_value(&payload).context("serialize job.completed payload")?,
            idempotency_key: lifecycle_key(job.operation_id, "completed"),
        },
    )
    .await?;

    tx.commit().await.context("settle_completed commit")?;
    Ok(true)
}

/// Failure path: `{pending, processing} → failed`, refund the reservation,
/// record `job.failed`. Accepts `pending` so administrative cancellation can
/// settle an operation no worker ever claimed.
pub async fn settle_failed(
    pool: &PgPool,
    job: &JobPayload,
    error_message: &str,
    error_code: Option<&str>,
) -> Result<bool> {
    let mut tx = pool.begin().await.context("settle_failed begin")?;

    let moved = operations::transition_status(
        &mut tx,
        job.operation_id,
        &[OperationStatus::Pending, OperationStatus::Processing],
        OperationStatus::Failed,
        None,
        Some(error_message),
    )
    .await?;

    if !moved {
        tx.rollback().await.context("settle_failed rollback")?;
        return Ok(false);
    }

    match refund_in(&mut tx, job.operation_id, error_message).await? {
        SettleOutcome::Ok { .. } | SettleOutcome::AlreadySettled => {}
        SettleOutcome::NotFound => {
            warn!(operation_id = %job.operation_id, "refund found no reservation");
        }
    }

    let mut payload = LifecyclePayload::queued(job.operation_id, &job.asset_id, job.owner_id, job.kind);
    payload.status = OperationStatus::Failed;
    payload.error_message = Some(error_message.to_string());
    payload.error_code = error_code.map(str::to_string);

    outbox::insert_event(
        &mut tx,
        &NewOutboxEvent {
            event_type: event_type::JOB_FAILED.to_string(),
            aggregate_type: "operation".to_string(),
            aggregate_id: job.operation_id.to_string(),
            payload: serde_json::to_value(&payload).context("serialize job.failed payload")?,
            idempotency_key: lifecycle_key(job.operation_id, "failed"),
        },
    )
    .await?;

    tx.commit().await.context("settle_failed commit")?;
    Ok(true)
}
