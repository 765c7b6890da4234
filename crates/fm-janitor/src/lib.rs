//! Reservation janitor: reconcile orphaned ledger reservations.
//!
//! A reservation is orphaned when neither a capture nor a refund ever
//! landed — crash between transactions, lost job, dead worker. The sweep is
//! deterministic over a snapshot of orphans and settles each one according
//! to the matching operation's state. All releases go through the ledger's
//! idempotent `refund`, so racing a late worker settle is safe: the first
//! writer wins, the second observes `already_settled`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use fm_config::settings::{JanitorSettings, SuspiciousPolicy};
use fm_db::ledger::{orphan_reservations, LedgerEntryRow};
use fm_db::operations::fetch_operation;
use fm_ledger::{Ledger, SettleOutcome};
use fm_schemas::OperationStatus;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub ttl: chrono::Duration,
    pub grace: chrono::Duration,
    pub on_suspicious: SuspiciousPolicy,
    pub interval: Duration,
}

impl JanitorConfig {
    pub fn from_settings(s: &JanitorSettings) -> Self {
        Self {
            ttl: chrono::Duration::minutes(s.ttl_minutes),
            grace: chrono::Duration::minutes(s.grace_minutes()),
            on_suspicious: s.on_suspicious,
            interval: Duration::from_secs(s.interval_minutes * 60),
        }
    }
}

/// Per-run metrics, logged after every sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JanitorReport {
    pub reservations_checked: usize,
    pub released: usize,
    pub skipped: usize,
    pub suspicious: usize,
    pub captured: usize,
}

/// One sweep over reservations older than TTL with no settlement.
pub async fn sweep(pool: &PgPool, cfg: &JanitorConfig) -> Result<JanitorReport> {
    let now = Utc::now();
    let cutoff = now - cfg.ttl;
    let orphans = orphan_reservations(pool, cutoff).await?;

    let ledger = Ledger::new(pool.clone());
    let mut report = JanitorReport::default();

    for reservation in orphans {
        report.reservations_checked += 1;
        if let Err(e) = reconcile_one(pool, &ledger, cfg, &reservation, &mut report, now).await {
            // One bad reservation must not stall the sweep.
            error!(
                entry_id = reservation.entry_id,
                error = %format!("{e:#}"),
                "reconcile failed; continuing"
            );
        }
    }

    info!(
        reservations_checked = report.reservations_checked,
        released = report.released,
        skipped = report.skipped,
        suspicious = report.suspicious,
        captured = report.captured,
        "janitor sweep complete"
    );

    Ok(report)
}

async fn reconcile_one(
    pool: &PgPool,
    ledger: &Ledger,
    cfg: &JanitorConfig,
    reservation: &LedgerEntryRow,
    report: &mut JanitorReport,
    now: chrono::DateTime<Utc>,
) -> Result<()> {
    let Some(operation_id) = reservation.operation_id else {
        warn!(entry_id = reservation.entry_id, "reservation without operation_id");
        report.skipped += 1;
        return Ok(());
    };

    let op = fetch_operation(pool, operation_id).await?;

    match op {
        None => {
            // The enqueue transaction inserts the operation row alongside
            // the reservation, so this means the row was deleted. Release.
            release(ledger, operation_id, "orphaned reservation: no operation row", report).await
        }

        Some(op) if op.status == OperationStatus::Completed => {
            // Completed work with no capture: accounting hole. Policy
            // decides which side of the revenue/PR trade-off wins.
            report.suspicious += 1;
            error!(
                operation_id = %operation_id,
                "suspicious: operation completed but reservation never captured"
            );
            match cfg.on_suspicious {
                SuspiciousPolicy::Release => {
                    release(ledger, operation_id, "suspicious: completed without capture", report)
                        .await
                }
                SuspiciousPolicy::Capture => {
                    if let SettleOutcome::Ok { .. } = ledger.capture(operation_id).await? {
                        report.captured += 1;
                    }
                    Ok(())
                }
            }
        }

        Some(op) if op.status == OperationStatus::Failed => {
            release(ledger, operation_id, "failed operation left open reservation", report).await
        }

        Some(_) => {
            // Pending or processing: possibly still active. Only a
            // reservation past TTL + GRACE is treated as stuck.
            let age = now - reservation.created_at;
            if age > cfg.ttl + cfg.grace {
                release(ledger, operation_id, "stuck operation past grace window", report).await
            } else {
                report.skipped += 1;
                Ok(())
            }
        }
    }
}

async fn release(
    ledger: &Ledger,
    operation_id: uuid::Uuid,
    reason: &str,
    report: &mut JanitorReport,
) -> Result<()> {
    match ledger.refund(operation_id, reason).await? {
        SettleOutcome::Ok { .. } => {
            report.released += 1;
        }
        SettleOutcome::AlreadySettled => {
            // Lost the race to a late worker settle; nothing to do.
            report.skipped += 1;
        }
        SettleOutcome::NotFound => {
            warn!(operation_id = %operation_id, "reservation vanished mid-sweep");
            report.skipped += 1;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Periodic task
// ---------------------------------------------------------------------------

pub struct JanitorHandle {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl JanitorHandle {
    pub async fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.task.await;
    }
}

/// Spawn the periodic sweep.
pub fn start(pool: PgPool, cfg: JanitorConfig) -> JanitorHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let interval_secs = cfg.interval.as_secs();
    let task = {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cfg.interval);
            while !stop.load(Ordering::SeqCst) {
                ticker.tick().await;
                if let Err(e) = sweep(&pool, &cfg).await {
                    error!(error = %format!("{e:#}"), "janitor sweep failed");
                }
            }
        })
    };

    info!(interval_secs, "janitor started");
    JanitorHandle { stop, task }
}
