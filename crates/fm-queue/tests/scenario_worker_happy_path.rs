//! Happy path through the worker pool: claim, execute, settle completed in
//! one transaction (operation + capture + outbox), job marked done.

use std::sync::Arc;

use fm_config::settings::WorkerSettings;
use fm_queue::{CancelRegistry, ProgressBus, WorkerPool};
use fm_schemas::{OperationParams, OperationStatus, UserTier};
use fm_testkit::{FakeOutcome, FakeRunner};

fn fast_settings(concurrency: usize) -> WorkerSettings {
    WorkerSettings {
        concurrency,
        poll_interval_ms: 25,
        max_attempts: 3,
        backoff_base_secs: 0,
        backoff_cap_secs: 0,
    }
}

#[tokio::test]
async fn worker_completes_job_and_captures_reservation() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let _lock = fm_testkit::exclusive_test_lock(&pool).await?;
    fm_testkit::quarantine_queue(&pool).await?;

    let user = fm_testkit::seed_funded_user(&pool, UserTier::Pro, 5).await?;
    let asset = fm_testkit::seed_video(&pool, user).await?;
    let op = fm_testkit::seed_pending_operation(
        &pool,
        user,
        &asset,
        &OperationParams::Resize {
            width: 800,
            height: 600,
        },
        Some(1),
    )
    .await?;
    fm_testkit::enqueue_job_for(&pool, op).await?;

    let runner = Arc::new(FakeRunner::always(FakeOutcome::Succeed));
    let progress = ProgressBus::default();
    let mut progress_rx = progress.subscribe();

    let handle = WorkerPool::new(
        pool.clone(),
        Arc::clone(&runner),
        fast_settings(2),
        progress,
        CancelRegistry::new(),
    )
    .start();

    let done = fm_testkit::wait_until(5_000, || {
        let pool = pool.clone();
        async move {
            fm_db::operations::fetch_operation(&pool, op)
                .await
                .ok()
                .flatten()
                .map(|o| o.status == OperationStatus::Completed)
                .unwrap_or(false)
        }
    })
    .await;
    handle.shutdown().await;
    assert!(done, "operation never completed");

    let op_row = fm_db::operations::fetch_operation(&pool, op).await?.unwrap();
    assert_eq!(
        op_row.result_path.as_deref(),
        Some(format!("storage/{asset}/fake-output").as_str())
    );
    assert_eq!(runner.runs(), 1);

    // Ledger: reservation still debited, capture is the zero marker.
    let entries = fm_db::ledger::entries_for_user(&pool, user).await?;
    let capture = entries
        .iter()
        .find(|e| e.entry_type == "debit_capture" && e.operation_id == Some(op))
        .expect("capture row");
    assert_eq!(capture.amount, 0);
    assert_eq!(fm_db::ledger::balance_of(&pool, user).await?, 4);

    // Outbox: started + completed recorded with their stage keys.
    for stage in ["started", "completed"] {
        let key = format!("op-{op}-{stage}");
        assert!(
            fm_db::outbox::fetch_by_key(&pool, &key).await?.is_some(),
            "missing outbox row for {stage}"
        );
    }

    // Queue row terminal.
    assert!(fm_db::queue::live_job_for_operation(&pool, op).await?.is_none());

    // Progress was reported along the way.
    let mut saw_progress = false;
    while let Ok(update) = progress_rx.try_recv() {
        if update.operation_id == op {
            saw_progress = true;
        }
    }
    assert!(saw_progress, "no progress updates observed");

    Ok(())
}

#[tokio::test]
async fn permanent_failure_settles_failed_and_refunds() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let _lock = fm_testkit::exclusive_test_lock(&pool).await?;
    fm_testkit::quarantine_queue(&pool).await?;

    let user = fm_testkit::seed_funded_user(&pool, UserTier::Free, 5).await?;
    let asset = fm_testkit::seed_video(&pool, user).await?;
    let op = fm_testkit::seed_pending_operation(
        &pool,
        user,
        &asset,
        &OperationParams::Trim {
            start_sec: 1.0,
            end_sec: 2.0,
        },
        Some(1),
    )
    .await?;
    fm_testkit::enqueue_job_for(&pool, op).await?;

    let runner = Arc::new(FakeRunner::always(FakeOutcome::FailPermanent("corrupt input")));
    let handle = WorkerPool::new(
        pool.clone(),
        Arc::clone(&runner),
        fast_settings(1),
        ProgressBus::default(),
        CancelRegistry::new(),
    )
    .start();

    let failed = fm_testkit::wait_until(5_000, || {
        let pool = pool.clone();
        async move {
            fm_db::operations::fetch_operation(&pool, op)
                .await
                .ok()
                .flatten()
                .map(|o| o.status == OperationStatus::Failed)
                .unwrap_or(false)
        }
    })
    .await;
    handle.shutdown().await;
    assert!(failed, "operation never failed");

    // No retry for permanent failures.
    assert_eq!(runner.runs(), 1);

    let op_row = fm_db::operations::fetch_operation(&pool, op).await?.unwrap();
    assert_eq!(op_row.error_message.as_deref(), Some("corrupt input"));

    // Refund makes the pair net zero.
    assert_eq!(fm_db::ledger::balance_of(&pool, user).await?, 5);

    let key = format!("op-{op}-failed");
    assert!(fm_db::outbox::fetch_by_key(&pool, &key).await?.is_some());

    Ok(())
}
