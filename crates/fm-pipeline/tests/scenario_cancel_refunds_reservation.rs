//! Administrative cancellation: the operation settles failed with reason
//! `cancelled`, the reservation refunds exactly once, and `job.failed` is
//! recorded. Cancelling again is a no-op.

use fm_config::settings::CostSettings;
use fm_pipeline::{CancelOutcome, Pipeline, PipelineError, StartRequest};
use fm_queue::CancelRegistry;
use fm_schemas::{OperationParams, OperationStatus, UserTier};
use uuid::Uuid;

#[tokio::test]
async fn cancel_pending_operation_refunds_once() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let _lock = fm_testkit::exclusive_test_lock(&pool).await?;

    let user = fm_testkit::seed_funded_user(&pool, UserTier::Free, 5).await?;
    let asset = fm_testkit::seed_video(&pool, user).await?;

    let pipeline = Pipeline::new(pool.clone(), CostSettings::default(), CancelRegistry::new());
    let started = pipeline
        .start_operation(&StartRequest {
            user_id: user,
            asset_id: asset,
            params: OperationParams::Watermark {
                text: "cancel me".into(),
                x: 0,
                y: 0,
                font_size: 20,
                color: "red".into(),
                opacity: 1.0,
            },
        })
        .await
        .expect("start succeeds");
    let op_id = started.operation().operation_id;
    assert_eq!(pipeline.balance(user).await.unwrap(), 4);

    let outcome = pipeline.cancel_operation(op_id).await.expect("cancel");
    assert_eq!(outcome, CancelOutcome::Cancelled);

    let op = pipeline.get_operation(op_id).await.expect("fetch");
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.error_message.as_deref(), Some("cancelled"));

    // Net zero over the reservation + refund pair.
    assert_eq!(pipeline.balance(user).await.unwrap(), 5);

    let key = format!("op-{op_id}-failed");
    let event = fm_db::outbox::fetch_by_key(&pool, &key)
        .await?
        .expect("job.failed row");
    assert_eq!(event.payload["error_code"], "cancelled");

    // Second cancel observes the terminal state.
    let again = pipeline.cancel_operation(op_id).await.expect("cancel again");
    assert_eq!(again, CancelOutcome::AlreadyTerminal);

    // Still exactly one settlement row.
    let entries = fm_db::ledger::entries_for_user(&pool, user).await?;
    let settles = entries
        .iter()
        .filter(|e| {
            e.operation_id == Some(op_id)
                && (e.entry_type == "refund" || e.entry_type == "debit_capture")
        })
        .count();
    assert_eq!(settles, 1);

    Ok(())
}

#[tokio::test]
async fn cancel_unknown_operation_is_not_found() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };

    let pipeline = Pipeline::new(pool.clone(), CostSettings::default(), CancelRegistry::new());
    let err = pipeline.cancel_operation(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound));

    Ok(())
}
