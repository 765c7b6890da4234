//! Boot restoration rebuilds jobs from operation rows — including
//! interrupted `processing` rows — and running it twice changes nothing.

use fm_queue::restore_on_start;
use fm_schemas::{OperationParams, OperationStatus, UserTier};

#[tokio::test]
async fn restore_requeues_pending_and_processing_once() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let _lock = fm_testkit::exclusive_test_lock(&pool).await?;
    fm_testkit::quarantine_queue(&pool).await?;

    let user = fm_testkit::seed_funded_user(&pool, UserTier::Free, 5).await?;
    let asset = fm_testkit::seed_video(&pool, user).await?;

    let pending_op = fm_testkit::seed_pending_operation(
        &pool,
        user,
        &asset,
        &OperationParams::Resize {
            width: 320,
            height: 240,
        },
        Some(1),
    )
    .await?;

    // A convert that was mid-flight when the process died.
    let processing_op = fm_testkit::seed_pending_operation(
        &pool,
        user,
        &asset,
        &OperationParams::Convert {
            target_format: "webm".into(),
            video_codec: Some("libvpx-vp9".into()),
            audio_codec: Some("libopus".into()),
        },
        Some(2),
    )
    .await?;
    {
        let mut conn = pool.acquire().await?;
        let moved = fm_db::operations::transition_status(
            &mut conn,
            processing_op,
            &[OperationStatus::Pending],
            OperationStatus::Processing,
            None,
            None,
        )
        .await?;
        assert!(moved);
    }

    let report = restore_on_start(&pool).await?;
    assert!(report.scanned >= 2);

    let pending_job = fm_db::queue::live_job_for_operation(&pool, pending_op)
        .await?
        .expect("pending op restored");
    assert_eq!(pending_job.status, "ready");

    // Interrupted processing rows are NOT skipped.
    let processing_job = fm_db::queue::live_job_for_operation(&pool, processing_op)
        .await?
        .expect("processing op restored");
    assert_eq!(processing_job.status, "ready");

    // The restored payload carries everything needed to rerun, including the
    // derived codec pair.
    let payload: fm_schemas::JobPayload = serde_json::from_value(processing_job.payload.clone())?;
    match payload.params {
        OperationParams::Convert { video_codec, .. } => {
            assert_eq!(video_codec.as_deref(), Some("libvpx-vp9"));
        }
        other => panic!("unexpected params: {other:?}"),
    }
    assert_eq!(payload.asset_extension, "mp4");

    // Idempotence: a second run enqueues nothing new for these operations.
    let second = restore_on_start(&pool).await?;
    assert!(second.already_live >= 2);

    let first_job_id = pending_job.job_id.clone();
    let still_same = fm_db::queue::live_job_for_operation(&pool, pending_op)
        .await?
        .expect("still live");
    assert_eq!(still_same.job_id, first_job_id);

    Ok(())
}

#[tokio::test]
async fn restore_releases_claims_held_by_dead_process() -> anyhow::Result<()> {
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
        &OperationParams::Resize {
            width: 100,
            height: 100,
        },
        Some(1),
    )
    .await?;
    fm_testkit::enqueue_job_for(&pool, op).await?;

    // A worker claims, then the process dies.
    let job = fm_db::queue::claim_one(&pool, "dead-worker")
        .await?
        .expect("claimable");
    assert_eq!(job.status, "active");

    let report = restore_on_start(&pool).await?;
    assert!(report.released_claims >= 1);

    let live = fm_db::queue::live_job_for_operation(&pool, op)
        .await?
        .expect("job survived the restart");
    assert_eq!(live.status, "ready");

    Ok(())
}
