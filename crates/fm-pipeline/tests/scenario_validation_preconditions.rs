//! Semantic preconditions: crop bounds against the image, convert target
//! vs current extension, asset-kind applicability, ownership.

use fm_config::settings::CostSettings;
use fm_pipeline::{Pipeline, PipelineError, StartRequest};
use fm_queue::CancelRegistry;
use fm_schemas::{OperationParams, UserTier};

async fn pipeline_with_fixtures(
    pool: &sqlx::PgPool,
) -> anyhow::Result<(Pipeline, uuid::Uuid, String, String)> {
    let user = fm_testkit::seed_funded_user(pool, UserTier::Free, 10).await?;
    let video = fm_testkit::seed_video(pool, user).await?; // 1920x1080 mp4
    let image = fm_testkit::seed_image(pool, user).await?; // 1000x800 jpg
    let pipeline = Pipeline::new(pool.clone(), CostSettings::default(), CancelRegistry::new());
    Ok((pipeline, user, video, image))
}

fn assert_validation(err: PipelineError, needle: &str) {
    match err {
        PipelineError::Validation(msg) => {
            assert!(msg.contains(needle), "message {msg:?} missing {needle:?}")
        }
        other => panic!("expected Validation, got {other}"),
    }
}

#[tokio::test]
async fn crop_bounds_are_inclusive_at_the_edge() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let _lock = fm_testkit::exclusive_test_lock(&pool).await?;
    let (pipeline, user, _video, image) = pipeline_with_fixtures(&pool).await?;

    // x + width == image.width succeeds.
    let ok = pipeline
        .start_operation(&StartRequest {
            user_id: user,
            asset_id: image.clone(),
            params: OperationParams::Crop {
                width: 1000,
                height: 800,
                x: 0,
                y: 0,
            },
        })
        .await;
    assert!(ok.is_ok());

    // x + width == image.width + 1 fails.
    let err = pipeline
        .start_operation(&StartRequest {
            user_id: user,
            asset_id: image,
            params: OperationParams::Crop {
                width: 1000,
                height: 800,
                x: 1,
                y: 0,
            },
        })
        .await
        .unwrap_err();
    assert_validation(err, "width");

    Ok(())
}

#[tokio::test]
async fn convert_to_current_extension_rejected() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let _lock = fm_testkit::exclusive_test_lock(&pool).await?;
    let (pipeline, user, video, _image) = pipeline_with_fixtures(&pool).await?;

    let err = pipeline
        .start_operation(&StartRequest {
            user_id: user,
            asset_id: video.clone(),
            params: OperationParams::Convert {
                target_format: "mp4".into(),
                video_codec: None,
                audio_codec: None,
            },
        })
        .await
        .unwrap_err();
    assert_validation(err, "already");

    // Case-insensitive: MP4 == mp4.
    let err = pipeline
        .start_operation(&StartRequest {
            user_id: user,
            asset_id: video,
            params: OperationParams::Convert {
                target_format: "MP4".into(),
                video_codec: None,
                audio_codec: None,
            },
        })
        .await
        .unwrap_err();
    assert_validation(err, "already");

    Ok(())
}

#[tokio::test]
async fn video_only_kinds_rejected_for_images() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let _lock = fm_testkit::exclusive_test_lock(&pool).await?;
    let (pipeline, user, video, image) = pipeline_with_fixtures(&pool).await?;

    let err = pipeline
        .start_operation(&StartRequest {
            user_id: user,
            asset_id: image,
            params: OperationParams::Gif {
                fps: 10.0,
                width: 320,
                start_sec: 0.0,
                duration_sec: 2.0,
            },
        })
        .await
        .unwrap_err();
    assert_validation(err, "does not apply");

    // And image-only kinds for videos.
    let err = pipeline
        .start_operation(&StartRequest {
            user_id: user,
            asset_id: video,
            params: OperationParams::Crop {
                width: 100,
                height: 100,
                x: 0,
                y: 0,
            },
        })
        .await
        .unwrap_err();
    assert_validation(err, "does not apply");

    Ok(())
}

#[tokio::test]
async fn trim_with_end_before_start_rejected() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let _lock = fm_testkit::exclusive_test_lock(&pool).await?;
    let (pipeline, user, video, _image) = pipeline_with_fixtures(&pool).await?;

    let err = pipeline
        .start_operation(&StartRequest {
            user_id: user,
            asset_id: video,
            params: OperationParams::Trim {
                start_sec: 10.0,
                end_sec: 10.0,
            },
        })
        .await
        .unwrap_err();
    assert_validation(err, "after");

    Ok(())
}

#[tokio::test]
async fn foreign_asset_is_not_owned() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let _lock = fm_testkit::exclusive_test_lock(&pool).await?;
    let (pipeline, _owner, video, _image) = pipeline_with_fixtures(&pool).await?;

    let stranger = fm_testkit::seed_funded_user(&pool, UserTier::Free, 10).await?;
    let err = pipeline
        .start_operation(&StartRequest {
            user_id: stranger,
            asset_id: video,
            params: OperationParams::Resize {
                width: 100,
                height: 100,
            },
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotOwned));

    // No charge for the rejected caller.
    assert_eq!(pipeline.balance(stranger).await.unwrap(), 10);

    Ok(())
}

#[tokio::test]
async fn unknown_asset_is_not_found() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let (pipeline, user, _video, _image) = pipeline_with_fixtures(&pool).await?;

    let err = pipeline
        .start_operation(&StartRequest {
            user_id: user,
            asset_id: "feedfacecafe".into(),
            params: OperationParams::Resize {
                width: 100,
                height: 100,
            },
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotFound));

    Ok(())
}
