//! In-process router scenarios via tower::ServiceExt::oneshot — no listener,
//! no background loops.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use fm_config::settings::CostSettings;
use fm_daemon::{routes, state::AppState};
use fm_pipeline::Pipeline;
use fm_queue::CancelRegistry;
use fm_schemas::UserTier;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn test_state(pool: &sqlx::PgPool) -> Arc<AppState> {
    let pipeline = Pipeline::new(pool.clone(), CostSettings::default(), CancelRegistry::new());
    Arc::new(AppState::new(pool.clone(), pipeline))
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_route_is_static() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };

    let app = routes::build_router(test_state(&pool).await);
    let resp = app
        .oneshot(Request::builder().uri("/v1/health").body(Body::empty()).unwrap())
        .await?;

    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["service"], "fm-daemon");

    Ok(())
}

#[tokio::test]
async fn start_operation_over_http_reserves_and_returns_row() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let _lock = fm_testkit::exclusive_test_lock(&pool).await?;

    let user = fm_testkit::seed_funded_user(&pool, UserTier::Free, 5).await?;
    let asset = fm_testkit::seed_video(&pool, user).await?;
    let state = test_state(&pool).await;

    let resp = routes::build_router(Arc::clone(&state))
        .oneshot(post_json(
            "/v1/operations",
            json!({
                "user_id": user,
                "asset_id": asset,
                "kind": "resize",
                "width": 800,
                "height": 600,
            }),
        ))
        .await?;

    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "pending");
    assert_eq!(body["kind"], "resize");
    let op_id = body["operation_id"].as_str().unwrap().to_string();

    // Balance reflects the reservation.
    let resp = routes::build_router(Arc::clone(&state))
        .oneshot(
            Request::builder()
                .uri(format!("/v1/users/{user}/balance"))
                .body(Body::empty())
                .unwrap(),
        )
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["balance"], 4);

    // Duplicate request returns the same operation with 200, not 201.
    let resp = routes::build_router(Arc::clone(&state))
        .oneshot(post_json(
            "/v1/operations",
            json!({
                "user_id": user,
                "asset_id": asset,
                "kind": "resize",
                "width": 800,
                "height": 600,
            }),
        ))
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["operation_id"].as_str().unwrap(), op_id);

    Ok(())
}

#[tokio::test]
async fn failure_kinds_map_to_status_codes() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let _lock = fm_testkit::exclusive_test_lock(&pool).await?;

    let user = fm_testkit::seed_funded_user(&pool, UserTier::Free, 0).await?;
    let asset = fm_testkit::seed_video(&pool, user).await?;
    let state = test_state(&pool).await;

    // Insufficient funds → 402.
    let resp = routes::build_router(Arc::clone(&state))
        .oneshot(post_json(
            "/v1/operations",
            json!({
                "user_id": user,
                "asset_id": asset,
                "kind": "resize",
                "width": 100,
                "height": 100,
            }),
        ))
        .await?;
    assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body_json(resp).await["kind"], "insufficient_funds");

    // Validation → 422.
    let resp = routes::build_router(Arc::clone(&state))
        .oneshot(post_json(
            "/v1/operations",
            json!({
                "user_id": user,
                "asset_id": asset,
                "kind": "trim",
                "start_sec": 5.0,
                "end_sec": 5.0,
            }),
        ))
        .await?;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(resp).await["kind"], "validation");

    // Foreign asset → 403.
    let stranger = fm_testkit::seed_funded_user(&pool, UserTier::Free, 5).await?;
    let resp = routes::build_router(Arc::clone(&state))
        .oneshot(post_json(
            "/v1/operations",
            json!({
                "user_id": stranger,
                "asset_id": asset,
                "kind": "resize",
                "width": 100,
                "height": 100,
            }),
        ))
        .await?;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    // Unknown operation → 404.
    let resp = routes::build_router(Arc::clone(&state))
        .oneshot(
            Request::builder()
                .uri(format!("/v1/operations/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn credits_route_grants_and_reports_balance() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };

    let user = fm_testkit::seed_user(&pool, UserTier::Free).await?;
    let state = test_state(&pool).await;

    let resp = routes::build_router(Arc::clone(&state))
        .oneshot(post_json(
            &format!("/v1/users/{user}/credits"),
            json!({"amount": 25, "description": "purchase"}),
        ))
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["balance"], 25);

    // The grant recorded a credits.added outbox event.
    let (n,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint from outbox_events
        where event_type = 'credits.added' and aggregate_id = $1
        "#,
    )
    .bind(user.to_string())
    .fetch_one(&pool)
    .await?;
    assert_eq!(n, 1);

    Ok(())
}

#[tokio::test]
async fn register_asset_then_operate_on_it() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let _lock = fm_testkit::exclusive_test_lock(&pool).await?;

    let user = fm_testkit::seed_funded_user(&pool, UserTier::Pro, 5).await?;
    let state = test_state(&pool).await;

    let resp = routes::build_router(Arc::clone(&state))
        .oneshot(post_json(
            "/v1/assets",
            json!({
                "owner_id": user,
                "kind": "image",
                "extension": "PNG",
                "width": 640,
                "height": 480,
            }),
        ))
        .await?;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let asset_id = body_json(resp).await["asset_id"].as_str().unwrap().to_string();

    let fetched = fm_db::assets::fetch_asset(&pool, &asset_id).await?.unwrap();
    assert_eq!(fetched.extension, "png");

    let resp = routes::build_router(Arc::clone(&state))
        .oneshot(post_json(
            "/v1/operations",
            json!({
                "user_id": user,
                "asset_id": asset_id,
                "kind": "crop",
                "width": 640,
                "height": 480,
                "x": 0,
                "y": 0,
            }),
        ))
        .await?;
    assert_eq!(resp.status(), StatusCode::CREATED);

    Ok(())
}
