//! Completed operations whose reservation was never captured are
//! SUSPICIOUS; the configurable policy decides between releasing (favor the
//! user) and capturing (favor revenue).

use fm_config::settings::SuspiciousPolicy;
use fm_janitor::{sweep, JanitorConfig};
use fm_schemas::{OperationParams, OperationStatus, UserTier};
use std::time::Duration;
use uuid::Uuid;

fn config(policy: SuspiciousPolicy) -> JanitorConfig {
    JanitorConfig {
        ttl: chrono::Duration::minutes(30),
        grace: chrono::Duration::minutes(60),
        on_suspicious: policy,
        interval: Duration::from_secs(300),
    }
}

async fn seed_completed_without_capture(
    pool: &sqlx::PgPool,
) -> anyhow::Result<(uuid::Uuid, Uuid)> {
    let user = fm_testkit::seed_funded_user(pool, UserTier::Free, 10).await?;
    let asset = fm_testkit::seed_video(pool, user).await?;
    let op = fm_testkit::seed_pending_operation(
        pool,
        user,
        &asset,
        &OperationParams::Resize {
            width: 128,
            height: 128,
        },
        Some(1),
    )
    .await?;

    let mut conn = pool.acquire().await?;
    for (from, to) in [
        (OperationStatus::Pending, OperationStatus::Processing),
        (OperationStatus::Processing, OperationStatus::Completed),
    ] {
        let moved =
            fm_db::operations::transition_status(&mut conn, op, &[from], to, None, None).await?;
        assert!(moved);
    }
    drop(conn);

    fm_testkit::age_reservation(pool, op, 31).await?;
    Ok((user, op))
}

async fn settlement_of(pool: &sqlx::PgPool, op: Uuid) -> anyhow::Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        select entry_type from ledger_entries
        where operation_id = $1
          and entry_type in ('debit_capture', 'refund')
        "#,
    )
    .bind(op)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(t,)| t))
}

#[tokio::test]
async fn release_policy_refunds_the_user() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let _lock = fm_testkit::exclusive_test_lock(&pool).await?;

    let (user, op) = seed_completed_without_capture(&pool).await?;

    let report = sweep(&pool, &config(SuspiciousPolicy::Release)).await?;
    assert!(report.suspicious >= 1);

    assert_eq!(settlement_of(&pool, op).await?.as_deref(), Some("refund"));
    assert_eq!(fm_db::ledger::balance_of(&pool, user).await?, 10);

    Ok(())
}

#[tokio::test]
async fn capture_policy_keeps_the_charge() -> anyhow::Result<()> {
    let Some(pool) = fm_testkit::db_pool_or_skip().await else {
        return Ok(());
    };
    let _lock = fm_testkit::exclusive_test_lock(&pool).await?;

    let (user, op) = seed_completed_without_capture(&pool).await?;

    let report = sweep(&pool, &config(SuspiciousPolicy::Capture)).await?;
    assert!(report.suspicious >= 1);

    assert_eq!(
        settlement_of(&pool, op).await?.as_deref(),
        Some("debit_capture")
    );
    // The reservation's debit stands.
    assert_eq!(fm_db::ledger::balance_of(&pool, user).await?, 9);

    Ok(())
}
