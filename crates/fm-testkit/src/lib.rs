//! Shared helpers for integration scenarios.
//!
//! Scenario tests connect to the database named by `FM_DATABASE_URL` and
//! skip (not fail) when it is unset, so `cargo test --workspace` stays green
//! on machines without Postgres.

use anyhow::{Context, Result};
use chrono::Utc;
use fm_schemas::{AssetKind, UserTier};
use sqlx::PgPool;
use uuid::Uuid;

pub mod runner;

pub use runner::{FakeOutcome, FakeRunner};

/// Connect + migrate, or `None` (with an eprintln) when no database is
/// configured.
pub async fn db_pool_or_skip() -> Option<PgPool> {
    if std::env::var(fm_db::ENV_DB_URL).is_err() {
        eprintln!("SKIP: {} not set", fm_db::ENV_DB_URL);
        return None;
    }
    let pool = fm_db::connect_and_migrate_from_env()
        .await
        .expect("connect + migrate test database");
    Some(pool)
}

/// Short random hex id in the asset-id shape.
pub fn short_hex_id() -> String {
    use rand::Rng;
    let bytes: [u8; 6] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub async fn seed_user(pool: &PgPool, tier: UserTier) -> Result<Uuid> {
    let user_id = Uuid::new_v4();
    fm_db::users::insert_user(pool, user_id, tier).await?;
    Ok(user_id)
}

/// Seed a user and grant an initial credit balance via an `addition` row.
pub async fn seed_funded_user(pool: &PgPool, tier: UserTier, credits: i64) -> Result<Uuid> {
    let user_id = seed_user(pool, tier).await?;
    if credits > 0 {
        sqlx::query(
            r#"
            insert into ledger_entries (user_id, operation_id, amount, entry_type, description)
            values ($1, null, $2, 'addition', 'test seed')
            "#,
        )
        .bind(user_id)
        .bind(credits)
        .execute(pool)
        .await
        .context("seed credits failed")?;
    }
    Ok(user_id)
}

pub async fn seed_video(pool: &PgPool, owner_id: Uuid) -> Result<String> {
    seed_asset(pool, owner_id, AssetKind::Video, "mp4", 1920, 1080, Some(30.0)).await
}

pub async fn seed_image(pool: &PgPool, owner_id: Uuid) -> Result<String> {
    seed_asset(pool, owner_id, AssetKind::Image, "jpg", 1000, 800, None).await
}

pub async fn seed_asset(
    pool: &PgPool,
    owner_id: Uuid,
    kind: AssetKind,
    extension: &str,
    width: i32,
    height: i32,
    duration_secs: Option<f64>,
) -> Result<String> {
    let asset_id = short_hex_id();
    fm_db::assets::insert_asset(
        pool,
        &fm_db::assets::NewAsset {
            asset_id: asset_id.clone(),
            owner_id,
            kind,
            extension: extension.to_string(),
            width,
            height,
            duration_secs,
            metadata: serde_json::json!({}),
        },
    )
    .await?;
    Ok(asset_id)
}

/// Seed a pending operation row, optionally with a live reservation of
/// `reserve` credits. Returns the operation id.
pub async fn seed_pending_operation(
    pool: &PgPool,
    owner_id: Uuid,
    asset_id: &str,
    params: &fm_schemas::OperationParams,
    reserve: Option<i64>,
) -> Result<Uuid> {
    let operation_id = Uuid::new_v4();
    let mut tx = pool.begin().await?;

    fm_db::operations::insert_operation(
        &mut tx,
        &fm_db::operations::NewOperation {
            operation_id,
            asset_id: asset_id.to_string(),
            owner_id,
            kind: params.kind(),
            params: serde_json::to_value(params)?,
            // Scenario rows never collide, so the id doubles as fingerprint.
            params_fingerprint: operation_id.to_string(),
        },
    )
    .await?;

    if let Some(amount) = reserve {
        sqlx::query(
            r#"
            insert into ledger_entries (user_id, operation_id, amount, entry_type, description)
            values ($1, $2, $3, 'reservation', 'test reservation')
            "#,
        )
        .bind(owner_id)
        .bind(operation_id)
        .bind(-amount)
        .execute(&mut *tx)
        .await
        .context("seed reservation failed")?;
    }

    tx.commit().await?;
    Ok(operation_id)
}

/// Enqueue a job for a previously seeded operation, mirroring what the
/// pipeline does. Returns the job id (None when a live job already exists).
pub async fn enqueue_job_for(pool: &PgPool, operation_id: Uuid) -> Result<Option<String>> {
    let op = fm_db::operations::fetch_operation(pool, operation_id)
        .await?
        .context("operation missing")?;
    let asset = fm_db::assets::fetch_asset(pool, &op.asset_id)
        .await?
        .context("asset missing")?;

    let payload = fm_schemas::JobPayload {
        operation_id,
        asset_id: op.asset_id.clone(),
        owner_id: op.owner_id,
        kind: op.kind,
        params: serde_json::from_value(op.params.clone())?,
        asset_kind: asset.kind,
        asset_extension: asset.extension,
        trace: Default::default(),
    };

    let job_id = fm_db::queue::enqueue(
        pool,
        &fm_db::queue::NewQueueJob {
            operation_id,
            kind: op.kind.as_str().to_string(),
            asset_id: op.asset_id,
            owner_id: op.owner_id,
            payload: serde_json::to_value(&payload)?,
            priority: fm_schemas::JobPriority::Normal.as_i16(),
        },
    )
    .await?;
    Ok(job_id)
}

/// Serialize tests that run worker pools or drive restoration against the
/// shared database. The advisory lock is transaction-scoped: hold the
/// returned transaction for the duration of the test.
pub async fn exclusive_test_lock(
    pool: &PgPool,
) -> Result<sqlx::Transaction<'static, sqlx::Postgres>> {
    let mut tx = pool.begin().await?;
    sqlx::query("select pg_advisory_xact_lock(70770)")
        .execute(&mut *tx)
        .await
        .context("advisory lock failed")?;
    Ok(tx)
}

/// Park any leftover live jobs from earlier test runs so a freshly started
/// worker pool only sees the current test's work.
pub async fn quarantine_queue(pool: &PgPool) -> Result<u64> {
    let res = sqlx::query(
        r#"
        update queue_jobs
           set status = 'dead',
               last_error = coalesce(last_error, 'quarantined by testkit')
         where status in ('ready', 'active')
        "#,
    )
    .execute(pool)
    .await
    .context("quarantine_queue failed")?;
    Ok(res.rows_affected())
}

/// Return rows a test claimed but never settled to `pending`, so later
/// tests (and the real relay) can pick them up.
pub async fn release_claims_by(pool: &PgPool, claimer: &str) -> Result<u64> {
    let res = sqlx::query(
        r#"
        update outbox_events
           set status = 'pending', claimed_by = null, claimed_at = null
         where status = 'claimed'
           and claimed_by = $1
        "#,
    )
    .bind(claimer)
    .execute(pool)
    .await
    .context("release_claims_by failed")?;
    Ok(res.rows_affected())
}

/// Poll `f` every 25ms until it returns true or `timeout_ms` elapses.
pub async fn wait_until<F, Fut>(timeout_ms: u64, mut f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    loop {
        if f().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
}

/// Backdate a reservation so janitor TTL windows can be crossed in tests.
pub async fn age_reservation(pool: &PgPool, operation_id: Uuid, minutes: i64) -> Result<()> {
    sqlx::query(
        r#"
        update ledger_entries
           set created_at = $2
         where operation_id = $1
           and entry_type = 'reservation'
        "#,
    )
    .bind(operation_id)
    .bind(Utc::now() - chrono::Duration::minutes(minutes))
    .execute(pool)
    .await
    .context("age_reservation failed")?;
    Ok(())
}

/// Backdate an outbox claim so the stale-claim reaper sees it.
pub async fn age_outbox_claim(pool: &PgPool, event_id: i64, seconds: i64) -> Result<()> {
    sqlx::query(
        r#"
        update outbox_events
           set claimed_at = $2
         where event_id = $1
        "#,
    )
    .bind(event_id)
    .bind(Utc::now() - chrono::Duration::seconds(seconds))
    .execute(pool)
    .await
    .context("age_outbox_claim failed")?;
    Ok(())
}
