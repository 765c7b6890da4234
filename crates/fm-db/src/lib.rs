use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

pub const ENV_DB_URL: &str = "FM_DATABASE_URL";
pub const ENV_POOL_SIZE: &str = "FM_DB_POOL_SIZE";

/// Every table the core schema consists of, in dependency order. The status
/// probe reports which of these are missing so an operator can tell "never
/// migrated" from "half migrated".
const CORE_TABLES: &[&str] = &[
    "users",
    "media_assets",
    "operations",
    "ledger_entries",
    "outbox_events",
    "queue_jobs",
];

pub mod assets;
pub mod ledger;
pub mod operations;
pub mod outbox;
pub mod queue;
pub mod users;

pub use assets::{fetch_asset, insert_asset, AssetRow, NewAsset};
pub use ledger::{LedgerEntryRow, NewLedgerEntry};
pub use operations::{NewOperation, OperationRow};
pub use outbox::{NewOutboxEvent, OutboxEventRow};
pub use queue::{NewQueueJob, QueueJobRow};
pub use users::UserRow;

/// Connect to Postgres using FM_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

/// Open the shared pool. One pool serves the pipeline, the workers, the
/// relay, and the janitor; workers hold no connection while the media
/// subprocess runs, so a small cap suffices. FM_DB_POOL_SIZE overrides it
/// for deployments with more workers than the default assumes.
pub async fn connect(url: &str) -> Result<PgPool> {
    let max_connections = std::env::var(ENV_POOL_SIZE)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(url)
        .await
        .with_context(|| format!("postgres connect failed (pool cap {max_connections})"))?;

    Ok(pool)
}

/// Connect via FM_DATABASE_URL and bring the schema up to date. Scenario
/// tests and the daemon boot through this.
pub async fn connect_and_migrate_from_env() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Apply embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("apply migrations failed")?;
    Ok(())
}

/// Connectivity plus a per-table schema probe.
#[derive(Debug, Clone)]
pub struct DbStatus {
    pub reachable: bool,
    /// Core tables absent from the public schema; empty when fully migrated.
    pub missing_tables: Vec<String>,
}

impl DbStatus {
    pub fn schema_ready(&self) -> bool {
        self.reachable && self.missing_tables.is_empty()
    }
}

pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    if sqlx::query("select 1").execute(pool).await.is_err() {
        return Ok(DbStatus {
            reachable: false,
            missing_tables: CORE_TABLES.iter().map(|t| t.to_string()).collect(),
        });
    }

    let wanted: Vec<String> = CORE_TABLES.iter().map(|t| t.to_string()).collect();
    let present: Vec<(String,)> = sqlx::query_as(
        r#"
        select table_name::text
        from information_schema.tables
        where table_schema = 'public'
          and table_name::text = any($1)
        "#,
    )
    .bind(&wanted)
    .fetch_all(pool)
    .await
    .context("schema probe failed")?;

    let present: Vec<String> = present.into_iter().map(|(t,)| t).collect();
    let missing_tables = wanted
        .into_iter()
        .filter(|t| !present.contains(t))
        .collect();

    Ok(DbStatus {
        reachable: true,
        missing_tables,
    })
}

/// Whether an error is a unique violation against the named index or
/// constraint. The ledger and queue map these to typed outcomes instead of
/// surfacing raw SQL errors.
pub fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };
    // 23505 = unique_violation
    db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(constraint)
}
