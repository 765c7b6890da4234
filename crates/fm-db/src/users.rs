//! User rows. Accounts are created externally; the core reads tiers and
//! writes nothing but test fixtures.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fm_schemas::UserTier;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct UserRow {
    pub user_id: Uuid,
    pub tier: UserTier,
    pub created_at: DateTime<Utc>,
}

pub async fn insert_user(pool: &PgPool, user_id: Uuid, tier: UserTier) -> Result<()> {
    sqlx::query(
        r#"
        insert into users (user_id, tier)
        values ($1, $2)
        "#,
    )
    .bind(user_id)
    .bind(tier.as_str())
    .execute(pool)
    .await
    .context("insert_user failed")?;
    Ok(())
}

pub async fn fetch_user(pool: &PgPool, user_id: Uuid) -> Result<Option<UserRow>> {
    let row = sqlx::query(
        r#"
        select user_id, tier, created_at
        from users
        where user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("fetch_user failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(UserRow {
        user_id: row.try_get("user_id")?,
        tier: UserTier::parse(&row.try_get::<String, _>("tier")?)?,
        created_at: row.try_get("created_at")?,
    }))
}
