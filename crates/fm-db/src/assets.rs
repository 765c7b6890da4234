//! Media asset metadata store. One table for both videos and images with a
//! kind discriminator; the only video-specific field (duration) is nullable.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fm_schemas::AssetKind;
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AssetRow {
    pub asset_id: String,
    pub owner_id: Uuid,
    pub kind: AssetKind,
    pub extension: String,
    pub width: i32,
    pub height: i32,
    pub duration_secs: Option<f64>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAsset {
    pub asset_id: String,
    pub owner_id: Uuid,
    pub kind: AssetKind,
    pub extension: String,
    pub width: i32,
    pub height: i32,
    pub duration_secs: Option<f64>,
    pub metadata: Value,
}

pub async fn insert_asset(pool: &PgPool, asset: &NewAsset) -> Result<()> {
    sqlx::query(
        r#"
        insert into media_assets (
          asset_id, owner_id, kind, extension, width, height, duration_secs, metadata
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8
        )
        "#,
    )
    .bind(&asset.asset_id)
    .bind(asset.owner_id)
    .bind(asset.kind.as_str())
    .bind(&asset.extension)
    .bind(asset.width)
    .bind(asset.height)
    .bind(asset.duration_secs)
    .bind(&asset.metadata)
    .execute(pool)
    .await
    .context("insert_asset failed")?;

    Ok(())
}

pub async fn fetch_asset(pool: &PgPool, asset_id: &str) -> Result<Option<AssetRow>> {
    let row = sqlx::query(
        r#"
        select asset_id, owner_id, kind, extension, width, height,
               duration_secs, metadata, created_at
        from media_assets
        where asset_id = $1
        "#,
    )
    .bind(asset_id)
    .fetch_optional(pool)
    .await
    .context("fetch_asset failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(map_asset_row(&row)?))
}

fn map_asset_row(row: &sqlx::postgres::PgRow) -> Result<AssetRow> {
    Ok(AssetRow {
        asset_id: row.try_get("asset_id")?,
        owner_id: row.try_get("owner_id")?,
        kind: AssetKind::parse(&row.try_get::<String, _>("kind")?)?,
        extension: row.try_get("extension")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        duration_secs: row.try_get("duration_secs")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}
