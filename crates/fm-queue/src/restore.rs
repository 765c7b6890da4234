//! Boot-time restoration: rebuild jobs for every operation that was pending
//! or processing when the previous process died.
//!
//! `operations.params` stores the complete payload (including derived
//! fields), so reconstruction needs nothing but the operation row and the
//! owner's tier. Idempotent: the live-operation unique guard turns a second
//! run into a no-op, and interrupted `processing` rows are re-run rather
//! than skipped (tool output paths are deterministic, overwrite enabled).

use anyhow::{bail, Context, Result};
use fm_db::assets;
use fm_db::operations;
use fm_db::queue::{self, NewQueueJob};
use fm_db::users;
use fm_schemas::{JobPayload, OperationParams, UserTier};
use sqlx::PgPool;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub scanned: usize,
    pub enqueued: usize,
    pub already_live: usize,
    pub released_claims: u64,
}

pub async fn restore_on_start(pool: &PgPool) -> Result<RestoreReport> {
    let mut report = RestoreReport {
        // Claims held by the dead process go back to ready first, so the
        // live-operation guard sees them and skips re-insertion.
        released_claims: queue::release_all_active(pool).await?,
        ..Default::default()
    };

    let restorable = operations::restorable_operations(pool).await?;
    report.scanned = restorable.len();

    for op in restorable {
        let params: OperationParams = serde_json::from_value(op.params.clone())
            .with_context(|| format!("decode params for operation {}", op.operation_id))?;

        let tier = match users::fetch_user(pool, op.owner_id).await? {
            Some(u) => u.tier,
            None => {
                warn!(operation_id = %op.operation_id, "owner missing; defaulting tier");
                UserTier::Free
            }
        };

        let Some(asset) = assets::fetch_asset(pool, &op.asset_id).await? else {
            bail!(
                "restorable operation {} references missing asset {}",
                op.operation_id,
                op.asset_id
            );
        };

        let payload = JobPayload {
            operation_id: op.operation_id,
            asset_id: op.asset_id.clone(),
            owner_id: op.owner_id,
            kind: op.kind,
            params,
            asset_kind: asset.kind,
            asset_extension: asset.extension.clone(),
            trace: Default::default(),
        };

        let inserted = queue::enqueue(
            pool,
            &NewQueueJob {
                operation_id: op.operation_id,
                kind: op.kind.as_str().to_string(),
                asset_id: op.asset_id.clone(),
                owner_id: op.owner_id,
                payload: serde_json::to_value(&payload).context("encode restored payload")?,
                priority: tier.job_priority().as_i16(),
            },
        )
        .await?;

        match inserted {
            Some(_) => report.enqueued += 1,
            None => report.already_live += 1,
        }
    }

    info!(
        scanned = report.scanned,
        enqueued = report.enqueued,
        already_live = report.already_live,
        released_claims = report.released_claims,
        "queue restoration complete"
    );

    Ok(report)
}
