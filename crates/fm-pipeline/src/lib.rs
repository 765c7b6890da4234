//! Operation pipeline: the single entry point for "run an operation on an
//! asset".
//!
//! Request flow: authorize → validate → idempotency probe → one transaction
//! (reserve credits + insert operation + outbox `job.queued`) → enqueue.
//! If the transaction commits, the job is guaranteed to be processed
//! eventually or its reservation released by the janitor; if it aborts, no
//! partial state is observable.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use fm_config::settings::CostSettings;
use fm_db::assets::AssetRow;
use fm_db::operations::{self, NewOperation, OperationRow};
use fm_db::outbox::{self, NewOutboxEvent};
use fm_db::queue::{self, NewQueueJob};
use fm_db::users;
use fm_ledger::{credit_in, reserve_in, ReserveOutcome};
use fm_queue::settle::settle_failed;
use fm_queue::CancelRegistry;
use fm_schemas::events::{event_type, lifecycle_key, LifecyclePayload};
use fm_schemas::{JobPayload, OperationParams, UserTier};

pub mod validate;

pub use validate::validate_request;

// ---------------------------------------------------------------------------
// Errors & outcomes
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum PipelineError {
    /// Caller does not own the asset.
    NotOwned,
    /// Asset (or operation, for cancel/get) does not exist.
    NotFound,
    /// Malformed or semantically invalid parameters. No state change.
    Validation(String),
    /// Ledger rejected the reservation. No state change.
    InsufficientFunds { balance: i64, required: i64 },
    /// Unexpected invariant violation or infrastructure failure.
    Internal(anyhow::Error),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::NotOwned => write!(f, "asset not owned by caller"),
            PipelineError::NotFound => write!(f, "not found"),
            PipelineError::Validation(msg) => write!(f, "invalid parameters: {msg}"),
            PipelineError::InsufficientFunds { balance, required } => {
                write!(f, "insufficient funds: balance {balance}, required {required}")
            }
            PipelineError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        PipelineError::Internal(e)
    }
}

/// Result of a start request. `Existing` is the conflict case: an
/// equivalent operation already exists and is returned instead of an error.
#[derive(Debug)]
pub enum StartOutcome {
    Started(OperationRow),
    Existing(OperationRow),
}

impl StartOutcome {
    pub fn operation(&self) -> &OperationRow {
        match self {
            StartOutcome::Started(op) | StartOutcome::Existing(op) => op,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, StartOutcome::Started(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyTerminal,
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub user_id: Uuid,
    pub asset_id: String,
    pub params: OperationParams,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Pipeline {
    pool: PgPool,
    costs: CostSettings,
    cancels: CancelRegistry,
}

impl Pipeline {
    pub fn new(pool: PgPool, costs: CostSettings, cancels: CancelRegistry) -> Self {
        Self {
            pool,
            costs,
            cancels,
        }
    }

    /// Start an operation. See the module docs for the step order.
    pub async fn start_operation(&self, req: &StartRequest) -> Result<StartOutcome, PipelineError> {
        // 1. Authorize: the caller must own the asset.
        let asset = fm_db::assets::fetch_asset(&self.pool, &req.asset_id)
            .await
            .map_err(PipelineError::Internal)?
            .ok_or(PipelineError::NotFound)?;

        if asset.owner_id != req.user_id {
            return Err(PipelineError::NotOwned);
        }

        let user = users::fetch_user(&self.pool, req.user_id)
            .await
            .map_err(PipelineError::Internal)?
            .ok_or_else(|| {
                PipelineError::Internal(anyhow::anyhow!("user {} missing", req.user_id))
            })?;

        // 2. Validate against the kind's schema and semantic preconditions;
        //    this also fills derived fields (convert codecs).
        let params = validate::validate_request(&self.pool, &asset, &req.params).await?;
        let kind = params.kind();

        // 3. Idempotency: an equivalent live or completed operation wins.
        let fingerprint = fm_config::canonical_hash(&params)
            .context("fingerprint params")
            .map_err(PipelineError::Internal)?;

        if let Some(existing) =
            operations::find_equivalent(&self.pool, &asset.asset_id, kind, &fingerprint)
                .await
                .map_err(PipelineError::Internal)?
        {
            info!(
                operation_id = %existing.operation_id,
                "equivalent operation exists; returning it"
            );
            return Ok(StartOutcome::Existing(existing));
        }

        // 4. One transaction: reserve + operation row + job.queued event.
        let operation_id = Uuid::new_v4();
        let cost = self.costs.credits_for(kind.as_str());

        let mut tx = self
            .pool
            .begin()
            .await
            .context("start_operation begin")
            .map_err(PipelineError::Internal)?;

        let reserve = reserve_in(
            &mut tx,
            req.user_id,
            operation_id,
            cost,
            &format!("{} on {}", kind.as_str(), asset.asset_id),
        )
        .await
        .map_err(PipelineError::Internal)?;

        match reserve {
            ReserveOutcome::Ok { .. } => {}
            ReserveOutcome::InsufficientFunds { balance, required } => {
                tx.rollback()
                    .await
                    .context("insufficient-funds rollback")
                    .map_err(PipelineError::Internal)?;
                return Err(PipelineError::InsufficientFunds { balance, required });
            }
            ReserveOutcome::AlreadyReserved => {
                // Fresh UUID collided with an existing reservation — should
                // be impossible.
                tx.rollback()
                    .await
                    .context("already-reserved rollback")
                    .map_err(PipelineError::Internal)?;
                return Err(PipelineError::Internal(anyhow::anyhow!(
                    "reservation collision for new operation {operation_id}"
                )));
            }
        }

        let params_json = serde_json::to_value(&params)
            .context("encode params")
            .map_err(PipelineError::Internal)?;

        operations::insert_operation(
            &mut tx,
            &NewOperation {
                operation_id,
                asset_id: asset.asset_id.clone(),
                owner_id: req.user_id,
                kind,
                params: params_json,
                params_fingerprint: fingerprint,
            },
        )
        .await
        .map_err(PipelineError::Internal)?;

        let queued =
            LifecyclePayload::queued(operation_id, &asset.asset_id, req.user_id, kind);
        outbox::insert_event(
            &mut tx,
            &NewOutboxEvent {
                event_type: event_type::JOB_QUEUED.to_string(),
                aggregate_type: "operation".to_string(),
                aggregate_id: operation_id.to_string(),
                payload: serde_json::to_value(&queued)
                    .context("encode job.queued payload")
                    .map_err(PipelineError::Internal)?,
                idempotency_key: lifecycle_key(operation_id, "queued"),
            },
        )
        .await
        .map_err(PipelineError::Internal)?;

        tx.commit()
            .await
            .context("start_operation commit")
            .map_err(PipelineError::Internal)?;

        // 5. Enqueue. A failure here is NOT fatal for the caller: the
        //    committed pending operation is re-enqueued by restoration, and
        //    the janitor backstops the reservation.
        if let Err(e) = self.enqueue(&asset, operation_id, kind, &params, user.tier).await {
            error!(
                operation_id = %operation_id,
                error = %format!("{e:#}"),
                "enqueue after commit failed; restoration will recover"
            );
        }

        let op = operations::fetch_operation(&self.pool, operation_id)
            .await
            .map_err(PipelineError::Internal)?
            .ok_or_else(|| {
                PipelineError::Internal(anyhow::anyhow!("operation vanished after commit"))
            })?;

        info!(
            operation_id = %operation_id,
            kind = kind.as_str(),
            cost,
            "operation started"
        );
        Ok(StartOutcome::Started(op))
    }

    async fn enqueue(
        &self,
        asset: &AssetRow,
        operation_id: Uuid,
        kind: fm_schemas::OperationKind,
        params: &OperationParams,
        tier: UserTier,
    ) -> Result<()> {
        let payload = JobPayload {
            operation_id,
            asset_id: asset.asset_id.clone(),
            owner_id: asset.owner_id,
            kind,
            params: params.clone(),
            asset_kind: asset.kind,
            asset_extension: asset.extension.clone(),
            trace: Default::default(),
        };

        let job_id = queue::enqueue(
            &self.pool,
            &NewQueueJob {
                operation_id,
                kind: kind.as_str().to_string(),
                asset_id: asset.asset_id.clone(),
                owner_id: asset.owner_id,
                payload: serde_json::to_value(&payload).context("encode job payload")?,
                priority: tier.job_priority().as_i16(),
            },
        )
        .await?;

        if job_id.is_none() {
            warn!(operation_id = %operation_id, "live job already queued");
        }
        Ok(())
    }

    pub async fn get_operation(
        &self,
        operation_id: Uuid,
    ) -> Result<OperationRow, PipelineError> {
        operations::fetch_operation(&self.pool, operation_id)
            .await
            .map_err(PipelineError::Internal)?
            .ok_or(PipelineError::NotFound)
    }

    /// Administrative cancellation: settle the operation as failed with
    /// reason `cancelled`, refund the reservation, and signal the owning
    /// worker so it aborts at its next cooperative check.
    ///
    /// Once an operation is terminal this is a no-op; a concurrent worker
    /// settle races safely (guarded status transition, first writer wins).
    pub async fn cancel_operation(
        &self,
        operation_id: Uuid,
    ) -> Result<CancelOutcome, PipelineError> {
        let op = self.get_operation(operation_id).await?;

        if op.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }

        // Signal first so an in-flight subprocess dies promptly; the settle
        // below wins the status race either way.
        self.cancels.cancel(operation_id).await;

        let asset = fm_db::assets::fetch_asset(&self.pool, &op.asset_id)
            .await
            .map_err(PipelineError::Internal)?
            .ok_or(PipelineError::NotFound)?;

        let params: OperationParams = serde_json::from_value(op.params.clone())
            .context("decode params for cancel")
            .map_err(PipelineError::Internal)?;

        let payload = JobPayload {
            operation_id,
            asset_id: op.asset_id.clone(),
            owner_id: op.owner_id,
            kind: op.kind,
            params,
            asset_kind: asset.kind,
            asset_extension: asset.extension,
            trace: Default::default(),
        };

        let settled = settle_failed(&self.pool, &payload, "cancelled", Some("cancelled"))
            .await
            .map_err(PipelineError::Internal)?;

        if settled {
            info!(operation_id = %operation_id, "operation cancelled");
            Ok(CancelOutcome::Cancelled)
        } else {
            Ok(CancelOutcome::AlreadyTerminal)
        }
    }

    /// Admin credit grant: `addition` ledger row plus a `credits.added`
    /// outbox event in one transaction. Returns the new balance.
    pub async fn grant_credits(
        &self,
        user_id: Uuid,
        amount: i64,
        description: &str,
    ) -> Result<i64, PipelineError> {
        if amount <= 0 {
            return Err(PipelineError::Validation(format!(
                "credit amount must be > 0, got {amount}"
            )));
        }

        users::fetch_user(&self.pool, user_id)
            .await
            .map_err(PipelineError::Internal)?
            .ok_or(PipelineError::NotFound)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("grant_credits begin")
            .map_err(PipelineError::Internal)?;

        let entry_id = credit_in(&mut tx, user_id, amount, description)
            .await
            .map_err(PipelineError::Internal)?;

        outbox::insert_event(
            &mut tx,
            &NewOutboxEvent {
                event_type: event_type::CREDITS_ADDED.to_string(),
                aggregate_type: "user".to_string(),
                aggregate_id: user_id.to_string(),
                payload: serde_json::json!({
                    "user_id": user_id,
                    "amount": amount,
                    "description": description,
                }),
                idempotency_key: format!("credit-{entry_id}"),
            },
        )
        .await
        .map_err(PipelineError::Internal)?;

        tx.commit()
            .await
            .context("grant_credits commit")
            .map_err(PipelineError::Internal)?;

        fm_db::ledger::balance_of(&self.pool, user_id)
            .await
            .map_err(PipelineError::Internal)
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<i64, PipelineError> {
        fm_db::ledger::balance_of(&self.pool, user_id)
            .await
            .map_err(PipelineError::Internal)
    }
}
