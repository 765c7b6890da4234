//! Lifecycle event types carried through the outbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{OperationKind, OperationStatus};

/// Dotted event type strings. The relay matches subscriber patterns against
/// these; the idempotency key embeds the suffix.
pub mod event_type {
    pub const JOB_QUEUED: &str = "job.queued";
    pub const JOB_STARTED: &str = "job.started";
    pub const JOB_PROGRESS: &str = "job.progress";
    pub const JOB_COMPLETED: &str = "job.completed";
    pub const JOB_FAILED: &str = "job.failed";
    pub const CREDITS_ADDED: &str = "credits.added";
}

/// What subscribers receive: the durable row's identity plus its decoded
/// payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: i64,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Payload for `job.*` lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecyclePayload {
    pub operation_id: Uuid,
    pub asset_id: String,
    pub owner_id: Uuid,
    pub kind: OperationKind,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl LifecyclePayload {
    pub fn queued(operation_id: Uuid, asset_id: &str, owner_id: Uuid, kind: OperationKind) -> Self {
        Self {
            operation_id,
            asset_id: asset_id.to_string(),
            owner_id,
            kind,
            status: OperationStatus::Pending,
            result_path: None,
            error_message: None,
            error_code: None,
        }
    }
}

/// Idempotency key for an operation lifecycle event: one key per
/// (operation, stage) pair, so a retried transaction can never double-insert.
pub fn lifecycle_key(operation_id: Uuid, stage: &str) -> String {
    format!("op-{operation_id}-{stage}")
}
