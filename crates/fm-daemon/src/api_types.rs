//! Request/response DTOs for the HTTP surface.

use chrono::{DateTime, Utc};
use fm_db::operations::OperationRow;
use fm_schemas::{AssetKind, OperationParams};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub daemon_uptime_secs: u64,
    pub db_ok: bool,
    pub ready_jobs: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Stable machine-readable kind: `validation`, `not_owned`, `not_found`,
    /// `insufficient_funds`, `internal`.
    pub kind: String,
}

/// `POST /v1/operations` body. The parameter record is flattened, so the
/// JSON carries `kind` next to the per-kind fields:
/// `{"user_id": ..., "asset_id": ..., "kind": "resize", "width": 800, ...}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartOperationBody {
    pub user_id: Uuid,
    pub asset_id: String,
    #[serde(flatten)]
    pub params: OperationParams,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationResponse {
    pub operation_id: Uuid,
    pub asset_id: String,
    pub owner_id: Uuid,
    pub kind: String,
    pub status: String,
    pub params: Value,
    pub result_path: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<OperationRow> for OperationResponse {
    fn from(op: OperationRow) -> Self {
        Self {
            operation_id: op.operation_id,
            asset_id: op.asset_id,
            owner_id: op.owner_id,
            kind: op.kind.as_str().to_string(),
            status: op.status.as_str().to_string(),
            params: op.params,
            result_path: op.result_path,
            error_message: op.error_message,
            created_at: op.created_at,
            updated_at: op.updated_at,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub user_id: Uuid,
    pub balance: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreditBody {
    pub amount: i64,
    #[serde(default = "default_credit_description")]
    pub description: String,
}

fn default_credit_description() -> String {
    "credits added".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterAssetBody {
    pub owner_id: Uuid,
    pub kind: AssetKind,
    pub extension: String,
    pub width: i32,
    pub height: i32,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default = "empty_metadata")]
    pub metadata: Value,
}

fn empty_metadata() -> Value {
    Value::Object(Default::default())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterAssetResponse {
    pub asset_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub operation_id: Uuid,
    /// `cancelled` or `already_terminal`.
    pub outcome: String,
}
