//! Shared typed records crossing crate boundaries: operation kinds and
//! statuses, per-kind parameter records, the job payload, and the lifecycle
//! event envelope.
//!
//! Everything here is plain data — no IO, no clocks, no SQL.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub mod events;
pub mod params;

pub use events::{event_type, EventEnvelope, LifecyclePayload};
pub use params::{OperationParams, ParamError};

// ---------------------------------------------------------------------------
// Asset kind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Video,
    Image,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Video => "video",
            AssetKind::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "video" => Ok(AssetKind::Video),
            "image" => Ok(AssetKind::Image),
            other => Err(anyhow!("invalid asset kind: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// User tier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    Free,
    Pro,
    Enterprise,
}

impl UserTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserTier::Free => "free",
            UserTier::Pro => "pro",
            UserTier::Enterprise => "enterprise",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "free" => Ok(UserTier::Free),
            "pro" => Ok(UserTier::Pro),
            "enterprise" => Ok(UserTier::Enterprise),
            other => Err(anyhow!("invalid user tier: {}", other)),
        }
    }

    /// Queue priority derived from tier. There is no user-facing priority
    /// field; tier is the only input.
    pub fn job_priority(&self) -> JobPriority {
        match self {
            UserTier::Free => JobPriority::Normal,
            UserTier::Pro | UserTier::Enterprise => JobPriority::High,
        }
    }
}

// ---------------------------------------------------------------------------
// Operation kind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Resize,
    Convert,
    ExtractAudio,
    Crop,
    Trim,
    Watermark,
    Gif,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Resize => "resize",
            OperationKind::Convert => "convert",
            OperationKind::ExtractAudio => "extract_audio",
            OperationKind::Crop => "crop",
            OperationKind::Trim => "trim",
            OperationKind::Watermark => "watermark",
            OperationKind::Gif => "gif",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "resize" => Ok(OperationKind::Resize),
            "convert" => Ok(OperationKind::Convert),
            "extract_audio" => Ok(OperationKind::ExtractAudio),
            "crop" => Ok(OperationKind::Crop),
            "trim" => Ok(OperationKind::Trim),
            "watermark" => Ok(OperationKind::Watermark),
            "gif" => Ok(OperationKind::Gif),
            other => Err(anyhow!("invalid operation kind: {}", other)),
        }
    }

    /// Which asset kind this operation applies to. `Resize` is the only kind
    /// valid for both.
    pub fn applies_to(&self, asset: AssetKind) -> bool {
        match self {
            OperationKind::Resize => true,
            OperationKind::Crop => asset == AssetKind::Image,
            OperationKind::Convert => true,
            OperationKind::ExtractAudio
            | OperationKind::Trim
            | OperationKind::Watermark
            | OperationKind::Gif => asset == AssetKind::Video,
        }
    }
}

// ---------------------------------------------------------------------------
// Operation status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "processing" => Ok(OperationStatus::Processing),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(anyhow!("invalid operation status: {}", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }

    /// Lifecycle is strictly `pending → processing → {completed, failed}`,
    /// plus `pending → failed` for cancellation before a worker claims.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        match (self, next) {
            (OperationStatus::Pending, OperationStatus::Processing) => true,
            (OperationStatus::Pending, OperationStatus::Failed) => true,
            (OperationStatus::Processing, OperationStatus::Completed) => true,
            (OperationStatus::Processing, OperationStatus::Failed) => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Job priority
// ---------------------------------------------------------------------------

/// Lower integer wins the claim query's ORDER BY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    Normal,
    Low,
}

impl JobPriority {
    pub fn as_i16(&self) -> i16 {
        match self {
            JobPriority::High => 1,
            JobPriority::Normal => 5,
            JobPriority::Low => 10,
        }
    }

    pub fn from_i16(v: i16) -> Result<Self> {
        match v {
            1 => Ok(JobPriority::High),
            5 => Ok(JobPriority::Normal),
            10 => Ok(JobPriority::Low),
            other => Err(anyhow!("invalid job priority: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Job payload
// ---------------------------------------------------------------------------

/// Everything a worker needs to execute one operation. Stored verbatim on the
/// queue row; reconstructible from the operation row alone (restoration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub operation_id: uuid::Uuid,
    pub asset_id: String,
    pub owner_id: uuid::Uuid,
    pub kind: OperationKind,
    pub params: OperationParams,
    /// Input facts the media tool needs; captured at enqueue time so a
    /// worker never re-reads the asset row mid-execution.
    pub asset_kind: AssetKind,
    pub asset_extension: String,
    /// Opaque trace-context carrier propagated into the worker span.
    #[serde(default)]
    pub trace: std::collections::BTreeMap<String, String>,
}
