//! Typed runtime settings with serde defaults.
//!
//! The daemon loads these from the layered YAML tree; every field has a
//! default so a missing file or sparse layer still boots a working system.

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage: StorageSettings,
    pub workers: WorkerSettings,
    pub relay: RelaySettings,
    pub janitor: JanitorSettings,
    pub costs: CostSettings,
    pub media: MediaSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root of the per-asset storage tree (`storage/{asset_id}/...`).
    pub root: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: "storage".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Fixed worker-pool concurrency (in-flight slots).
    pub concurrency: usize,
    /// Idle sleep between empty claim attempts, milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum execution attempts per job.
    pub max_attempts: i32,
    /// Retry backoff base, seconds. Delay is `min(base * 2^attempts, cap)`
    /// plus uniform jitter in `[0, base)`.
    pub backoff_base_secs: u64,
    /// Retry backoff cap, seconds.
    pub backoff_cap_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval_ms: 250,
            max_attempts: 3,
            backoff_base_secs: 2,
            backoff_cap_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Poll interval for claiming due outbox rows, milliseconds.
    pub tick_ms: u64,
    /// Maximum rows claimed per tick.
    pub batch_size: i64,
    /// Delivery attempts before an event is parked as dead.
    pub max_attempts: i32,
    /// Rows stuck in `claimed` longer than this are re-reaped to `pending`.
    pub claim_ttl_secs: i64,
    /// Reaper cadence, seconds.
    pub reap_interval_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            batch_size: 100,
            max_attempts: 5,
            claim_ttl_secs: 60,
            reap_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JanitorSettings {
    /// Sweep cadence, minutes.
    pub interval_minutes: u64,
    /// Reservations younger than this are never touched.
    pub ttl_minutes: i64,
    /// Extra allowance beyond TTL before a pending/processing operation's
    /// reservation is treated as stuck. Defaults to 2×TTL.
    pub grace_minutes: Option<i64>,
    /// Policy for completed operations with no capture: "release" | "capture".
    pub on_suspicious: SuspiciousPolicy,
}

impl JanitorSettings {
    pub fn grace_minutes(&self) -> i64 {
        self.grace_minutes.unwrap_or(self.ttl_minutes * 2)
    }
}

impl Default for JanitorSettings {
    fn default() -> Self {
        Self {
            interval_minutes: 5,
            ttl_minutes: 30,
            grace_minutes: None,
            on_suspicious: SuspiciousPolicy::Release,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspiciousPolicy {
    /// Refund the reservation and count it (favor the user).
    Release,
    /// Insert the missing capture and count it (favor revenue).
    Capture,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CostSettings {
    /// Credits charged when a kind has no explicit entry.
    pub default_credits: i64,
    /// Per-kind overrides keyed by kind string (`gif`, `convert`, ...).
    pub per_kind: std::collections::BTreeMap<String, i64>,
}

impl Default for CostSettings {
    fn default() -> Self {
        let mut per_kind = std::collections::BTreeMap::new();
        per_kind.insert("convert".to_string(), 2);
        per_kind.insert("gif".to_string(), 2);
        Self {
            default_credits: 1,
            per_kind,
        }
    }
}

impl CostSettings {
    pub fn credits_for(&self, kind: &str) -> i64 {
        self.per_kind
            .get(kind)
            .copied()
            .unwrap_or(self.default_credits)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaSettings {
    /// Path to the ffmpeg binary.
    pub ffmpeg: String,
    /// Path to the ffprobe binary.
    pub ffprobe: String,
    /// Default wall-clock cap per execution, seconds.
    pub timeout_secs: u64,
    /// Per-kind timeout overrides (gif and convert re-encode, so they get
    /// longer caps by default).
    pub timeout_per_kind_secs: std::collections::BTreeMap<String, u64>,
}

impl Default for MediaSettings {
    fn default() -> Self {
        let mut per_kind = std::collections::BTreeMap::new();
        per_kind.insert("convert".to_string(), 600);
        per_kind.insert("gif".to_string(), 600);
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            timeout_secs: 300,
            timeout_per_kind_secs: per_kind,
        }
    }
}

impl MediaSettings {
    pub fn timeout_for(&self, kind: &str) -> std::time::Duration {
        let secs = self
            .timeout_per_kind_secs
            .get(kind)
            .copied()
            .unwrap_or(self.timeout_secs);
        std::time::Duration::from_secs(secs)
    }
}
