//! The execution seam between the worker pool and the media tool.
//!
//! `fm-media` provides the production [`JobRunner`]; tests substitute fakes.
//! Everything crossing the seam is owned data, so runners can be exercised
//! without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fm_schemas::JobPayload;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Worker-side failure taxonomy. `Retryable` feeds the backoff/retry loop;
/// everything else settles the operation terminally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Transient IO (tool crashed, timeout, db hiccup): retry up to the
    /// attempt cap.
    Retryable { message: String },
    /// Corrupt input or impossible request: settle as failed immediately.
    Permanent {
        message: String,
        code: Option<String>,
    },
    /// Cancelled cooperatively (operation deleted or superseded).
    Cancelled,
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        JobError::Retryable {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        JobError::Permanent {
            message: message.into(),
            code: None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            JobError::Retryable { message } => message.clone(),
            JobError::Permanent { message, .. } => message.clone(),
            JobError::Cancelled => "cancelled".to_string(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::Retryable { message } => write!(f, "retryable: {message}"),
            JobError::Permanent { message, .. } => write!(f, "permanent: {message}"),
            JobError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for JobError {}

#[derive(Debug, Clone)]
pub struct JobOutput {
    /// Storage-relative path of the produced artifact.
    pub result_path: String,
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancel flag polled by runners around subprocess boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// In-process registry mapping live operations to their cancel flags.
/// The pipeline's administrative cancel flips the flag; the owning worker
/// observes it at its next cooperative check.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<RwLock<HashMap<Uuid, CancelFlag>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, operation_id: Uuid) -> CancelFlag {
        let flag = CancelFlag::new();
        self.inner.write().await.insert(operation_id, flag.clone());
        flag
    }

    pub async fn deregister(&self, operation_id: Uuid) {
        self.inner.write().await.remove(&operation_id);
    }

    /// Signal the worker owning `operation_id`, if any is in flight.
    pub async fn cancel(&self, operation_id: Uuid) -> bool {
        match self.inner.read().await.get(&operation_id) {
            Some(flag) => {
                flag.cancel();
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Ephemeral progress update. Never durable: progress rides an in-process
/// broadcast bus, not the outbox.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub operation_id: Uuid,
    pub percent: u8,
}

/// Broadcast bus for progress updates; the daemon's SSE stream subscribes.
#[derive(Clone)]
pub struct ProgressBus {
    tx: broadcast::Sender<ProgressUpdate>,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.tx.subscribe()
    }

    pub fn publish(&self, update: ProgressUpdate) {
        // No receivers is fine; progress is best-effort.
        let _ = self.tx.send(update);
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(256)
    }
}

// ---------------------------------------------------------------------------
// Execution context + runner trait
// ---------------------------------------------------------------------------

/// Per-execution context handed to the runner.
#[derive(Clone)]
pub struct ExecContext {
    pub job_id: String,
    pub attempt: i32,
    pub cancel: CancelFlag,
    progress: ProgressBus,
    operation_id: Uuid,
}

impl ExecContext {
    pub fn new(
        job_id: String,
        operation_id: Uuid,
        attempt: i32,
        cancel: CancelFlag,
        progress: ProgressBus,
    ) -> Self {
        Self {
            job_id,
            attempt,
            cancel,
            progress,
            operation_id,
        }
    }

    /// Report completion percentage, clamped to [0, 100]. Ephemeral.
    pub fn report_progress(&self, percent: u8) {
        self.progress.publish(ProgressUpdate {
            job_id: self.job_id.clone(),
            operation_id: self.operation_id,
            percent: percent.min(100),
        });
    }
}

/// A job is a function over its payload producing an artifact or a typed
/// failure. Implementations must poll `ctx.cancel` around blocking
/// boundaries and keep output paths deterministic so re-execution after a
/// crash overwrites rather than duplicates.
pub trait JobRunner: Send + Sync + 'static {
    fn run<'a>(
        &'a self,
        job: &'a JobPayload,
        ctx: ExecContext,
    ) -> impl std::future::Future<Output = Result<JobOutput, JobError>> + Send + 'a;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_flips_once() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        flag.cancel();
        assert!(flag.is_cancelled());
        flag.cancel();
        assert!(flag.is_cancelled());
    }

    #[tokio::test]
    async fn registry_signals_only_live_operations() {
        let reg = CancelRegistry::new();
        let op = Uuid::new_v4();

        assert!(!reg.cancel(op).await, "nothing registered yet");

        let flag = reg.register(op).await;
        assert!(reg.cancel(op).await);
        assert!(flag.is_cancelled());

        reg.deregister(op).await;
        assert!(!reg.cancel(op).await);
    }

    #[tokio::test]
    async fn progress_bus_clamps_percent() {
        let bus = ProgressBus::new(8);
        let mut rx = bus.subscribe();
        let ctx = ExecContext::new(
            "job-1".into(),
            Uuid::new_v4(),
            0,
            CancelFlag::new(),
            bus.clone(),
        );

        ctx.report_progress(150);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.percent, 100);
    }
}
