//! Bounded worker pool: exactly C claim→execute→settle loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use fm_config::settings::WorkerSettings;
use fm_db::queue::{self, QueueJobRow};
use fm_schemas::JobPayload;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::backoff::backoff_delay;
use crate::runner::{CancelRegistry, ExecContext, JobError, JobRunner, ProgressBus};
use crate::settle::{settle_completed, settle_failed, settle_started, StartDisposition};

/// The worker pool. `start` spawns the configured number of worker tasks;
/// each loops claiming one job at a time, so in-flight work never exceeds
/// the concurrency cap.
pub struct WorkerPool<R: JobRunner> {
    pool: PgPool,
    runner: Arc<R>,
    settings: WorkerSettings,
    progress: ProgressBus,
    cancels: CancelRegistry,
}

/// Handle for shutdown and test synchronization. Dropping it does NOT stop
/// the workers; call [`WorkerPoolHandle::shutdown`].
pub struct WorkerPoolHandle {
    stop: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Ask all workers to stop after their current job and wait for them.
    pub async fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

impl<R: JobRunner> WorkerPool<R> {
    pub fn new(
        pool: PgPool,
        runner: Arc<R>,
        settings: WorkerSettings,
        progress: ProgressBus,
        cancels: CancelRegistry,
    ) -> Self {
        Self {
            pool,
            runner,
            settings,
            progress,
            cancels,
        }
    }

    /// Spawn the worker tasks. Worker ids are `worker-0..worker-{C-1}`.
    pub fn start(self) -> WorkerPoolHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let mut tasks = Vec::with_capacity(self.settings.concurrency);

        let shared = Arc::new(self);
        for i in 0..shared.settings.concurrency {
            let worker_id = format!("worker-{i}");
            let pool = Arc::clone(&shared);
            let stop = Arc::clone(&stop);
            tasks.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, stop).await;
            }));
        }

        info!(
            concurrency = shared.settings.concurrency,
            "worker pool started"
        );
        WorkerPoolHandle { stop, tasks }
    }

    async fn worker_loop(&self, worker_id: String, stop: Arc<AtomicBool>) {
        let idle = Duration::from_millis(self.settings.poll_interval_ms);

        while !stop.load(Ordering::SeqCst) {
            let claimed = match queue::claim_one(&self.pool, &worker_id).await {
                Ok(c) => c,
                Err(e) => {
                    error!(worker = %worker_id, error = %format!("{e:#}"), "claim failed");
                    tokio::time::sleep(idle).await;
                    continue;
                }
            };

            let Some(job) = claimed else {
                tokio::time::sleep(idle).await;
                continue;
            };

            let span = info_span!(
                "job",
                worker = %worker_id,
                job_id = %job.job_id,
                operation_id = %job.operation_id,
                kind = %job.kind,
                attempt = job.attempts,
            );
            if let Err(e) = self.execute_claimed(&job).instrument(span).await {
                error!(
                    job_id = %job.job_id,
                    error = %format!("{e:#}"),
                    "job execution errored; scheduling retry"
                );
                // Infra error (db hiccup mid-settle). Treat as retryable so
                // the job is not lost; re-execution is idempotent.
                if let Err(e2) = self.handle_failure(&job, JobError::retryable(format!("{e:#}"))).await {
                    error!(job_id = %job.job_id, error = %format!("{e2:#}"), "retry scheduling failed");
                }
            }
        }
    }

    async fn execute_claimed(&self, job: &QueueJobRow) -> Result<()> {
        let payload: JobPayload =
            serde_json::from_value(job.payload.clone()).context("decode job payload")?;

        match settle_started(&self.pool, &payload).await? {
            StartDisposition::Run => {}
            StartDisposition::AlreadyTerminal => {
                info!("operation already terminal; dropping job");
                queue::mark_done(&self.pool, &job.job_id).await?;
                return Ok(());
            }
            StartDisposition::Missing => {
                warn!("operation row missing; dropping job");
                queue::mark_dead(&self.pool, &job.job_id, "operation row missing").await?;
                return Ok(());
            }
        }

        let cancel = self.cancels.register(payload.operation_id).await;
        let ctx = ExecContext::new(
            job.job_id.clone(),
            payload.operation_id,
            job.attempts,
            cancel,
            self.progress.clone(),
        );

        // The subprocess runs here, between transactions: no DB connection
        // is held while the media tool works.
        let result = self.runner.run(&payload, ctx).await;
        self.cancels.deregister(payload.operation_id).await;

        match result {
            Ok(output) => {
                let settled = settle_completed(&self.pool, &payload, &output.result_path).await?;
                if !settled {
                    info!("lost settle race; discarding result");
                }
                queue::mark_done(&self.pool, &job.job_id).await?;
                Ok(())
            }
            Err(err) => self.handle_failure(job, err).await,
        }
    }

    async fn handle_failure(&self, job: &QueueJobRow, err: JobError) -> Result<()> {
        let payload: JobPayload =
            serde_json::from_value(job.payload.clone()).context("decode job payload")?;

        match err {
            JobError::Retryable { ref message } => {
                // attempts on the row counts completed attempts; this failed
                // run is attempt `attempts + 1`.
                if job.attempts + 1 >= self.settings.max_attempts {
                    warn!(attempts = job.attempts + 1, "attempts exhausted; job dead");
                    settle_failed(&self.pool, &payload, message, Some("retries_exhausted")).await?;
                    queue::mark_dead(&self.pool, &job.job_id, message).await?;
                } else {
                    let delay = backoff_delay(
                        job.attempts,
                        self.settings.backoff_base_secs,
                        self.settings.backoff_cap_secs,
                    );
                    let next = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(
                            self.settings.backoff_cap_secs as i64,
                        ));
                    info!(delay_ms = delay.as_millis() as u64, "retryable failure; requeued");
                    queue::retry_later(&self.pool, &job.job_id, next, message).await?;
                }
            }
            JobError::Permanent { ref message, ref code } => {
                settle_failed(&self.pool, &payload, message, code.as_deref()).await?;
                queue::mark_dead(&self.pool, &job.job_id, message).await?;
            }
            JobError::Cancelled => {
                // The cancel path usually settles the operation first; the
                // guarded transition makes this a no-op in that case.
                settle_failed(&self.pool, &payload, "cancelled", Some("cancelled")).await?;
                queue::mark_dead(&self.pool, &job.job_id, "cancelled").await?;
            }
        }

        Ok(())
    }
}
