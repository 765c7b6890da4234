//! Subprocess execution of the media tool.
//!
//! The runner owns no database state: it receives a [`JobPayload`], shells
//! out to ffmpeg/ffprobe, feeds stderr into the trace span, reports progress
//! markers, and enforces the per-kind wall-clock cap. Cancellation is
//! cooperative: the cancel flag is polled every 250ms while the child runs,
//! and a cancelled child is killed.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use fm_config::settings::MediaSettings;
use fm_queue::{ExecContext, JobError, JobOutput, JobRunner};
use fm_schemas::JobPayload;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::command::{self, ExecPlan, InputAsset};
use crate::paths;
use crate::progress::{parse_time_marker, percent_of};

/// How many trailing stderr lines to keep for failure classification.
const STDERR_TAIL: usize = 12;

/// stderr markers that indicate the input itself is bad; retrying cannot
/// help.
const PERMANENT_MARKERS: &[&str] = &[
    "Invalid data found when processing input",
    "No such file or directory",
    "Invalid argument",
    "does not contain any stream",
    "moov atom not found",
];

#[derive(Clone)]
pub struct MediaRunner {
    settings: MediaSettings,
    storage_root: String,
}

impl MediaRunner {
    pub fn new(settings: MediaSettings, storage_root: impl Into<String>) -> Self {
        Self {
            settings,
            storage_root: storage_root.into(),
        }
    }

    /// Probe `WxH` of the first video stream.
    pub async fn probe_dimensions(&self, input: &str) -> Result<(i32, i32)> {
        let out = self.run_probe(command::probe_dimensions_args(input)).await?;
        let line = out.trim();
        let (w, h) = line
            .split_once('x')
            .with_context(|| format!("unexpected ffprobe dimensions output: {line:?}"))?;
        Ok((
            w.trim().parse().context("parse probe width")?,
            h.trim().parse().context("parse probe height")?,
        ))
    }

    /// Probe container duration; `None` when the container does not report
    /// one (still images).
    pub async fn probe_duration(&self, input: &str) -> Result<Option<f64>> {
        let out = self.run_probe(command::probe_duration_args(input)).await?;
        Ok(out.trim().parse().ok())
    }

    /// Write the conventional thumbnail (5s seek, single JPEG frame).
    pub async fn thumbnail(&self, asset: &InputAsset) -> Result<String> {
        let (args, out) = command::thumbnail_args(&self.storage_root, asset);
        let status = Command::new(&self.settings.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("spawn ffmpeg for thumbnail")?;
        if !status.success() {
            anyhow::bail!("thumbnail generation failed with {status}");
        }
        Ok(out)
    }

    async fn run_probe(&self, args: Vec<String>) -> Result<String> {
        let output = Command::new(&self.settings.ffprobe)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .context("spawn ffprobe")?;

        if !output.status.success() {
            anyhow::bail!(
                "ffprobe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run one ffmpeg step: stream stderr, report progress, poll the cancel
    /// flag, enforce the deadline.
    async fn run_step(
        &self,
        args: &[String],
        ctx: &ExecContext,
        total_secs: Option<f64>,
        deadline: Instant,
        progress_base: u8,
        progress_span: u8,
    ) -> Result<(), JobError> {
        let mut child = Command::new(&self.settings.ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| JobError::retryable(format!("spawn {}: {e}", self.settings.ffmpeg)))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| JobError::retryable("ffmpeg stderr unavailable"))?;
        let mut lines = BufReader::new(stderr).lines();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL);
        let mut ticker = tokio::time::interval(Duration::from_millis(250));

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            debug!(target: "fm_media::tool", "{line}");
                            if tail.len() == STDERR_TAIL {
                                tail.pop_front();
                            }
                            tail.push_back(line.clone());

                            if let (Some(elapsed), Some(total)) = (parse_time_marker(&line), total_secs) {
                                let within = percent_of(elapsed, total);
                                let scaled = progress_base
                                    + ((within as u16 * progress_span as u16) / 100) as u8;
                                ctx.report_progress(scaled);
                            }
                        }
                        Ok(None) => {
                            // stderr closed: the child is exiting.
                            let status = child
                                .wait()
                                .await
                                .map_err(|e| JobError::retryable(format!("wait ffmpeg: {e}")))?;
                            if status.success() {
                                return Ok(());
                            }
                            return Err(classify_failure(status.code(), &tail));
                        }
                        Err(e) => {
                            let _ = child.kill().await;
                            return Err(JobError::retryable(format!("read ffmpeg stderr: {e}")));
                        }
                    }
                }
                _ = ticker.tick() => {
                    if ctx.cancel.is_cancelled() {
                        let _ = child.kill().await;
                        return Err(JobError::Cancelled);
                    }
                    if Instant::now() >= deadline {
                        warn!("media tool exceeded wall-clock cap; killing");
                        let _ = child.kill().await;
                        return Err(JobError::retryable("media tool timed out"));
                    }
                }
            }
        }
    }

    async fn execute(&self, job: &JobPayload, ctx: &ExecContext) -> Result<JobOutput, JobError> {
        if ctx.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let asset = InputAsset {
            asset_id: job.asset_id.clone(),
            kind: job.asset_kind,
            extension: job.asset_extension.clone(),
        };
        let plan: ExecPlan = command::build_plan(&self.storage_root, &asset, &job.params);

        // Progress baseline: the plan knows output seconds for trim/gif;
        // everything else is measured against the probed input duration.
        let total_secs = match plan.output_secs_hint {
            Some(secs) => Some(secs),
            None => {
                let input = paths::original(&self.storage_root, &asset.asset_id, &asset.extension);
                self.probe_duration(&input).await.ok().flatten()
            }
        };

        let timeout = self.settings.timeout_for(job.kind.as_str());
        let deadline = Instant::now() + timeout;

        let step_count = plan.steps.len() as u8;
        for (i, step) in plan.steps.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            let base = (i as u8) * (100 / step_count);
            let span = 100 / step_count;
            self.run_step(&step.args, ctx, total_secs, deadline, base, span)
                .await?;
        }

        for scratch in &plan.scratch {
            if let Err(e) = tokio::fs::remove_file(scratch).await {
                debug!(path = %scratch, error = %e, "scratch cleanup skipped");
            }
        }

        ctx.report_progress(100);
        Ok(JobOutput {
            result_path: plan.result_path,
        })
    }
}

impl JobRunner for MediaRunner {
    fn run<'a>(
        &'a self,
        job: &'a JobPayload,
        ctx: ExecContext,
    ) -> impl std::future::Future<Output = Result<JobOutput, JobError>> + Send + 'a {
        async move { self.execute(job, &ctx).await }
    }
}

/// Map a non-zero tool exit to the worker failure taxonomy using the stderr
/// tail. Unknown failures default to retryable; the attempt cap bounds the
/// damage.
fn classify_failure(code: Option<i32>, tail: &VecDeque<String>) -> JobError {
    let joined = tail.iter().cloned().collect::<Vec<_>>().join("\n");
    for marker in PERMANENT_MARKERS {
        if joined.contains(marker) {
            return JobError::Permanent {
                message: format!("media tool rejected input: {marker}"),
                code: Some("bad_input".to_string()),
            };
        }
    }
    JobError::retryable(match code {
        Some(code) => format!("media tool exited with code {code}"),
        None => "media tool killed by signal".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tail_of(lines: &[&str]) -> VecDeque<String> {
        lines.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn corrupt_input_is_permanent() {
        let err = classify_failure(
            Some(1),
            &tail_of(&["x", "Invalid data found when processing input"]),
        );
        assert!(matches!(err, JobError::Permanent { .. }));
    }

    #[test]
    fn unknown_exit_is_retryable() {
        let err = classify_failure(Some(137), &tail_of(&["something unusual"]));
        assert!(matches!(err, JobError::Retryable { .. }));
    }

    #[test]
    fn signal_death_is_retryable() {
        let err = classify_failure(None, &tail_of(&[]));
        assert!(matches!(err, JobError::Retryable { .. }));
    }
}
