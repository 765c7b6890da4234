//! Scripted job runner standing in for the media tool in scenarios.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use fm_queue::{ExecContext, JobError, JobOutput, JobRunner};
use fm_schemas::JobPayload;

/// What one scripted execution does.
#[derive(Debug, Clone)]
pub enum FakeOutcome {
    /// Succeed with `{asset_id}/fake-output` after reporting progress.
    Succeed,
    /// Fail with a retryable error.
    FailRetryable(&'static str),
    /// Fail permanently.
    FailPermanent(&'static str),
    /// Poll the cancel flag until it flips, then report cancellation.
    WaitForCancel,
}

/// Plays back a script of outcomes, then repeats the last one. Counts runs
/// so tests can assert at-least-once / exactly-once behavior.
pub struct FakeRunner {
    script: Mutex<VecDeque<FakeOutcome>>,
    last: FakeOutcome,
    runs: AtomicUsize,
}

impl FakeRunner {
    pub fn always(outcome: FakeOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            last: outcome,
            runs: AtomicUsize::new(0),
        }
    }

    /// Play the listed outcomes in order, then repeat the final entry.
    pub fn scripted(outcomes: Vec<FakeOutcome>) -> Self {
        let mut q: VecDeque<FakeOutcome> = outcomes.into();
        let last = q.back().cloned().unwrap_or(FakeOutcome::Succeed);
        Self {
            script: Mutex::new(q),
            last,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> FakeOutcome {
        let mut script = self.script.lock().expect("fake runner script poisoned");
        script.pop_front().unwrap_or_else(|| self.last.clone())
    }
}

impl JobRunner for FakeRunner {
    fn run<'a>(
        &'a self,
        job: &'a JobPayload,
        ctx: ExecContext,
    ) -> impl std::future::Future<Output = Result<JobOutput, JobError>> + Send + 'a {
        async move {
            self.runs.fetch_add(1, Ordering::SeqCst);

            match self.next_outcome() {
                FakeOutcome::Succeed => {
                    ctx.report_progress(50);
                    ctx.report_progress(100);
                    Ok(JobOutput {
                        result_path: format!("storage/{}/fake-output", job.asset_id),
                    })
                }
                FakeOutcome::FailRetryable(msg) => Err(JobError::retryable(msg)),
                FakeOutcome::FailPermanent(msg) => Err(JobError::Permanent {
                    message: msg.to_string(),
                    code: Some("bad_input".to_string()),
                }),
                FakeOutcome::WaitForCancel => {
                    loop {
                        if ctx.cancel.is_cancelled() {
                            return Err(JobError::Cancelled);
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }
    }
}
