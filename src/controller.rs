//! Generation job state machine.
//!
//! A controller owns at most one job. `submit` drives the job to `Polling`
//! and hands the rest to a background task, which polls the provider,
//! migrates the result and reports exactly one [`JobOutcome`] to the
//! observer. `cancel` may be called at any time; after it returns the
//! observer and progress callbacks never fire.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::errors::VaultError;
use crate::migrate::ArtifactMigrator;
use crate::models::{DurableRecord, GenerationJob, GenerationRequest, JobOutcome, JobStatus};
use crate::poller::{PollOutcome, PollTick, PollTicket, StatusPoller};
use crate::provider::GenerationProvider;

pub type ProgressCallback = Arc<dyn Fn(&PollTick) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(4000),
            max_attempts: 150,
        }
    }
}

pub struct GenerationController {
    provider: Arc<dyn GenerationProvider>,
    migrator: Arc<ArtifactMigrator>,
    clock: Arc<dyn Clock>,
    settings: PollSettings,
    progress: Option<ProgressCallback>,
    job: Arc<Mutex<GenerationJob>>,
    ticket: PollTicket,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GenerationController {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        migrator: Arc<ArtifactMigrator>,
        clock: Arc<dyn Clock>,
        settings: PollSettings,
    ) -> Self {
        Self {
            provider,
            migrator,
            clock,
            settings,
            progress: None,
            job: Arc::new(Mutex::new(GenerationJob::new())),
            ticket: PollTicket::new(),
            task: Mutex::new(None),
        }
    }

    /// Receive every poll tick. Ticks stop once the job is cancelled.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&PollTick) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn snapshot(&self) -> GenerationJob {
        lock(&self.job).clone()
    }

    pub fn status(&self) -> JobStatus {
        lock(&self.job).status
    }

    /// Submit `request` and start polling in the background. Returns the
    /// provider's polling handle.
    ///
    /// On submission failure the job becomes `Failed`, the error is returned
    /// and `observer` is dropped without being called.
    pub async fn submit<F>(&self, request: GenerationRequest, observer: F) -> Result<String, VaultError>
    where
        F: FnOnce(JobOutcome) + Send + 'static,
    {
        {
            let mut job = lock(&self.job);
            if job.status != JobStatus::Idle {
                return Err(VaultError::Conflict(format!(
                    "controller already has a job in state {:?}",
                    job.status
                )));
            }
            job.transition(JobStatus::Submitting)?;
            job.submitted_at = Some(self.clock.now());
        }

        let handle = match self.provider.submit(&request).await {
            Ok(handle) => handle,
            Err(e) => {
                let mut job = lock(&self.job);
                if job.transition(JobStatus::Failed).is_ok() {
                    job.error_detail = Some(e.to_string());
                    job.finished_at = Some(self.clock.now());
                    tracing::warn!("Job {} submission failed: {}", job.id, e);
                }
                return Err(e);
            }
        };

        {
            let mut job = lock(&self.job);
            job.job_handle = Some(handle.clone());
            if job.status == JobStatus::Cancelled {
                tracing::info!("Job {} cancelled during submission, not polling", job.id);
                return Ok(handle);
            }
            job.transition(JobStatus::Polling)?;
        }

        let runner = JobRunner {
            poller: StatusPoller::new(
                self.provider.clone(),
                self.settings.interval,
                self.settings.max_attempts,
            ),
            migrator: self.migrator.clone(),
            clock: self.clock.clone(),
            progress: self.progress.clone(),
            job: self.job.clone(),
            ticket: self.ticket.clone(),
        };
        let task_handle = handle.clone();
        let task = tokio::spawn(async move {
            runner.run(&task_handle, Box::new(observer)).await;
        });
        *lock(&self.task) = Some(task);

        Ok(handle)
    }

    /// Stop the job. Idempotent and safe from any state; a no-op once the
    /// job is terminal or before anything was submitted.
    pub fn cancel(&self) {
        {
            let mut job = lock(&self.job);
            if job.status.is_terminal() || job.status == JobStatus::Idle {
                return;
            }
            if job.transition(JobStatus::Cancelled).is_err() {
                return;
            }
            job.finished_at = Some(self.clock.now());
            tracing::info!("Job {} cancelled", job.id);
        }
        self.ticket.cancel();
    }

    /// Wait for the background task, if one was started.
    pub async fn wait(&self) {
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Generation task panicked: {}", e);
            }
        }
    }
}

impl Drop for GenerationController {
    fn drop(&mut self) {
        self.cancel();
    }
}

type Observer = Box<dyn FnOnce(JobOutcome) + Send>;

struct JobRunner {
    poller: StatusPoller,
    migrator: Arc<ArtifactMigrator>,
    clock: Arc<dyn Clock>,
    progress: Option<ProgressCallback>,
    job: Arc<Mutex<GenerationJob>>,
    ticket: PollTicket,
}

impl JobRunner {
    async fn run(self, handle: &str, observer: Observer) {
        let job = self.job.clone();
        let progress = self.progress.clone();
        let outcome = self
            .poller
            .poll(handle, &self.ticket, move |tick| {
                lock(&job).attempts = tick.attempt;
                if let Some(ref cb) = progress {
                    cb(tick);
                }
            })
            .await;

        match outcome {
            PollOutcome::Cancelled => {}
            PollOutcome::Failed(failure) => {
                self.finish(JobStatus::Failed, observer, |job| {
                    if let Some(attempts) = failure.attempts() {
                        job.attempts = attempts;
                    }
                    let detail = failure.error_detail();
                    job.error_detail = Some(detail.clone());
                    JobOutcome::Failed {
                        error_detail: detail,
                    }
                });
            }
            PollOutcome::Ready(sample) => {
                let entered_ready = self.ticket.fire(|| {
                    let mut job = lock(&self.job);
                    if job.transition(JobStatus::Ready).is_ok() {
                        job.result_reference = Some(self.migrator.classify(&sample));
                    }
                });
                if !entered_ready || lock(&self.job).status != JobStatus::Ready {
                    return;
                }

                let (record, migration_error) = match self.migrator.migrate(&sample, None).await {
                    Ok(record) => (record, None),
                    Err(e) => {
                        tracing::warn!("Migration of {} failed, keeping original URI: {}", sample, e);
                        (
                            DurableRecord::unmigrated(&sample, self.clock.now()),
                            Some(e.to_string()),
                        )
                    }
                };
                self.finish(JobStatus::Completed, observer, |_| JobOutcome::Completed {
                    record,
                    migration_error,
                });
            }
        }
    }

    /// Move to a terminal status and notify the observer, unless the job
    /// was cancelled first.
    fn finish<B>(&self, status: JobStatus, observer: Observer, build: B)
    where
        B: FnOnce(&mut GenerationJob) -> JobOutcome,
    {
        self.ticket.fire(|| {
            let outcome = {
                let mut job = lock(&self.job);
                if job.transition(status).is_err() {
                    return;
                }
                let outcome = build(&mut job);
                job.finished_at = Some(self.clock.now());
                job.outcome = Some(outcome.clone());
                tracing::info!("Job {} finished: {:?}", job.id, status);
                outcome
            };
            observer(outcome);
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
