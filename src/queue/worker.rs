//! The worker pool: leases jobs, runs them, keeps their locks alive.
//!
//! ```text
//!            ┌──────────── concurrency slots (Semaphore) ───────────┐
//! queue ──▶  wait for runnable job ─▶ rate limiter ─▶ lease ─▶ spawn │
//!            └──────────────────────────────────────────────────────┘
//!                                             │
//!                          select! { handler, lock renewal tick }
//!                                             │
//!                                  complete │ fail (retry / exhaust)
//! ```
//!
//! A janitor task runs beside the loop: it reclaims expired leases and trims
//! old completed and failed jobs every `clean_interval`. Jobs whose last
//! attempt was lost to lock expiry are handed to
//! [`JobHandler::on_abandoned`] by whichever of the two notices them first.
//!
//! Cancelling the shutdown token stops new leases; jobs already running are
//! awaited, never interrupted.

use super::job::{FailOutcome, JobSnapshot, JobState, Lease};
use super::store::{JobQueue, LOCK_EXPIRED};
use crate::config::WorkerConfig;
use crate::document::DocumentPipeline;
use crate::error::{PipelineError, QueueError};
use crate::metadata::{DocumentPatch, MetadataStore};
use crate::progress::ProgressReporter;
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Runs one attempt of a leased job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Returns the value stored as the job's result.
    async fn handle(
        &self,
        lease: &Lease,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<serde_json::Value, PipelineError>;

    /// A job failed for good without a handler attempt to report it: its
    /// last lease expired.
    async fn on_abandoned(&self, job: &JobSnapshot) {
        let _ = job;
    }
}

/// Runs the document pipeline for each job.
pub struct TileJobHandler {
    pipeline: DocumentPipeline,
}

impl TileJobHandler {
    pub fn new(pipeline: DocumentPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl JobHandler for TileJobHandler {
    async fn handle(
        &self,
        lease: &Lease,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<serde_json::Value, PipelineError> {
        let input = lease.payload.to_input()?;
        let result = self.pipeline.run(input, progress).await?;
        serde_json::to_value(&result)
            .map_err(|e| PipelineError::Internal(format!("cannot encode result: {e}")))
    }

    async fn on_abandoned(&self, job: &JobSnapshot) {
        let reason = job.failed_reason.as_deref().unwrap_or(LOCK_EXPIRED);
        if let Err(e) = self
            .pipeline
            .metadata()
            .update(&job.document_id, DocumentPatch::failed(reason))
            .await
        {
            warn!(job_id = job.id, document_id = %job.document_id, error = %e, "could not record abandoned job");
        }
    }
}

/// Lifecycle notifications from the pool.
///
/// Called from job tasks, possibly concurrently. All methods default to
/// no-ops so callers only override what they need.
pub trait WorkerEvents: Send + Sync {
    fn on_job_started(&self, lease: &Lease) {
        let _ = lease;
    }

    fn on_job_progress(&self, job_id: u64, document_id: &str, percent: u8) {
        let _ = (job_id, document_id, percent);
    }

    fn on_job_completed(&self, job_id: u64, document_id: &str) {
        let _ = (job_id, document_id);
    }

    fn on_job_failed(&self, job_id: u64, document_id: &str, error: &str, outcome: FailOutcome) {
        let _ = (job_id, document_id, error, outcome);
    }
}

pub struct NoopWorkerEvents;

impl WorkerEvents for NoopWorkerEvents {}

/// Persists progress on the leased job and forwards it to [`WorkerEvents`].
struct JobProgress {
    queue: Arc<JobQueue>,
    events: Arc<dyn WorkerEvents>,
    job_id: u64,
    token: Uuid,
    document_id: String,
}

#[async_trait]
impl ProgressReporter for JobProgress {
    async fn report(&self, percent: u8) {
        if let Err(e) = self.queue.update_progress(self.job_id, self.token, percent).await {
            debug!(job_id = self.job_id, error = %e, "progress not stored");
        }
        self.events
            .on_job_progress(self.job_id, &self.document_id, percent);
    }
}

/// A fixed-size pool of job runners over one [`JobQueue`].
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    events: Arc<dyn WorkerEvents>,
    config: WorkerConfig,
    worker_id: String,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self {
            queue,
            handler,
            events: Arc::new(NoopWorkerEvents),
            config,
            worker_id: format!("worker-{}", &id[..8]),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn WorkerEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Lease and run jobs until `shutdown` is cancelled, then wait for the
    /// jobs in flight.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), QueueError> {
        let slots = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let limiter = rate_limiter(&self.config);
        let mut tasks = JoinSet::new();
        let janitor = tokio::spawn(janitor(
            Arc::clone(&self.queue),
            Arc::clone(&self.handler),
            Arc::clone(&self.events),
            self.config.clone(),
            shutdown.child_token(),
        ));

        info!(
            worker_id = %self.worker_id,
            concurrency = self.config.concurrency,
            "worker pool started"
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            if !self.wait_for_work(&shutdown).await {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = limiter.until_ready() => {}
            }

            match self.queue.lease(&self.worker_id, self.config.lock_duration).await {
                Ok(Some(lease)) => {
                    tasks.spawn(run_job(
                        Arc::clone(&self.queue),
                        Arc::clone(&self.handler),
                        Arc::clone(&self.events),
                        self.config.clone(),
                        lease,
                        permit,
                    ));
                }
                // Another pool got there first.
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "lease failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
            report_abandoned(&self.queue, &*self.handler, &*self.events).await;

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "job task panicked");
                }
            }
        }

        info!(in_flight = tasks.len(), "worker pool draining");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "job task panicked");
            }
        }
        if let Err(e) = janitor.await {
            warn!(error = %e, "janitor task ended abnormally");
        }
        info!(worker_id = %self.worker_id, "worker pool stopped");
        Ok(())
    }

    /// Sleep until a job is leasable. Returns `false` on shutdown.
    async fn wait_for_work(&self, shutdown: &CancellationToken) -> bool {
        loop {
            let wait = match self.queue.next_ready_in().await {
                Some(d) if d.is_zero() => return true,
                Some(d) => d.min(self.config.poll_interval),
                None => self.config.poll_interval,
            };
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = self.queue.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

fn rate_limiter(config: &WorkerConfig) -> DefaultDirectRateLimiter {
    let max = NonZeroU32::new(config.rate_limit_max).unwrap_or(NonZeroU32::MIN);
    let quota = Quota::with_period(config.rate_limit_window / max.get())
        .map(|q| q.allow_burst(max))
        .unwrap_or_else(|| Quota::per_second(max));
    RateLimiter::direct(quota)
}

async fn run_job(
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    events: Arc<dyn WorkerEvents>,
    config: WorkerConfig,
    lease: Lease,
    _permit: OwnedSemaphorePermit,
) {
    let job_id = lease.job_id;
    let document_id = lease.payload.document_id.clone();
    let span = info_span!(
        "job",
        job_id,
        document_id = %document_id,
        correlation_id = %lease.payload.correlation_id,
        attempt = lease.attempts_made + 1,
    );

    async move {
        events.on_job_started(&lease);
        let reporter: Arc<dyn ProgressReporter> = Arc::new(JobProgress {
            queue: Arc::clone(&queue),
            events: Arc::clone(&events),
            job_id,
            token: lease.token,
            document_id: document_id.clone(),
        });

        let work = handler.handle(&lease, reporter);
        tokio::pin!(work);
        let mut renew = tokio::time::interval(config.lock_renew_interval);
        renew.tick().await;
        let mut lock_held = true;

        let outcome = loop {
            tokio::select! {
                result = &mut work => break result,
                _ = renew.tick(), if lock_held => {
                    if let Err(e) = queue.renew(job_id, lease.token, config.lock_duration).await {
                        warn!(error = %e, "lock renewal failed; job may run twice");
                        lock_held = false;
                    }
                }
            }
        };

        match outcome {
            Ok(value) => match queue.complete(job_id, lease.token, &value).await {
                Ok(()) => events.on_job_completed(job_id, &document_id),
                Err(e) => warn!(error = %e, "could not mark job completed"),
            },
            Err(err) => {
                let message = err.to_string();
                match queue.fail(job_id, lease.token, &message).await {
                    Ok(outcome) => events.on_job_failed(job_id, &document_id, &message, outcome),
                    Err(e) => warn!(error = %e, "could not record job failure"),
                }
            }
        }
    }
    .instrument(span)
    .await
}

/// Hand every job lost to lock expiry to the handler and the event sink.
async fn report_abandoned(queue: &JobQueue, handler: &dyn JobHandler, events: &dyn WorkerEvents) {
    let jobs = match queue.take_abandoned().await {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(error = %e, "could not collect abandoned jobs");
            return;
        }
    };
    for job in jobs {
        let reason = job.failed_reason.as_deref().unwrap_or(LOCK_EXPIRED);
        warn!(job_id = job.id, document_id = %job.document_id, reason, "job abandoned");
        handler.on_abandoned(&job).await;
        events.on_job_failed(
            job.id,
            &job.document_id,
            reason,
            FailOutcome::Exhausted {
                attempts_made: job.attempts_made,
            },
        );
    }
}

async fn janitor(
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    events: Arc<dyn WorkerEvents>,
    config: WorkerConfig,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.clean_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Err(e) = queue.reclaim_expired_locks().await {
            warn!(error = %e, "lease reclaim failed");
        }
        report_abandoned(&queue, &*handler, &*events).await;
        let passes = [
            (JobState::Completed, config.completed_max_age, config.completed_clean_limit),
            (JobState::Failed, config.failed_max_age, config.failed_clean_limit),
        ];
        for (state, max_age, limit) in passes {
            match queue.clean(max_age, limit, state).await {
                Ok(0) => {}
                Ok(n) => info!(state = state.as_str(), removed = n, "old jobs cleaned"),
                Err(e) => warn!(state = state.as_str(), error = %e, "queue clean failed"),
            }
        }
    }
}

/// Resolve once no job is waiting, delayed or active.
pub async fn drain(queue: &JobQueue, poll: Duration) {
    while queue.counts().await.pending() > 0 {
        tokio::select! {
            _ = queue.changed() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
}
