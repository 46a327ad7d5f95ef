//! The durable job queue.
//!
//! All state sits behind one async mutex; every mutation is applied to the
//! in-memory map and, for a queue opened with [`JobQueue::open`], written
//! through to a JSON snapshot (temp file + rename, so a crash leaves either
//! the old or the new snapshot, never a torn one).
//!
//! Delivery is at-least-once. A lease carries a random token and an expiry;
//! every later call for that attempt must present the token. A lease that is
//! not renewed before it expires is reclaimed on the next [`JobQueue::lease`]
//! call and counts as a failed attempt. When that was the last attempt, no
//! handler is left to report the failure, so a snapshot of the job is parked
//! until a worker collects it with [`JobQueue::take_abandoned`].

use super::job::{FailOutcome, Job, JobCounts, JobPayload, JobSnapshot, JobState, Lease};
use crate::config::JobOptions;
use crate::error::QueueError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Failure reason recorded when a lease runs out.
pub const LOCK_EXPIRED: &str = "lock expired";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueState {
    next_id: u64,
    jobs: BTreeMap<u64, Job>,
    /// Jobs failed by lock expiry whose failure nobody has reported yet.
    #[serde(default)]
    abandoned: Vec<JobSnapshot>,
    #[serde(skip)]
    closed: bool,
}

/// A job queue with leases, retries and retention.
#[derive(Debug)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    changed: Notify,
    snapshot: Option<PathBuf>,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn after(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    t.checked_add_signed(to_chrono(d)).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn before(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    t.checked_sub_signed(to_chrono(d)).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl JobQueue {
    /// A queue that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_id: 1,
                ..Default::default()
            }),
            changed: Notify::new(),
            snapshot: None,
        }
    }

    /// Open (or create) a queue persisted at `path`.
    ///
    /// Jobs that were active when the snapshot was written keep their lock
    /// expiry, so they are picked up again once it passes.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        let persist_err = |detail: String| QueueError::Persistence {
            path: path.clone(),
            detail,
        };
        let state = match tokio::fs::read(&path).await {
            Ok(raw) => {
                let mut state: QueueState =
                    serde_json::from_slice(&raw).map_err(|e| persist_err(e.to_string()))?;
                let max_id = state.jobs.keys().next_back().copied().unwrap_or(0);
                state.next_id = state.next_id.max(max_id + 1);
                info!(path = %path.display(), jobs = state.jobs.len(), "queue snapshot loaded");
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => QueueState {
                next_id: 1,
                ..Default::default()
            },
            Err(e) => return Err(persist_err(e.to_string())),
        };
        Ok(Self {
            state: Mutex::new(state),
            changed: Notify::new(),
            snapshot: Some(path),
        })
    }

    async fn persist(&self, state: &QueueState) -> Result<(), QueueError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let persist_err = |detail: String| QueueError::Persistence {
            path: path.clone(),
            detail,
        };
        let json = serde_json::to_vec(state).map_err(|e| persist_err(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| persist_err(e.to_string()))?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| persist_err(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| persist_err(e.to_string()))?;
        Ok(())
    }

    /// Persist, then wake everyone waiting on a change.
    async fn commit(&self, state: MutexGuard<'_, QueueState>) -> Result<(), QueueError> {
        let result = self.persist(&state).await;
        drop(state);
        self.changed.notify_waiters();
        result
    }

    /// Stop accepting new jobs. Leased jobs can still finish.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.changed.notify_waiters();
    }

    pub async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> Result<JobSnapshot, QueueError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        let id = state.next_id;
        state.next_id += 1;
        let job = Job::new(id, payload, options);
        let snapshot = job.snapshot();
        state.jobs.insert(id, job);
        // A job the snapshot does not hold is not accepted.
        if let Err(e) = self.persist(&state).await {
            state.jobs.remove(&id);
            return Err(e);
        }
        drop(state);
        self.changed.notify_waiters();
        debug!(job_id = id, document_id = %snapshot.document_id, "job enqueued");
        Ok(snapshot)
    }

    /// Lease the oldest runnable job for `worker_id`, if any.
    pub async fn lease(&self, worker_id: &str, lock_duration: Duration) -> Result<Option<Lease>, QueueError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut dirty = reclaim_expired(&mut state, now) > 0;
        dirty |= promote_delayed(&mut state, now) > 0;

        let next = state
            .jobs
            .values_mut()
            .find(|j| j.state == JobState::Waiting);
        let lease = match next {
            Some(job) => {
                let token = Uuid::new_v4();
                let expires = after(now, lock_duration);
                job.state = JobState::Active;
                job.lock_token = Some(token);
                job.lock_expires_at = Some(expires);
                job.worker_id = Some(worker_id.to_string());
                job.progress = 0;
                job.processed_at = Some(now);
                debug!(job_id = job.id, worker_id, attempt = job.attempts_made + 1, "job leased");
                Some(Lease {
                    job_id: job.id,
                    token,
                    payload: job.payload.clone(),
                    attempts_made: job.attempts_made,
                    max_attempts: job.options.attempts,
                    lock_expires_at: expires,
                })
            }
            None => None,
        };

        if lease.is_some() || dirty {
            self.commit(state).await?;
        }
        Ok(lease)
    }

    /// Requeue or fail every active job whose lock has expired.
    pub async fn reclaim_expired_locks(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let n = reclaim_expired(&mut state, Utc::now());
        if n > 0 {
            self.commit(state).await?;
        }
        Ok(n)
    }

    /// Drain the jobs that ran out of attempts through lock expiry.
    pub async fn take_abandoned(&self) -> Result<Vec<JobSnapshot>, QueueError> {
        let mut state = self.state.lock().await;
        if state.abandoned.is_empty() {
            return Ok(Vec::new());
        }
        let jobs = std::mem::take(&mut state.abandoned);
        self.commit(state).await?;
        Ok(jobs)
    }

    /// Time until the next job becomes leasable: zero when one is waiting,
    /// `None` when nothing is queued.
    pub async fn next_ready_in(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        let now = Utc::now();
        state
            .jobs
            .values()
            .filter_map(|j| match j.state {
                JobState::Waiting => Some(Duration::ZERO),
                JobState::Delayed => Some(
                    j.run_at
                        .map(|t| (t - now).to_std().unwrap_or(Duration::ZERO))
                        .unwrap_or(Duration::ZERO),
                ),
                JobState::Active => j
                    .lock_expires_at
                    .map(|t| (t - now).to_std().unwrap_or(Duration::ZERO)),
                _ => None,
            })
            .min()
    }

    fn active_mut<'a>(
        state: &'a mut QueueState,
        job_id: u64,
        token: Uuid,
    ) -> Result<&'a mut Job, QueueError> {
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound { job_id })?;
        if job.state != JobState::Active || job.lock_token != Some(token) {
            return Err(QueueError::LockLost { job_id });
        }
        Ok(job)
    }

    /// Extend a held lease. Fails with [`QueueError::LockLost`] when the lease
    /// has already expired or been reclaimed.
    pub async fn renew(&self, job_id: u64, token: Uuid, lock_duration: Duration) -> Result<DateTime<Utc>, QueueError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let job = Self::active_mut(&mut state, job_id, token)?;
        if job.lock_expires_at.is_some_and(|t| t <= now) {
            return Err(QueueError::LockLost { job_id });
        }
        let expires = after(now, lock_duration);
        job.lock_expires_at = Some(expires);
        self.commit(state).await?;
        Ok(expires)
    }

    pub async fn update_progress(&self, job_id: u64, token: Uuid, percent: u8) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let job = Self::active_mut(&mut state, job_id, token)?;
        job.progress = percent.min(100);
        self.commit(state).await
    }

    /// Mark the attempt successful and store its result.
    pub async fn complete<T: Serialize>(&self, job_id: u64, token: Uuid, result: &T) -> Result<(), QueueError> {
        let value = serde_json::to_value(result).map_err(|e| QueueError::InvalidReturnValue {
            job_id,
            detail: e.to_string(),
        })?;
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let job = Self::active_mut(&mut state, job_id, token)?;
        job.state = JobState::Completed;
        job.progress = 100;
        job.return_value = Some(value);
        job.failed_reason = None;
        job.finished_at = Some(now);
        job.release_lock();
        let keep = job.options.retain_completed;
        trim_terminal(&mut state, JobState::Completed, keep);
        info!(job_id, "job completed");
        self.commit(state).await
    }

    /// Record a failed attempt and schedule the retry, if one remains.
    pub async fn fail(&self, job_id: u64, token: Uuid, reason: &str) -> Result<FailOutcome, QueueError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let job = Self::active_mut(&mut state, job_id, token)?;
        let outcome = record_failure(job, reason, now, true);
        if let FailOutcome::Exhausted { .. } = outcome {
            let keep = job.options.retain_failed;
            trim_terminal(&mut state, JobState::Failed, keep);
        }
        self.commit(state).await?;
        Ok(outcome)
    }

    /// Remove a job that has not started. Active jobs are refused.
    pub async fn remove(&self, job_id: u64) -> Result<JobSnapshot, QueueError> {
        let mut state = self.state.lock().await;
        match state.jobs.get(&job_id) {
            None => return Err(QueueError::NotFound { job_id }),
            Some(job) if job.state == JobState::Active => {
                return Err(QueueError::JobActive { job_id })
            }
            Some(_) => {}
        }
        let snapshot = state
            .jobs
            .remove(&job_id)
            .map(|j| j.snapshot())
            .ok_or(QueueError::NotFound { job_id })?;
        self.commit(state).await?;
        Ok(snapshot)
    }

    /// Remove the waiting or delayed jobs for `document_id`. Returns their ids.
    ///
    /// If the document's only pending job is already running, nothing is
    /// removed and [`QueueError::JobActive`] is returned.
    pub async fn cancel_document(&self, document_id: &str) -> Result<Vec<u64>, QueueError> {
        let mut state = self.state.lock().await;
        let mut removed = Vec::new();
        let mut active = None;
        for job in state.jobs.values() {
            if job.payload.document_id != document_id {
                continue;
            }
            match job.state {
                JobState::Waiting | JobState::Delayed => removed.push(job.id),
                JobState::Active => active = Some(job.id),
                _ => {}
            }
        }
        if removed.is_empty() {
            return match active {
                Some(job_id) => Err(QueueError::JobActive { job_id }),
                None => Ok(removed),
            };
        }
        for id in &removed {
            state.jobs.remove(id);
        }
        info!(document_id, jobs = ?removed, "queued jobs cancelled");
        self.commit(state).await?;
        Ok(removed)
    }

    pub async fn get(&self, job_id: u64) -> Option<JobSnapshot> {
        self.state.lock().await.jobs.get(&job_id).map(Job::snapshot)
    }

    /// Every job for `document_id`, oldest first.
    pub async fn find_by_document(&self, document_id: &str) -> Vec<JobSnapshot> {
        self.state
            .lock()
            .await
            .jobs
            .values()
            .filter(|j| j.payload.document_id == document_id)
            .map(Job::snapshot)
            .collect()
    }

    pub async fn counts(&self) -> JobCounts {
        let state = self.state.lock().await;
        let mut counts = JobCounts::default();
        for job in state.jobs.values() {
            counts.add(job.state);
        }
        counts
    }

    /// Remove up to `limit` jobs in the terminal `state` that finished more
    /// than `max_age` ago, oldest first. Returns how many were removed.
    pub async fn clean(&self, max_age: Duration, limit: usize, state_filter: JobState) -> Result<usize, QueueError> {
        if !state_filter.is_terminal() {
            return Ok(0);
        }
        let mut state = self.state.lock().await;
        let cutoff = before(Utc::now(), max_age);
        let mut candidates: Vec<(DateTime<Utc>, u64)> = state
            .jobs
            .values()
            .filter(|j| j.state == state_filter)
            .filter_map(|j| j.finished_at.filter(|t| *t <= cutoff).map(|t| (t, j.id)))
            .collect();
        candidates.sort();
        candidates.truncate(limit);
        for (_, id) in &candidates {
            state.jobs.remove(id);
        }
        let n = candidates.len();
        if n > 0 {
            debug!(state = state_filter.as_str(), removed = n, "queue cleaned");
            self.commit(state).await?;
        }
        Ok(n)
    }

    /// Wait until `job_id` reaches a terminal state and decode its result.
    pub async fn wait_for_completion<T: DeserializeOwned>(&self, job_id: u64) -> Result<T, QueueError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock().await;
                let job = state.jobs.get(&job_id).ok_or(QueueError::NotFound { job_id })?;
                match job.state {
                    JobState::Completed => {
                        let value = job.return_value.clone().unwrap_or(serde_json::Value::Null);
                        return serde_json::from_value(value).map_err(|e| {
                            QueueError::InvalidReturnValue {
                                job_id,
                                detail: e.to_string(),
                            }
                        });
                    }
                    JobState::Failed => {
                        return Err(QueueError::RetriesExhausted {
                            job_id,
                            attempts: job.attempts_made,
                            last_error: job.failed_reason.clone().unwrap_or_default(),
                        })
                    }
                    _ => {}
                }
            }
            notified.await;
        }
    }

    /// Resolves on the next queue mutation.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

/// Apply a failed attempt to `job`. `backoff` is false for expired locks,
/// which go straight back to waiting.
fn record_failure(job: &mut Job, reason: &str, now: DateTime<Utc>, backoff: bool) -> FailOutcome {
    job.attempts_made += 1;
    job.failed_reason = Some(reason.to_string());
    job.release_lock();

    if job.attempts_made >= job.options.attempts {
        job.state = JobState::Failed;
        job.finished_at = Some(now);
        warn!(job_id = job.id, attempts = job.attempts_made, reason, "job failed");
        return FailOutcome::Exhausted {
            attempts_made: job.attempts_made,
        };
    }

    let delay = if backoff {
        job.options.backoff.delay_for(job.attempts_made)
    } else {
        Duration::ZERO
    };
    if delay.is_zero() {
        job.state = JobState::Waiting;
        job.run_at = None;
    } else {
        job.state = JobState::Delayed;
        job.run_at = Some(after(now, delay));
    }
    warn!(
        job_id = job.id,
        attempts = job.attempts_made,
        delay_ms = delay.as_millis() as u64,
        reason,
        "job attempt failed, retrying"
    );
    FailOutcome::Retried {
        attempts_made: job.attempts_made,
        delay,
    }
}

fn reclaim_expired(state: &mut QueueState, now: DateTime<Utc>) -> usize {
    let mut reclaimed = 0;
    let mut exhausted = Vec::new();
    for job in state.jobs.values_mut() {
        let expired = job.state == JobState::Active && job.lock_expires_at.is_some_and(|t| t <= now);
        if expired {
            if let FailOutcome::Exhausted { .. } = record_failure(job, LOCK_EXPIRED, now, false) {
                exhausted.push((job.snapshot(), job.options.retain_failed));
            }
            reclaimed += 1;
        }
    }
    for (snapshot, keep) in exhausted {
        state.abandoned.push(snapshot);
        trim_terminal(state, JobState::Failed, keep);
    }
    reclaimed
}

fn promote_delayed(state: &mut QueueState, now: DateTime<Utc>) -> usize {
    let mut n = 0;
    for job in state.jobs.values_mut() {
        if job.state == JobState::Delayed && job.run_at.map_or(true, |t| t <= now) {
            job.state = JobState::Waiting;
            job.run_at = None;
            n += 1;
        }
    }
    n
}

/// Keep only the `keep` most recently finished jobs in `terminal`.
fn trim_terminal(state: &mut QueueState, terminal: JobState, keep: usize) {
    let mut finished: Vec<(Option<DateTime<Utc>>, u64)> = state
        .jobs
        .values()
        .filter(|j| j.state == terminal)
        .map(|j| (j.finished_at, j.id))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        state.jobs.remove(&id);
    }
}
