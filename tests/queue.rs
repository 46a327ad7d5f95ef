//! Worker pool behaviour against a real [`JobQueue`] with scripted handlers.

use async_trait::async_trait;
use edgequake_pdf2tiles::queue::{FailOutcome, Lease};
use edgequake_pdf2tiles::{
    Backoff, BackoffKind, JobHandler, JobOptions, JobPayload, JobQueue, JobState, PipelineError,
    ProgressReporter, QueueError, WorkerConfig, WorkerEvents, WorkerPool,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

// ── Test helpers ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Script {
    /// Sleep, report progress, succeed.
    Succeed(Duration),
    /// Fail every attempt.
    AlwaysFail,
    /// Fail the first attempt, then succeed.
    FailOnce,
}

struct ScriptedHandler {
    script: Script,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    starts: Mutex<Vec<Instant>>,
}

impl ScriptedHandler {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn handle(
        &self,
        lease: &Lease,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<serde_json::Value, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.starts.lock().unwrap().push(Instant::now());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let outcome = match self.script {
            Script::Succeed(d) => {
                progress.report(30).await;
                tokio::time::sleep(d).await;
                progress.report(60).await;
                Ok(json!({ "document": lease.payload.document_id }))
            }
            Script::AlwaysFail => Err(PipelineError::Internal("tool crashed".into())),
            Script::FailOnce if lease.attempts_made == 0 => {
                Err(PipelineError::Internal("transient".into()))
            }
            Script::FailOnce => Ok(json!({ "attempt": lease.attempts_made + 1 })),
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

#[derive(Default)]
struct Events {
    progress: Mutex<Vec<u8>>,
    completed: AtomicUsize,
    failures: Mutex<Vec<FailOutcome>>,
}

impl WorkerEvents for Events {
    fn on_job_progress(&self, _job_id: u64, _document_id: &str, percent: u8) {
        self.progress.lock().unwrap().push(percent);
    }

    fn on_job_completed(&self, _job_id: u64, _document_id: &str) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_job_failed(&self, _job_id: u64, _document_id: &str, _error: &str, outcome: FailOutcome) {
        self.failures.lock().unwrap().push(outcome);
    }
}

fn payload(document_id: &str) -> JobPayload {
    JobPayload::new(b"%PDF-1.7\n", "proj1", document_id, "plan.pdf", "corr0001")
}

fn fast_retry(attempts: u32) -> JobOptions {
    JobOptions {
        attempts,
        backoff: Backoff {
            kind: BackoffKind::Fixed,
            delay_ms: 50,
        },
        ..JobOptions::default()
    }
}

fn worker_config() -> edgequake_pdf2tiles::WorkerConfigBuilder {
    WorkerConfig::builder()
        .rate_limit(1000, Duration::from_secs(1))
        .poll_interval(Duration::from_millis(20))
}

fn start(
    queue: &Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    events: Arc<Events>,
) -> (CancellationToken, JoinHandle<Result<(), QueueError>>) {
    let pool = WorkerPool::new(Arc::clone(queue), handler, config).with_events(events);
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await }
    });
    (shutdown, handle)
}

async fn stop(shutdown: CancellationToken, handle: JoinHandle<Result<(), QueueError>>) {
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("pool did not stop")
        .unwrap()
        .unwrap();
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn completes_jobs_and_forwards_progress() {
    let queue = Arc::new(JobQueue::in_memory());
    let job = queue.enqueue(payload("doc1"), JobOptions::default()).await.unwrap();
    let handler = ScriptedHandler::new(Script::Succeed(Duration::from_millis(10)));
    let events = Arc::new(Events::default());
    let (shutdown, handle) = start(
        &queue,
        handler.clone(),
        worker_config().build().unwrap(),
        Arc::clone(&events),
    );

    let value: serde_json::Value = assert_ok!(queue.wait_for_completion(job.id).await);
    assert_eq!(value["document"], "doc1");
    stop(shutdown, handle).await;

    let snap = queue.get(job.id).await.unwrap();
    assert_eq!(snap.state, JobState::Completed);
    assert_eq!(snap.progress, 100);
    assert_eq!(*events.progress.lock().unwrap(), vec![30, 60]);
    assert_eq!(events.completed.load(Ordering::SeqCst), 1);
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn failed_attempt_is_retried_after_backoff() {
    let queue = Arc::new(JobQueue::in_memory());
    let job = queue.enqueue(payload("doc1"), fast_retry(3)).await.unwrap();
    let handler = ScriptedHandler::new(Script::FailOnce);
    let events = Arc::new(Events::default());
    let (shutdown, handle) = start(
        &queue,
        handler.clone(),
        worker_config().build().unwrap(),
        Arc::clone(&events),
    );

    let value: serde_json::Value = tokio::time::timeout(
        Duration::from_secs(5),
        queue.wait_for_completion(job.id),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(value["attempt"], 2);
    stop(shutdown, handle).await;

    assert_eq!(handler.calls(), 2);
    let starts = handler.starts.lock().unwrap().clone();
    assert!(starts[1] - starts[0] >= Duration::from_millis(45));
    assert_eq!(
        *events.failures.lock().unwrap(),
        vec![FailOutcome::Retried {
            attempts_made: 1,
            delay: Duration::from_millis(50)
        }]
    );
    assert_eq!(queue.get(job.id).await.unwrap().attempts_made, 1);
}

#[tokio::test]
async fn exhausted_retries_surface_to_the_waiter() {
    let queue = Arc::new(JobQueue::in_memory());
    let job = queue.enqueue(payload("doc1"), fast_retry(2)).await.unwrap();
    let handler = ScriptedHandler::new(Script::AlwaysFail);
    let events = Arc::new(Events::default());
    let (shutdown, handle) = start(
        &queue,
        handler.clone(),
        worker_config().build().unwrap(),
        Arc::clone(&events),
    );

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        queue.wait_for_completion::<serde_json::Value>(job.id),
    )
    .await
    .unwrap()
    .unwrap_err();
    stop(shutdown, handle).await;

    match err {
        QueueError::RetriesExhausted {
            job_id,
            attempts,
            last_error,
        } => {
            assert_eq!(job_id, job.id);
            assert_eq!(attempts, 2);
            assert!(last_error.contains("tool crashed"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(handler.calls(), 2);
    let failures = events.failures.lock().unwrap().clone();
    assert_eq!(failures.len(), 2);
    assert!(matches!(failures[0], FailOutcome::Retried { attempts_made: 1, .. }));
    assert_eq!(failures[1], FailOutcome::Exhausted { attempts_made: 2 });
    assert_eq!(queue.counts().await.failed, 1);
}

#[tokio::test]
async fn concurrency_bound_is_respected() {
    let queue = Arc::new(JobQueue::in_memory());
    for i in 0..6 {
        queue
            .enqueue(payload(&format!("doc{i}")), JobOptions::default())
            .await
            .unwrap();
    }
    let handler = ScriptedHandler::new(Script::Succeed(Duration::from_millis(60)));
    let (shutdown, handle) = start(
        &queue,
        handler.clone(),
        worker_config().concurrency(2).build().unwrap(),
        Arc::new(Events::default()),
    );

    tokio::time::timeout(
        Duration::from_secs(5),
        edgequake_pdf2tiles::queue::drain(&queue, Duration::from_millis(20)),
    )
    .await
    .unwrap();
    stop(shutdown, handle).await;

    assert_eq!(handler.calls(), 6);
    assert_eq!(handler.max_active.load(Ordering::SeqCst), 2);
    assert_eq!(queue.counts().await.completed, 6);
}

#[tokio::test]
async fn rate_limiter_spaces_job_starts() {
    let queue = Arc::new(JobQueue::in_memory());
    for i in 0..4 {
        queue
            .enqueue(payload(&format!("doc{i}")), JobOptions::default())
            .await
            .unwrap();
    }
    let handler = ScriptedHandler::new(Script::Succeed(Duration::ZERO));
    let config = WorkerConfig::builder()
        .concurrency(4)
        .rate_limit(2, Duration::from_millis(600))
        .poll_interval(Duration::from_millis(20))
        .build()
        .unwrap();
    let begin = Instant::now();
    let (shutdown, handle) = start(&queue, handler.clone(), config, Arc::new(Events::default()));

    tokio::time::timeout(
        Duration::from_secs(5),
        edgequake_pdf2tiles::queue::drain(&queue, Duration::from_millis(20)),
    )
    .await
    .unwrap();
    let elapsed = begin.elapsed();
    stop(shutdown, handle).await;

    // Burst of two, then one start every 300ms.
    let starts = handler.starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 4);
    assert!(starts[1] - begin < Duration::from_millis(200));
    assert!(starts[3] - begin >= Duration::from_millis(500), "{:?}", starts[3] - begin);
    assert!(elapsed >= Duration::from_millis(500));
}

#[tokio::test]
async fn lock_renewal_keeps_long_jobs_leased() {
    let queue = Arc::new(JobQueue::in_memory());
    let job = queue.enqueue(payload("doc1"), JobOptions::default()).await.unwrap();
    let handler = ScriptedHandler::new(Script::Succeed(Duration::from_millis(700)));
    let config = worker_config()
        .concurrency(2)
        .lock_duration(Duration::from_millis(250))
        .lock_renew_interval(Duration::from_millis(50))
        .build()
        .unwrap();
    let (shutdown, handle) = start(&queue, handler.clone(), config, Arc::new(Events::default()));

    let _: serde_json::Value = tokio::time::timeout(
        Duration::from_secs(5),
        queue.wait_for_completion(job.id),
    )
    .await
    .unwrap()
    .unwrap();
    stop(shutdown, handle).await;

    // Never reclaimed, so never run twice.
    assert_eq!(handler.calls(), 1);
    assert_eq!(queue.get(job.id).await.unwrap().attempts_made, 0);
}

#[tokio::test]
async fn expired_lease_of_a_dead_worker_is_requeued() {
    let queue = Arc::new(JobQueue::in_memory());
    let job = queue.enqueue(payload("doc1"), JobOptions::default()).await.unwrap();

    // A worker that leases and then disappears without renewing.
    let dead = queue
        .lease("crashed-worker", Duration::from_millis(150))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dead.job_id, job.id);

    let handler = ScriptedHandler::new(Script::Succeed(Duration::from_millis(10)));
    let (shutdown, handle) = start(
        &queue,
        handler.clone(),
        worker_config().build().unwrap(),
        Arc::new(Events::default()),
    );

    let _: serde_json::Value = tokio::time::timeout(
        Duration::from_secs(5),
        queue.wait_for_completion(job.id),
    )
    .await
    .unwrap()
    .unwrap();
    stop(shutdown, handle).await;

    assert_eq!(handler.calls(), 1);
    let snap = queue.get(job.id).await.unwrap();
    assert_eq!(snap.attempts_made, 1);
    assert_eq!(snap.state, JobState::Completed);

    // The dead worker's token is stale.
    assert!(matches!(
        queue.complete(job.id, dead.token, &json!(null)).await,
        Err(QueueError::LockLost { .. })
    ));
}

#[tokio::test]
async fn shutdown_waits_for_running_jobs_and_stops_leasing() {
    let queue = Arc::new(JobQueue::in_memory());
    let first = queue.enqueue(payload("doc1"), JobOptions::default()).await.unwrap();
    let second = queue.enqueue(payload("doc2"), JobOptions::default()).await.unwrap();
    let handler = ScriptedHandler::new(Script::Succeed(Duration::from_millis(300)));
    let (shutdown, handle) = start(
        &queue,
        handler.clone(),
        worker_config().concurrency(1).build().unwrap(),
        Arc::new(Events::default()),
    );

    while handler.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    stop(shutdown, handle).await;

    assert_eq!(handler.calls(), 1);
    assert_eq!(queue.get(first.id).await.unwrap().state, JobState::Completed);
    assert_eq!(queue.get(second.id).await.unwrap().state, JobState::Waiting);
}

#[tokio::test]
async fn cancelled_document_is_never_run() {
    let queue = Arc::new(JobQueue::in_memory());
    let keep = queue.enqueue(payload("doc1"), JobOptions::default()).await.unwrap();
    let cancelled = queue.enqueue(payload("doc2"), JobOptions::default()).await.unwrap();
    assert_eq!(queue.cancel_document("doc2").await.unwrap(), vec![cancelled.id]);

    let handler = ScriptedHandler::new(Script::Succeed(Duration::ZERO));
    let (shutdown, handle) = start(
        &queue,
        handler.clone(),
        worker_config().build().unwrap(),
        Arc::new(Events::default()),
    );
    let _: serde_json::Value = queue.wait_for_completion(keep.id).await.unwrap();
    stop(shutdown, handle).await;

    assert_eq!(handler.calls(), 1);
    assert!(queue.get(cancelled.id).await.is_none());
    assert!(queue.find_by_document("doc2").await.is_empty());
}

#[tokio::test]
async fn durable_queue_resumes_interrupted_work() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.json");
    let job_id = {
        let queue = JobQueue::open(&path).await.unwrap();
        let job = queue.enqueue(payload("doc1"), JobOptions::default()).await.unwrap();
        // Leased by a process that then died.
        queue.lease("gone", Duration::from_millis(100)).await.unwrap().unwrap();
        job.id
    };

    let queue = Arc::new(JobQueue::open(&path).await.unwrap());
    assert_eq!(queue.get(job_id).await.unwrap().state, JobState::Active);

    let handler = ScriptedHandler::new(Script::Succeed(Duration::ZERO));
    let (shutdown, handle) = start(
        &queue,
        handler.clone(),
        worker_config().build().unwrap(),
        Arc::new(Events::default()),
    );
    let _: serde_json::Value = tokio::time::timeout(
        Duration::from_secs(5),
        queue.wait_for_completion(job_id),
    )
    .await
    .unwrap()
    .unwrap();
    stop(shutdown, handle).await;

    let reopened = JobQueue::open(&path).await.unwrap();
    let snap = reopened.get(job_id).await.unwrap();
    assert_eq!(snap.state, JobState::Completed);
    assert_eq!(snap.attempts_made, 1);
}
