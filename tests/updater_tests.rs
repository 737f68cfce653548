use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reco_lite::error::{RecoError, Result};
use reco_lite::updater::{JobRunner, JobStatus, Updater};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TestJob {
    /// Blocks until the test releases a permit, or until cancelled.
    Gate,
    Work(u32),
    Fail,
    Panic,
}

impl fmt::Display for TestJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestJob::Gate => write!(f, "gate"),
            TestJob::Work(n) => write!(f, "work({n})"),
            TestJob::Fail => write!(f, "fail"),
            TestJob::Panic => write!(f, "panic"),
        }
    }
}

struct Runner {
    gate: Semaphore,
    started: Semaphore,
    ran: Mutex<Vec<TestJob>>,
}

impl Runner {
    fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            started: Semaphore::new(0),
            ran: Mutex::new(Vec::new()),
        }
    }

    fn ran(&self) -> Vec<TestJob> {
        self.ran.lock().unwrap().clone()
    }

    /// Wait until the gate job is running.
    async fn gate_entered(&self) {
        self.started.acquire().await.unwrap().forget();
    }

    fn open_gate(&self) {
        self.gate.add_permits(1);
    }
}

impl JobRunner for Runner {
    type Kind = TestJob;

    fn run(
        self: Arc<Self>,
        kind: TestJob,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        async move {
            self.ran.lock().unwrap().push(kind.clone());
            match kind {
                TestJob::Gate => {
                    self.started.add_permits(1);
                    tokio::select! {
                        permit = self.gate.acquire() => {
                            permit.unwrap().forget();
                            Ok(())
                        }
                        _ = cancel.cancelled() => Err(RecoError::Interrupted("gate".to_string())),
                    }
                }
                TestJob::Work(_) => Ok(()),
                TestJob::Fail => Err(RecoError::Reader("source unavailable".to_string())),
                TestJob::Panic => panic!("boom"),
            }
        }
    }
}

fn start(capacity: usize) -> (Arc<Runner>, Updater<TestJob>) {
    let runner = Arc::new(Runner::new());
    let updater = Updater::start(runner.clone(), capacity, CancellationToken::new());
    (runner, updater)
}

#[tokio::test]
async fn test_equal_jobs_coalesce_while_pending() {
    let (runner, updater) = start(16);
    let gate = updater.schedule(TestJob::Gate).await.unwrap();
    runner.gate_entered().await;

    let first = updater.schedule(TestJob::Work(1)).await.unwrap();
    let second = updater.schedule(TestJob::Work(1)).await.unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(updater.pending().await, vec![TestJob::Work(1)]);

    runner.open_gate();
    let (a, b) = tokio::join!(first.wait_until_finished(), second.wait_until_finished());
    assert!(a.is_success());
    assert_eq!(a, b);
    assert!(gate.wait_until_finished().await.is_success());
    assert_eq!(runner.ran(), vec![TestJob::Gate, TestJob::Work(1)]);
}

#[tokio::test]
async fn test_running_job_does_not_absorb_new_request() {
    let (runner, updater) = start(16);
    let running = updater.schedule(TestJob::Gate).await.unwrap();
    runner.gate_entered().await;

    let queued = updater.schedule(TestJob::Gate).await.unwrap();
    assert_ne!(running.id(), queued.id());

    runner.open_gate();
    runner.open_gate();
    assert!(running.wait_until_finished().await.is_success());
    assert!(queued.wait_until_finished().await.is_success());
    assert_eq!(runner.ran(), vec![TestJob::Gate, TestJob::Gate]);
}

#[tokio::test]
async fn test_failing_job_finishes_and_worker_continues() {
    let (_runner, updater) = start(16);
    let failed = updater.schedule(TestJob::Fail).await.unwrap();
    let next = updater.schedule(TestJob::Work(2)).await.unwrap();

    let state = failed.wait_until_finished().await;
    assert_eq!(state.status, JobStatus::Failed);
    assert!(state.error.unwrap().contains("source unavailable"));
    assert!(state.finished_at.is_some());
    assert!(next.wait_until_finished().await.is_success());
}

#[tokio::test]
async fn test_panicking_job_is_reported_failed() {
    let (_runner, updater) = start(16);
    let panicked = updater.schedule(TestJob::Panic).await.unwrap();
    let next = updater.schedule(TestJob::Work(3)).await.unwrap();

    let state = panicked.wait_until_finished().await;
    assert_eq!(state.status, JobStatus::Failed);
    assert!(state.error.unwrap().contains("boom"));
    assert!(next.wait_until_finished().await.is_success());
}

#[tokio::test]
async fn test_jobs_run_in_enqueue_order() {
    let (runner, updater) = start(16);
    updater.schedule(TestJob::Gate).await.unwrap();
    runner.gate_entered().await;
    for n in [3, 1, 2] {
        updater.schedule(TestJob::Work(n)).await.unwrap();
    }
    runner.open_gate();
    updater.wait_until_idle().await;
    assert_eq!(
        runner.ran(),
        vec![
            TestJob::Gate,
            TestJob::Work(3),
            TestJob::Work(1),
            TestJob::Work(2)
        ]
    );
}

#[tokio::test]
async fn test_queue_capacity_rejects_new_kinds() {
    let (runner, updater) = start(1);
    updater.schedule(TestJob::Gate).await.unwrap();
    runner.gate_entered().await;

    updater.schedule(TestJob::Work(1)).await.unwrap();
    let err = updater.schedule(TestJob::Work(2)).await.unwrap_err();
    assert!(matches!(err, RecoError::QueueFull(1)));
    // An equal pending job is still returned when full.
    assert!(updater.schedule(TestJob::Work(1)).await.is_ok());
    runner.open_gate();
}

#[tokio::test]
async fn test_shutdown_cancels_running_and_queued_jobs() {
    let (runner, updater) = start(16);
    let running = updater.schedule(TestJob::Gate).await.unwrap();
    runner.gate_entered().await;
    let queued = updater.schedule(TestJob::Work(9)).await.unwrap();

    updater.shutdown().await;

    let running = running.wait_until_finished().await;
    assert_eq!(running.status, JobStatus::Failed);
    assert!(running.error.unwrap().contains("Interrupted"));
    assert_eq!(queued.wait_until_finished().await.status, JobStatus::Cancelled);
    assert!(matches!(
        updater.schedule(TestJob::Work(1)).await,
        Err(RecoError::ShuttingDown)
    ));
    assert!(!runner.ran().contains(&TestJob::Work(9)));
}

#[tokio::test]
async fn test_idle_tracks_queue_state() {
    let (runner, updater) = start(16);
    assert!(updater.is_idle());

    updater.schedule(TestJob::Gate).await.unwrap();
    assert!(!updater.is_idle());
    runner.gate_entered().await;
    assert!(!updater.is_idle());

    runner.open_gate();
    tokio::time::timeout(Duration::from_secs(5), updater.wait_until_idle())
        .await
        .expect("updater never became idle");
    assert!(updater.is_idle());
}

#[tokio::test]
async fn test_schedule_and_wait_returns_final_state() {
    let (_runner, updater) = start(16);
    let state = updater.schedule_and_wait(TestJob::Work(5)).await.unwrap();
    assert_eq!(state.status, JobStatus::Completed);
    assert!(state.started_at.is_some());
}
