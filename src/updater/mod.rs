//! Single-worker background updater.
//!
//! All model-changing work runs as jobs on one dedicated worker task, in
//! enqueue order:
//!
//! - **Dedup**: scheduling a kind that is already pending returns the pending
//!   job's handle instead of queueing a second one.
//! - **Finish signal**: a job always reaches a terminal state, whether its
//!   work succeeds, returns an error or panics. Waiters are never left hanging.
//! - **Isolation**: a failing job is logged and the worker moves on.
//!
//! # Execution Flow
//!
//! 1. The worker waits on an empty queue and reports itself idle
//! 2. It takes the oldest job and marks it running
//! 3. [`JobRunner::run`] executes on its own task, with a child cancellation token
//! 4. The job is marked finished, and duration and outcome are logged

pub mod job;
pub mod queue;

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RecoError, Result};

pub use job::{Job, JobHandle, JobState, JobStatus};
pub use queue::{Enqueued, JobQueue};

/// Executes jobs on behalf of the [`Updater`].
pub trait JobRunner: Send + Sync + 'static {
    /// Job identity. Equal kinds coalesce while pending.
    type Kind: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;

    /// Do the work for one job. `cancel` fires on shutdown or when the
    /// watchdog interrupts this job's write; long work should check it at
    /// batch boundaries and abandon promptly.
    fn run(
        self: Arc<Self>,
        kind: Self::Kind,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send + 'static;
}

struct Shared<K> {
    queue: Mutex<JobQueue<K>>,
    wake: Notify,
    idle: watch::Sender<bool>,
}

pub struct Updater<K> {
    shared: Arc<Shared<K>>,
    shutdown: CancellationToken,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<K> Updater<K>
where
    K: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static,
{
    /// Spawn the worker task. Must be called from within a Tokio runtime.
    pub fn start<R>(runner: Arc<R>, capacity: usize, shutdown: CancellationToken) -> Self
    where
        R: JobRunner<Kind = K>,
    {
        let (idle, _) = watch::channel(true);
        let shared = Arc::new(Shared {
            queue: Mutex::new(JobQueue::with_capacity(capacity)),
            wake: Notify::new(),
            idle,
        });
        let worker = tokio::spawn(worker_loop(runner, shared.clone(), shutdown.clone()));
        Self {
            shared,
            shutdown,
            worker: std::sync::Mutex::new(Some(worker)),
        }
    }

    /// Queue a job, or join the pending job of the same kind.
    pub async fn schedule(&self, kind: K) -> Result<JobHandle<K>> {
        if self.shutdown.is_cancelled() {
            return Err(RecoError::ShuttingDown);
        }
        let enqueued = {
            let mut queue = self.shared.queue.lock().await;
            let enqueued = queue.enqueue(kind)?;
            self.shared.idle.send_replace(false);
            enqueued
        };

        let handle = enqueued.handle();
        if enqueued.was_coalesced() {
            tracing::debug!(job_id = %handle.id(), kind = %handle.kind(), "Job already pending, coalesced");
        } else {
            tracing::debug!(job_id = %handle.id(), kind = %handle.kind(), "Job queued");
            self.shared.wake.notify_one();
        }
        Ok(enqueued.into_handle())
    }

    /// Queue a job and wait for it to finish.
    pub async fn schedule_and_wait(&self, kind: K) -> Result<JobState> {
        let handle = self.schedule(kind).await?;
        Ok(handle.wait_until_finished().await)
    }

    /// Resolve once the queue is empty and no job is running.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.shared.idle.subscribe();
        // Only fails if the sender is dropped, which cannot outlive `self`.
        let _ = rx.wait_for(|idle| *idle).await;
    }

    pub fn is_idle(&self) -> bool {
        *self.shared.idle.borrow()
    }

    pub async fn pending(&self) -> Vec<K> {
        self.shared.queue.lock().await.pending_kinds()
    }

    /// Stop the worker. A running job sees its token cancelled; queued jobs are
    /// dropped and report `Cancelled`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Updater worker ended abnormally");
            }
        }
    }
}

async fn worker_loop<R: JobRunner>(
    runner: Arc<R>,
    shared: Arc<Shared<R::Kind>>,
    shutdown: CancellationToken,
) {
    loop {
        let next = {
            let mut queue = shared.queue.lock().await;
            let next = queue.pop_next();
            if next.is_none() {
                shared.idle.send_replace(true);
            }
            next
        };

        let Some(job) = next else {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = shared.wake.notified() => continue,
            }
        };

        if shutdown.is_cancelled() {
            drop(job);
            break;
        }
        run_job(&runner, job, &shutdown).await;
    }

    let dropped = shared.queue.lock().await.clear();
    shared.idle.send_replace(true);
    tracing::info!(dropped, "Updater worker stopped");
}

async fn run_job<R: JobRunner>(runner: &Arc<R>, job: Job<R::Kind>, shutdown: &CancellationToken) {
    job.mark_running();
    let started = Instant::now();
    tracing::info!(job_id = %job.id, kind = %job.kind, "Running update job");

    let cancel = shutdown.child_token();
    let task = tokio::spawn(runner.clone().run(job.kind.clone(), cancel));
    let outcome = task.await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(())) => {
            job.finish(JobStatus::Completed, None);
            tracing::info!(job_id = %job.id, kind = %job.kind, elapsed_ms, "Update job completed");
        }
        Ok(Err(e)) => {
            tracing::error!(job_id = %job.id, kind = %job.kind, elapsed_ms, error = %e, "Update job failed");
            job.finish(JobStatus::Failed, Some(e.to_string()));
        }
        Err(e) => {
            let message = panic_message(e);
            tracing::error!(job_id = %job.id, kind = %job.kind, elapsed_ms, error = %message, "Update job panicked");
            job.finish(JobStatus::Failed, Some(message));
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
