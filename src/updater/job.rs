use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    /// Dropped from the queue at shutdown without running.
    Cancelled,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Lifecycle of one scheduled job as seen by waiters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub status: JobStatus,
    pub error: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobState {
    fn queued() -> Self {
        Self {
            status: JobStatus::Queued,
            error: None,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// The queue-owned side of a job. Finishing is guaranteed: dropping an
/// unfinished job marks it cancelled, so waiters never hang.
#[derive(Debug)]
pub struct Job<K> {
    pub id: Uuid,
    pub kind: K,
    state: watch::Sender<JobState>,
}

impl<K: Clone> Job<K> {
    pub fn new(kind: K) -> (Self, JobHandle<K>) {
        let (state, rx) = watch::channel(JobState::queued());
        let job = Self {
            id: Uuid::new_v4(),
            kind,
            state,
        };
        let handle = JobHandle {
            id: job.id,
            kind: job.kind.clone(),
            state: rx,
        };
        (job, handle)
    }

    pub fn mark_running(&self) {
        self.state.send_modify(|s| {
            s.status = JobStatus::Running;
            s.started_at = Some(Utc::now());
        });
    }

    pub fn finish(&self, status: JobStatus, error: Option<String>) {
        debug_assert!(status.is_finished());
        self.state.send_modify(|s| {
            s.status = status;
            s.error = error;
            s.finished_at = Some(Utc::now());
        });
    }

    pub fn status(&self) -> JobStatus {
        self.state.borrow().status
    }
}

impl<K> Drop for Job<K> {
    fn drop(&mut self) {
        self.state.send_if_modified(|s| {
            if s.status.is_finished() {
                return false;
            }
            s.status = JobStatus::Cancelled;
            s.finished_at = Some(Utc::now());
            true
        });
    }
}

/// Caller-side view of a scheduled job. Cheap to clone; every clone observes
/// the same lifecycle.
#[derive(Debug, Clone)]
pub struct JobHandle<K> {
    id: Uuid,
    kind: K,
    state: watch::Receiver<JobState>,
}

impl<K> JobHandle<K> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> JobStatus {
        self.state.borrow().status
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    /// Block until the job completes, fails or is cancelled.
    pub async fn wait_until_finished(&self) -> JobState {
        let mut rx = self.state.clone();
        let finished = rx
            .wait_for(|s| s.status.is_finished())
            .await
            .map(|state| state.clone());
        // Sender gone: Job's Drop already published a terminal state.
        finished.unwrap_or_else(|_| rx.borrow().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_queued() {
        let (job, handle) = Job::new("full");
        assert_eq!(job.status(), JobStatus::Queued);
        assert_eq!(handle.status(), JobStatus::Queued);
        assert_eq!(handle.id(), job.id);
        assert_eq!(*handle.kind(), "full");
    }

    #[test]
    fn finish_is_visible_through_handle() {
        let (job, handle) = Job::new(1u8);
        job.mark_running();
        assert_eq!(handle.status(), JobStatus::Running);
        job.finish(JobStatus::Failed, Some("boom".to_string()));
        let state = handle.state();
        assert_eq!(state.status, JobStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("boom"));
        assert!(state.started_at.is_some());
        assert!(state.finished_at.is_some());
    }

    #[test]
    fn dropping_unfinished_job_cancels_it() {
        let (job, handle) = Job::new(1u8);
        drop(job);
        assert_eq!(handle.status(), JobStatus::Cancelled);
    }

    #[test]
    fn dropping_finished_job_keeps_outcome() {
        let (job, handle) = Job::new(1u8);
        job.finish(JobStatus::Completed, None);
        drop(job);
        assert_eq!(handle.status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn waiters_unblock_on_finish() {
        let (job, handle) = Job::new(1u8);
        let other = handle.clone();
        let waiter = tokio::spawn(async move { other.wait_until_finished().await });
        job.finish(JobStatus::Completed, None);
        let state = waiter.await.unwrap();
        assert!(state.is_success());
        assert!(handle.wait_until_finished().await.is_success());
    }

    #[test]
    fn status_display() {
        assert_eq!(JobStatus::Queued.to_string(), "queued");
        assert_eq!(JobStatus::Cancelled.to_string(), "cancelled");
    }
}
