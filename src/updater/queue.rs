use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use crate::error::{RecoError, Result};
use crate::updater::job::{Job, JobHandle};

const DEFAULT_MAX_JOBS: usize = 64;

/// Result of [`JobQueue::enqueue`].
#[derive(Debug)]
pub enum Enqueued<K> {
    /// A new job was appended to the queue.
    Added(JobHandle<K>),
    /// An equal job was already pending; its handle is returned instead.
    Coalesced(JobHandle<K>),
}

impl<K> Enqueued<K> {
    pub fn handle(&self) -> &JobHandle<K> {
        match self {
            Enqueued::Added(h) | Enqueued::Coalesced(h) => h,
        }
    }

    pub fn into_handle(self) -> JobHandle<K> {
        match self {
            Enqueued::Added(h) | Enqueued::Coalesced(h) => h,
        }
    }

    pub fn was_coalesced(&self) -> bool {
        matches!(self, Enqueued::Coalesced(_))
    }
}

/// FIFO of pending jobs with at most one pending job per kind.
///
/// A job leaves the pending index when the worker takes it, so requesting the
/// same kind while it runs queues a fresh job behind it.
#[derive(Debug)]
pub struct JobQueue<K> {
    jobs: VecDeque<Job<K>>,
    pending: HashMap<K, JobHandle<K>>,
    max_jobs: usize,
}

impl<K> Default for JobQueue<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> JobQueue<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            pending: HashMap::new(),
            max_jobs: max_jobs.max(1),
        }
    }

    pub fn enqueue(&mut self, kind: K) -> Result<Enqueued<K>> {
        if let Some(existing) = self.pending.get(&kind) {
            return Ok(Enqueued::Coalesced(existing.clone()));
        }
        if self.is_full() {
            return Err(RecoError::QueueFull(self.jobs.len()));
        }
        let (job, handle) = Job::new(kind.clone());
        self.pending.insert(kind, handle.clone());
        self.jobs.push_back(job);
        Ok(Enqueued::Added(handle))
    }

    /// Take the oldest job for execution.
    pub fn pop_next(&mut self) -> Option<Job<K>> {
        let job = self.jobs.pop_front()?;
        self.pending.remove(&job.kind);
        Some(job)
    }

    pub fn get(&self, kind: &K) -> Option<&JobHandle<K>> {
        self.pending.get(kind)
    }

    /// Pending kinds in execution order.
    pub fn pending_kinds(&self) -> Vec<K> {
        self.jobs.iter().map(|j| j.kind.clone()).collect()
    }

    /// Drop every pending job; their handles observe `Cancelled`.
    pub fn clear(&mut self) -> usize {
        let dropped = self.jobs.len();
        self.jobs.clear();
        self.pending.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}
