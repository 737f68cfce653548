//! One recommender instance: the live snapshot, its lock and watchdog, and the
//! updater that replaces the snapshot in the background.
//!
//! # Lifecycle
//!
//! ```text
//! UNINITIALIZED --Full | Load--> READY --Incremental | Products | Save--> READY
//! ```
//!
//! Reader calls made before the first snapshot is installed fail with
//! [`RecoError::NotReady`]. Every update job builds a private successor
//! snapshot and installs it with a single handle swap, so a failed job leaves
//! the previous generation serving.

mod jobs;
mod persist;
mod serving;

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::RecommenderConfig;
use crate::error::{RecoError, Result};
use crate::lock::{ManagedLock, Watchdog};
use crate::model::Snapshot;
use crate::reader::DataReader;
use crate::updater::{JobHandle, JobRunner, JobState, Updater};

pub use jobs::UpdateJob;
pub use serving::ConsumerRequest;

pub(crate) type SnapshotLock = ManagedLock<Option<Arc<Snapshot>>>;

/// State shared between the serving side and the update worker.
pub(crate) struct Core {
    pub(crate) config: RecommenderConfig,
    pub(crate) lock: Arc<SnapshotLock>,
    reader: Arc<Mutex<Box<dyn DataReader>>>,
}

impl JobRunner for Core {
    type Kind = UpdateJob;

    fn run(
        self: Arc<Self>,
        kind: UpdateJob,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        async move { self.run_job(kind, &cancel).await }
    }
}

/// Point-in-time view of an instance, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub name: String,
    pub ready: bool,
    pub generation: u64,
    pub products: usize,
    pub consumers: usize,
    pub events: u64,
    pub pending: Vec<String>,
    pub idle: bool,
}

pub struct Recommender {
    core: Arc<Core>,
    updater: Updater<UpdateJob>,
    watchdog: Mutex<Option<Watchdog>>,
    shutdown: CancellationToken,
    escalation: CancellationToken,
    update_interval_ms: AtomicU64,
    save_interval_ms: AtomicU64,
}

impl Recommender {
    /// Start an instance with its own shutdown token. Must be called from
    /// within a Tokio runtime.
    pub fn start(config: RecommenderConfig, reader: impl DataReader + 'static) -> Self {
        Self::start_with_shutdown(config, reader, &CancellationToken::new())
    }

    /// Start an instance that also stops when `parent` is cancelled.
    pub fn start_with_shutdown(
        config: RecommenderConfig,
        reader: impl DataReader + 'static,
        parent: &CancellationToken,
    ) -> Self {
        let shutdown = parent.child_token();
        let escalation = CancellationToken::new();
        let lock = Arc::new(ManagedLock::new(format!("{}-snapshot", config.name), None));

        let watchdog = config.watchdog.enabled.then(|| {
            Watchdog::spawn(lock.clone(), config.watchdog, &shutdown, escalation.clone())
        });
        let schedule = config.schedule;
        let capacity = config.queue_capacity;
        let name = config.name.clone();

        let reader: Box<dyn DataReader> = Box::new(reader);
        let core = Arc::new(Core {
            config,
            lock,
            reader: Arc::new(Mutex::new(reader)),
        });
        let updater = Updater::start(core.clone(), capacity, shutdown.clone());

        tracing::info!(
            recommender = %name,
            watchdog = watchdog.is_some(),
            queue_capacity = capacity,
            "Recommender started"
        );

        Self {
            core,
            updater,
            watchdog: Mutex::new(watchdog),
            shutdown,
            escalation,
            update_interval_ms: AtomicU64::new(duration_ms(schedule.update_interval)),
            save_interval_ms: AtomicU64::new(duration_ms(schedule.save_interval)),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.config.name
    }

    pub fn config(&self) -> &RecommenderConfig {
        &self.core.config
    }

    /// Queue the first build: load the model file if one exists, otherwise a
    /// full rebuild from the reader.
    pub async fn initialize(&self) -> Result<JobHandle<UpdateJob>> {
        let job = match &self.core.config.model_path {
            Some(path) if path.exists() => UpdateJob::Load(path.clone()),
            _ => UpdateJob::Full,
        };
        self.schedule(job).await
    }

    /// Queue a refresh: incremental when a model is live, full otherwise.
    pub async fn update_now(&self) -> Result<JobHandle<UpdateJob>> {
        let job = if self.is_ready().await {
            UpdateJob::Incremental
        } else {
            UpdateJob::Full
        };
        self.schedule(job).await
    }

    pub async fn update_products_now(&self) -> Result<JobHandle<UpdateJob>> {
        self.schedule(UpdateJob::Products).await
    }

    /// Queue a save to the configured model path.
    pub async fn persist_now(&self) -> Result<JobHandle<UpdateJob>> {
        let path = self.model_path()?;
        self.schedule(UpdateJob::Save(path)).await
    }

    pub async fn persist_to(&self, path: impl Into<PathBuf>) -> Result<JobHandle<UpdateJob>> {
        self.schedule(UpdateJob::Save(path.into())).await
    }

    pub async fn load_from(&self, path: impl Into<PathBuf>) -> Result<JobHandle<UpdateJob>> {
        self.schedule(UpdateJob::Load(path.into())).await
    }

    pub async fn schedule(&self, job: UpdateJob) -> Result<JobHandle<UpdateJob>> {
        self.updater.schedule(job).await
    }

    pub async fn schedule_and_wait(&self, job: UpdateJob) -> Result<JobState> {
        self.updater.schedule_and_wait(job).await
    }

    /// Resolve once no update job is queued or running.
    pub async fn wait_until_idle(&self) {
        self.updater.wait_until_idle().await
    }

    pub async fn is_ready(&self) -> bool {
        self.core.lock.read().await.is_some()
    }

    /// The live snapshot handle, if any. It stays valid and unchanged after
    /// later generations are installed.
    pub async fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.core.lock.read().await.clone()
    }

    pub async fn status(&self) -> Status {
        let live = self.snapshot().await;
        let pending = self
            .updater
            .pending()
            .await
            .iter()
            .map(ToString::to_string)
            .collect();
        Status {
            name: self.core.config.name.clone(),
            ready: live.is_some(),
            generation: live.as_ref().map_or(0, |s| s.generation()),
            products: live.as_ref().map_or(0, |s| s.data.product_count()),
            consumers: live.as_ref().map_or(0, |s| s.data.consumer_count()),
            events: live.as_ref().map_or(0, |s| s.data.event_count()),
            pending,
            idle: self.updater.is_idle(),
        }
    }

    /// Cancelled when the watchdog gave up on a stuck writer. The host should
    /// treat this instance as unhealthy and restart it.
    pub fn escalation(&self) -> CancellationToken {
        self.escalation.clone()
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_update_interval(&self, interval: Duration) {
        self.update_interval_ms
            .store(duration_ms(interval), Ordering::Relaxed);
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_save_interval(&self, interval: Duration) {
        self.save_interval_ms
            .store(duration_ms(interval), Ordering::Relaxed);
    }

    pub fn has_model_path(&self) -> bool {
        self.core.config.model_path.is_some()
    }

    /// Stop the updater and the watchdog. Queued jobs finish as cancelled; a
    /// running job sees its token cancelled.
    pub async fn shutdown(&self) {
        tracing::info!(recommender = %self.core.config.name, "Shutting down recommender");
        self.updater.shutdown().await;
        let watchdog = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watchdog) = watchdog {
            watchdog.stop().await;
        }
    }

    fn model_path(&self) -> Result<PathBuf> {
        self.core
            .config
            .model_path
            .clone()
            .ok_or_else(|| RecoError::InvalidInput("no model path configured".to_string()))
    }
}

impl Drop for Recommender {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
