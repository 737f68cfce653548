use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::decision::DecisionEngine;
use crate::error::{RecoError, Result};
use crate::model::{Delta, Product, Snapshot};
use crate::reader::DataReader;
use crate::recommender::{persist, Core};
use crate::scoring::ScoringEngine;

/// Background work a recommender can be asked to do. Equal values coalesce
/// while pending; `Load` and `Save` are equal only for the same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpdateJob {
    /// Rebuild from an empty clone of the engines by draining the reader.
    Full,
    /// Fold unseen source data into a successor of the live snapshot.
    Incremental,
    /// Apply catalogue changes only.
    Products,
    /// Replace the live snapshot from a model file, or rebuild if that fails.
    Load(PathBuf),
    /// Write the live snapshot to a model file.
    Save(PathBuf),
}

impl fmt::Display for UpdateJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateJob::Full => write!(f, "full"),
            UpdateJob::Incremental => write!(f, "incremental"),
            UpdateJob::Products => write!(f, "products"),
            UpdateJob::Load(path) => write!(f, "load({})", path.display()),
            UpdateJob::Save(path) => write!(f, "save({})", path.display()),
        }
    }
}

/// Outcome of one blocking read-and-fold step.
struct Step {
    snapshot: Snapshot,
    events: usize,
    folded: bool,
    done: bool,
}

impl Core {
    pub(crate) async fn run_job(&self, job: UpdateJob, cancel: &CancellationToken) -> Result<()> {
        let moves_cursor = matches!(
            job,
            UpdateJob::Full | UpdateJob::Incremental | UpdateJob::Load(_)
        );
        let result = match job {
            UpdateJob::Full => self.full_rebuild(cancel).await,
            UpdateJob::Incremental => self.incremental(cancel).await,
            UpdateJob::Products => self.products(cancel).await,
            UpdateJob::Load(path) => self.load_or_rebuild(&path, cancel).await,
            UpdateJob::Save(path) => self.save(&path, cancel).await,
        };
        if result.is_err() && moves_cursor {
            self.resync_reader().await;
        }
        result
    }

    /// Put the reader cursor right behind the live snapshot after a failed
    /// update, so the next incremental run neither skips nor repeats events.
    async fn resync_reader(&self) {
        // Only the worker writes, and it is running this job.
        let Some(live) = self.lock.read().await.clone() else {
            return;
        };
        let folded = live.data.event_count();
        let catalogue: Vec<Product> = live.data.products().cloned().collect();
        if let Err(e) = self
            .with_reader(move |reader| reader.skip_events(folded, catalogue))
            .await
        {
            tracing::warn!(
                recommender = %self.config.name,
                error = %e,
                "Could not reposition reader after failed update"
            );
        }
    }

    async fn full_rebuild(&self, cancel: &CancellationToken) -> Result<()> {
        let started = Instant::now();
        let base = match self.live(cancel).await? {
            Some(live) => live.empty_clone(),
            None => Snapshot::empty(
                ScoringEngine::from_config(&self.config.scoring),
                DecisionEngine::from_config(&self.config.decision),
            ),
        };
        self.with_reader(|reader| reader.reset()).await?;

        let (next, batches, events) = self.drain(base, cancel, "full rebuild").await?;
        let generation = self.install(next, "full rebuild", cancel).await?;
        tracing::info!(
            recommender = %self.config.name,
            generation,
            batches,
            events,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Full rebuild installed"
        );
        Ok(())
    }

    async fn incremental(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(live) = self.live(cancel).await? else {
            tracing::info!(recommender = %self.config.name, "No live model yet, running full rebuild instead");
            return self.full_rebuild(cancel).await;
        };
        let base = tokio::task::spawn_blocking(move || live.successor())
            .await
            .map_err(|e| RecoError::Internal(e.to_string()))?;

        let (next, batches, events) = self.drain(base, cancel, "incremental update").await?;
        if batches == 0 {
            tracing::debug!(recommender = %self.config.name, "No new source data");
            return Ok(());
        }
        let generation = self.install(next, "incremental update", cancel).await?;
        tracing::info!(
            recommender = %self.config.name,
            generation,
            batches,
            events,
            "Incremental update installed"
        );
        Ok(())
    }

    async fn products(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(live) = self.live(cancel).await? else {
            return Err(RecoError::NotReady);
        };
        let changes = self.with_reader(|reader| reader.update_products()).await?;
        if changes.is_empty() {
            tracing::debug!(recommender = %self.config.name, "No catalogue changes");
            return Ok(());
        }
        let (upserted, removed) = (changes.upserted.len(), changes.removed.len());

        let next = tokio::task::spawn_blocking(move || -> Result<Snapshot> {
            let delta = live.prepare_products(&changes);
            let mut next = live.successor();
            delta.commit(&mut next)?;
            Ok(next)
        })
        .await
        .map_err(|e| RecoError::Internal(e.to_string()))??;

        let generation = self.install(next, "products update", cancel).await?;
        tracing::info!(
            recommender = %self.config.name,
            generation,
            upserted,
            removed,
            "Products update installed"
        );
        Ok(())
    }

    async fn load_or_rebuild(&self, path: &Path, cancel: &CancellationToken) -> Result<()> {
        match self.load(path, cancel).await {
            Ok(()) => Ok(()),
            Err(e @ RecoError::Interrupted(_)) => Err(e),
            Err(e) => {
                tracing::warn!(
                    recommender = %self.config.name,
                    path = %path.display(),
                    error = %e,
                    "Model load failed, falling back to full rebuild"
                );
                self.full_rebuild(cancel).await
            }
        }
    }

    async fn load(&self, path: &Path, cancel: &CancellationToken) -> Result<()> {
        let started = Instant::now();
        let scoring = ScoringEngine::from_config(&self.config.scoring);
        let decision = DecisionEngine::from_config(&self.config.decision);
        let file = path.to_path_buf();
        let next = tokio::task::spawn_blocking(move || persist::read_model(&file, scoring, decision))
            .await
            .map_err(|e| RecoError::Internal(e.to_string()))??;

        let folded = next.data.event_count();
        let catalogue: Vec<Product> = next.data.products().cloned().collect();
        self.with_reader(move |reader| reader.skip_events(folded, catalogue))
            .await?;
        let generation = self.install(next, "load", cancel).await?;
        tracing::info!(
            recommender = %self.config.name,
            generation,
            path = %path.display(),
            events = folded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Model loaded"
        );
        Ok(())
    }

    async fn save(&self, path: &Path, cancel: &CancellationToken) -> Result<()> {
        let Some(live) = self.live(cancel).await? else {
            return Err(RecoError::NotReady);
        };
        let generation = live.generation();
        let file = path.to_path_buf();
        tokio::task::spawn_blocking(move || persist::write_model(&file, &live))
            .await
            .map_err(|e| RecoError::Internal(e.to_string()))??;
        tracing::info!(
            recommender = %self.config.name,
            generation,
            path = %path.display(),
            "Model saved"
        );
        Ok(())
    }

    /// Read batches until the reader is exhausted, folding each into `next`.
    /// Returns the folded snapshot with the batch and event counts.
    async fn drain(
        &self,
        mut next: Snapshot,
        cancel: &CancellationToken,
        what: &str,
    ) -> Result<(Snapshot, u64, u64)> {
        let mut batches = 0u64;
        let mut events = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(RecoError::Interrupted(format!("running {what}")));
            }
            let reader = self.reader.clone();
            let step = tokio::task::spawn_blocking(move || -> Result<Step> {
                let mut reader = reader.lock().unwrap_or_else(PoisonError::into_inner);
                let batch = reader.read_next_batch()?;
                let folded = !batch.is_empty();
                if folded {
                    let delta = next.prepare_incremental(&batch);
                    delta.commit(&mut next)?;
                }
                Ok(Step {
                    snapshot: next,
                    events: batch.events.len(),
                    folded,
                    done: !folded || reader.finished_reading(),
                })
            })
            .await
            .map_err(|e| RecoError::Internal(e.to_string()))??;

            next = step.snapshot;
            if step.folded {
                batches += 1;
                events += step.events as u64;
                tracing::debug!(
                    recommender = %self.config.name,
                    batch = batches,
                    events = step.events,
                    "Folded batch"
                );
            }
            if step.done {
                return Ok((next, batches, events));
            }
        }
    }

    async fn with_reader<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn DataReader) -> Result<T> + Send + 'static,
    {
        let reader = self.reader.clone();
        tokio::task::spawn_blocking(move || {
            let mut reader = reader.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut **reader)
        })
        .await
        .map_err(|e| RecoError::Internal(e.to_string()))?
    }

    async fn live(&self, cancel: &CancellationToken) -> Result<Option<Arc<Snapshot>>> {
        Ok(self.lock.read_interruptible(cancel).await?.clone())
    }

    /// Publish `next` as the new generation. The write lock covers only the
    /// handle swap.
    async fn install(&self, mut next: Snapshot, what: &str, cancel: &CancellationToken) -> Result<u64> {
        let label = format!("{} {what}", self.config.name);
        let mut guard = self.lock.write(label, cancel).await?;
        if guard.is_interrupted() {
            return Err(RecoError::Interrupted(format!("installing {what}")));
        }
        let generation = guard.as_ref().map_or(0, |live| live.generation()) + 1;
        next.set_generation(generation);
        *guard = Some(Arc::new(next));
        Ok(generation)
    }
}
