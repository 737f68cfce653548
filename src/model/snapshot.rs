use std::collections::HashSet;

use crate::decision::{DecisionDelta, DecisionEngine};
use crate::error::Result;
use crate::model::{
    Batch, Candidate, ConsumerId, DataDelta, DataStore, Delta, ProductChanges, ProductId,
    ProductPair, Recommendation, Tags,
};
use crate::scoring::{ScoringDelta, ScoringEngine};

/// Per-call knobs for `recommend`/`similar`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendSettings {
    pub max_results: usize,
    /// Shuffle candidates whose scores tie before truncating.
    pub randomize: bool,
    pub tags: Tags,
}

impl Default for RecommendSettings {
    fn default() -> Self {
        Self {
            max_results: 10,
            randomize: false,
            tags: Tags::new(),
        }
    }
}

impl RecommendSettings {
    pub fn top(max_results: usize) -> Self {
        Self {
            max_results,
            ..Default::default()
        }
    }

    pub fn randomized(mut self) -> Self {
        self.randomize = true;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// One consistent generation of {data store, scoring engine, decision engine}.
///
/// A published snapshot is never mutated: updates commit into a
/// [`successor`](Snapshot::successor) and the result replaces the published
/// handle as a whole.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    generation: u64,
    pub data: DataStore,
    pub scoring: ScoringEngine,
    pub decision: DecisionEngine,
}

impl Snapshot {
    /// An unpublished snapshot with no data.
    pub fn empty(scoring: ScoringEngine, decision: DecisionEngine) -> Self {
        Self {
            generation: 0,
            data: DataStore::new(),
            scoring,
            decision,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// A private copy to commit the next deltas into.
    pub fn successor(&self) -> Self {
        self.clone()
    }

    /// Engines with the same configuration but no learned state.
    pub fn empty_clone(&self) -> Self {
        Self::empty(
            self.scoring.clone_config_only(),
            self.decision.clone_config_only(),
        )
    }

    /// Compute phase for one batch of new source data.
    pub fn prepare_incremental(&self, batch: &Batch) -> SnapshotDelta {
        SnapshotDelta {
            data: DataDelta::from_batch(batch),
            scoring: self.scoring.update_incremental(batch, &self.data),
            decision: self.decision.update_incremental(batch),
        }
    }

    /// Compute phase for a product-set change.
    pub fn prepare_products(&self, changes: &ProductChanges) -> SnapshotDelta {
        SnapshotDelta {
            data: DataDelta::products(changes),
            scoring: self.scoring.update_products(changes, &self.data),
            decision: DecisionDelta::Noop,
        }
    }

    pub fn recommend(
        &self,
        consumer: ConsumerId,
        candidates: &[ProductId],
        settings: &RecommendSettings,
        excluded_events: &[String],
    ) -> Vec<Recommendation> {
        let mut batch: Vec<Candidate> = unique(candidates)
            .filter(|p| self.data.contains_product(*p))
            .filter(|p| !self.data.has_happened(consumer, *p, excluded_events))
            .map(Candidate::new)
            .collect();
        if batch.is_empty() {
            return Vec::new();
        }

        let profile = self.data.consumer(consumer);
        self.scoring
            .score(profile, &mut batch, &self.data, &settings.tags);
        self.decision.select_best(
            batch,
            settings.max_results,
            settings.randomize,
            &settings.tags,
        )
    }

    pub fn similar(
        &self,
        seeds: &[ProductId],
        candidates: &[ProductId],
        settings: &RecommendSettings,
    ) -> Vec<Recommendation> {
        let seed_set: HashSet<ProductId> = seeds.iter().copied().collect();
        let mut batch: Vec<Candidate> = unique(candidates)
            .filter(|p| !seed_set.contains(p))
            .filter(|p| self.data.contains_product(*p))
            .map(Candidate::new)
            .collect();
        if batch.is_empty() {
            return Vec::new();
        }

        self.scoring
            .score_similar(seeds, &mut batch, &self.data, &settings.tags);
        self.decision.select_best(
            batch,
            settings.max_results,
            settings.randomize,
            &settings.tags,
        )
    }

    pub fn next_pair(&self, consumer: ConsumerId) -> Option<ProductPair> {
        self.scoring
            .next_pair(self.data.consumer(consumer), &self.data)
    }

    pub fn needs_profiling(&self, consumer: ConsumerId) -> bool {
        self.scoring.needs_profiling(self.data.consumer(consumer))
    }
}

fn unique(ids: &[ProductId]) -> impl Iterator<Item = ProductId> + '_ {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(move |id| seen.insert(*id))
}

/// Mutation of all three snapshot members, committed together.
#[derive(Debug)]
pub struct SnapshotDelta {
    pub data: DataDelta,
    pub scoring: ScoringDelta,
    pub decision: DecisionDelta,
}

impl Delta for SnapshotDelta {
    type Target = Snapshot;

    fn commit(self, target: &mut Snapshot) -> Result<()> {
        self.data.commit(&mut target.data)?;
        self.scoring.commit(&mut target.scoring)?;
        self.decision.commit(&mut target.decision)?;
        Ok(())
    }

    fn is_noop(&self) -> bool {
        self.data.is_noop() && self.scoring.is_noop() && self.decision.is_noop()
    }
}
