//! Scoring engines: pluggable strategies that put a score on every candidate.
//!
//! Each strategy implements [`Scorer`]; [`ScoringEngine`] is the tagged union the
//! rest of the crate works with. Decorators such as [`FilteredScorer`] own an
//! inner engine and delegate to it after doing their own part.
//!
//! # Batch-order independence
//!
//! All strategies in this module fold events with commutative sums, so
//! applying two incremental batches equals applying their concatenation.
//! Strategies with time-decay windows would be exempt from that property.

pub mod average;
pub mod filter;
pub mod popularity;

use serde::{Deserialize, Serialize};

use crate::error::{RecoError, Result};
use crate::model::{
    Batch, Candidate, ConsumerProfile, DataStore, Delta, ProductChanges, ProductId, ProductPair,
    Tags,
};

pub use average::{AverageRatingConfig, AverageRatingDelta, AverageRatingScorer};
pub use filter::{FilterDelta, FilteredConfig, FilteredScorer};
pub use popularity::{PopularityConfig, PopularityDelta, PopularityScorer};

/// Capabilities every scoring strategy provides.
pub trait Scorer: Sized {
    type Config;
    type Delta: Delta<Target = Self>;

    /// A fresh engine with configuration only and no learned state.
    fn from_config(config: &Self::Config) -> Self;

    fn config(&self) -> Self::Config;

    /// Fill in `score`/`explanation` for the whole batch at once. Filtering
    /// stages may drop or reorder candidates. `profile` is `None` for cold consumers.
    fn score(
        &self,
        profile: Option<&ConsumerProfile>,
        batch: &mut Vec<Candidate>,
        data: &DataStore,
        tags: &Tags,
    );

    fn score_similar(
        &self,
        seeds: &[ProductId],
        batch: &mut Vec<Candidate>,
        data: &DataStore,
        tags: &Tags,
    );

    fn update_incremental(&self, batch: &Batch, data: &DataStore) -> Self::Delta;

    fn update_products(&self, changes: &ProductChanges, data: &DataStore) -> Self::Delta;

    /// Learned state for the model file.
    fn state(&self) -> Result<serde_json::Value>;

    /// Turn state read from a model file into a delta for a fresh engine.
    fn restore(&self, state: serde_json::Value) -> Result<Self::Delta>;

    fn min_profile_events(&self) -> u64;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ScoringConfig {
    Popularity(PopularityConfig),
    AverageRating(AverageRatingConfig),
    Filtered(FilteredConfig),
}

impl Default for ScoringConfig {
    fn default() -> Self {
        ScoringConfig::Popularity(PopularityConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScoringEngine {
    Popularity(PopularityScorer),
    AverageRating(AverageRatingScorer),
    Filtered(FilteredScorer),
}

impl ScoringEngine {
    pub fn from_config(config: &ScoringConfig) -> Self {
        match config {
            ScoringConfig::Popularity(c) => ScoringEngine::Popularity(PopularityScorer::from_config(c)),
            ScoringConfig::AverageRating(c) => {
                ScoringEngine::AverageRating(AverageRatingScorer::from_config(c))
            }
            ScoringConfig::Filtered(c) => ScoringEngine::Filtered(FilteredScorer::from_config(c)),
        }
    }

    pub fn config(&self) -> ScoringConfig {
        match self {
            ScoringEngine::Popularity(s) => ScoringConfig::Popularity(s.config()),
            ScoringEngine::AverageRating(s) => ScoringConfig::AverageRating(s.config()),
            ScoringEngine::Filtered(s) => ScoringConfig::Filtered(s.config()),
        }
    }

    pub fn clone_config_only(&self) -> Self {
        Self::from_config(&self.config())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ScoringEngine::Popularity(_) => "popularity",
            ScoringEngine::AverageRating(_) => "average_rating",
            ScoringEngine::Filtered(_) => "filtered",
        }
    }

    pub fn score(
        &self,
        profile: Option<&ConsumerProfile>,
        batch: &mut Vec<Candidate>,
        data: &DataStore,
        tags: &Tags,
    ) {
        match self {
            ScoringEngine::Popularity(s) => s.score(profile, batch, data, tags),
            ScoringEngine::AverageRating(s) => s.score(profile, batch, data, tags),
            ScoringEngine::Filtered(s) => s.score(profile, batch, data, tags),
        }
    }

    pub fn score_similar(
        &self,
        seeds: &[ProductId],
        batch: &mut Vec<Candidate>,
        data: &DataStore,
        tags: &Tags,
    ) {
        match self {
            ScoringEngine::Popularity(s) => s.score_similar(seeds, batch, data, tags),
            ScoringEngine::AverageRating(s) => s.score_similar(seeds, batch, data, tags),
            ScoringEngine::Filtered(s) => s.score_similar(seeds, batch, data, tags),
        }
    }

    pub fn update_incremental(&self, batch: &Batch, data: &DataStore) -> ScoringDelta {
        if batch.is_empty() {
            return ScoringDelta::Noop;
        }
        match self {
            ScoringEngine::Popularity(s) => ScoringDelta::Popularity(s.update_incremental(batch, data)),
            ScoringEngine::AverageRating(s) => {
                ScoringDelta::AverageRating(s.update_incremental(batch, data))
            }
            ScoringEngine::Filtered(s) => ScoringDelta::Filtered(s.update_incremental(batch, data)),
        }
    }

    pub fn update_products(&self, changes: &ProductChanges, data: &DataStore) -> ScoringDelta {
        if changes.is_empty() {
            return ScoringDelta::Noop;
        }
        match self {
            ScoringEngine::Popularity(s) => ScoringDelta::Popularity(s.update_products(changes, data)),
            ScoringEngine::AverageRating(s) => {
                ScoringDelta::AverageRating(s.update_products(changes, data))
            }
            ScoringEngine::Filtered(s) => ScoringDelta::Filtered(s.update_products(changes, data)),
        }
    }

    pub fn state(&self) -> Result<serde_json::Value> {
        match self {
            ScoringEngine::Popularity(s) => s.state(),
            ScoringEngine::AverageRating(s) => s.state(),
            ScoringEngine::Filtered(s) => s.state(),
        }
    }

    pub fn restore(&self, state: serde_json::Value) -> Result<ScoringDelta> {
        Ok(match self {
            ScoringEngine::Popularity(s) => ScoringDelta::Popularity(s.restore(state)?),
            ScoringEngine::AverageRating(s) => ScoringDelta::AverageRating(s.restore(state)?),
            ScoringEngine::Filtered(s) => ScoringDelta::Filtered(s.restore(state)?),
        })
    }

    pub fn needs_profiling(&self, profile: Option<&ConsumerProfile>) -> bool {
        let seen = profile.map_or(0, |p| p.event_count);
        seen < self.min_profile_events()
    }

    /// The two best-scoring products the consumer has not interacted with yet.
    pub fn next_pair(
        &self,
        profile: Option<&ConsumerProfile>,
        data: &DataStore,
    ) -> Option<ProductPair> {
        let mut batch: Vec<Candidate> = data
            .products()
            .filter(|p| profile.map_or(true, |pr| !pr.has_interacted(p.id)))
            .map(|p| Candidate::new(p.id))
            .collect();
        if batch.len() < 2 {
            return None;
        }

        self.score(profile, &mut batch, data, &Tags::new());
        batch.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.product.cmp(&b.product))
        });
        match batch.as_slice() {
            [first, second, ..] => Some(ProductPair {
                first: first.product,
                second: second.product,
            }),
            _ => None,
        }
    }

    fn min_profile_events(&self) -> u64 {
        match self {
            ScoringEngine::Popularity(s) => s.min_profile_events(),
            ScoringEngine::AverageRating(s) => s.min_profile_events(),
            ScoringEngine::Filtered(s) => s.min_profile_events(),
        }
    }
}

/// Pending change to a [`ScoringEngine`], tagged like the engine it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoringDelta {
    Noop,
    Popularity(PopularityDelta),
    AverageRating(AverageRatingDelta),
    Filtered(FilterDelta),
}

impl ScoringDelta {
    pub fn kind(&self) -> &'static str {
        match self {
            ScoringDelta::Noop => "noop",
            ScoringDelta::Popularity(_) => "popularity",
            ScoringDelta::AverageRating(_) => "average_rating",
            ScoringDelta::Filtered(_) => "filtered",
        }
    }
}

impl Delta for ScoringDelta {
    type Target = ScoringEngine;

    fn commit(self, target: &mut ScoringEngine) -> Result<()> {
        match (self, target) {
            (ScoringDelta::Noop, _) => Ok(()),
            (ScoringDelta::Popularity(d), ScoringEngine::Popularity(s)) => d.commit(s),
            (ScoringDelta::AverageRating(d), ScoringEngine::AverageRating(s)) => d.commit(s),
            (ScoringDelta::Filtered(d), ScoringEngine::Filtered(s)) => d.commit(s),
            (delta, target) => Err(RecoError::DeltaMismatch {
                expected: target.kind(),
                found: delta.kind(),
            }),
        }
    }

    fn is_noop(&self) -> bool {
        matches!(self, ScoringDelta::Noop)
    }
}

/// Scale raw values so the best candidate of the batch gets 1.0.
pub(crate) fn normalize(batch: &mut [Candidate], raw: impl Fn(ProductId) -> f64) {
    let values: Vec<f64> = batch.iter().map(|c| raw(c.product)).collect();
    let max = values.iter().copied().fold(0.0_f64, f64::max);
    for (candidate, value) in batch.iter_mut().zip(values) {
        candidate.score = if max > 0.0 { value / max } else { 0.0 };
    }
}
