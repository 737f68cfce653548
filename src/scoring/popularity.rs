use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{
    Batch, Candidate, ConsumerProfile, DataStore, Delta, ProductChanges, ProductId, Tags,
};
use crate::scoring::{normalize, Scorer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PopularityConfig {
    /// Weight per event kind; kinds not listed count `default_weight`.
    pub event_weights: BTreeMap<String, f64>,
    pub default_weight: f64,
    pub min_profile_events: u64,
}

impl Default for PopularityConfig {
    fn default() -> Self {
        Self {
            event_weights: BTreeMap::from([
                ("view".to_string(), 1.0),
                ("cart".to_string(), 3.0),
                ("purchase".to_string(), 5.0),
            ]),
            default_weight: 1.0,
            min_profile_events: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopularityState {
    pub counts: BTreeMap<ProductId, f64>,
    pub events: u64,
}

/// Weighted interaction counter. Scores are counts scaled to the batch maximum.
#[derive(Debug, Clone, PartialEq)]
pub struct PopularityScorer {
    config: PopularityConfig,
    state: PopularityState,
}

impl PopularityScorer {
    pub fn count(&self, product: ProductId) -> f64 {
        self.state.counts.get(&product).copied().unwrap_or(0.0)
    }

    /// Number of events folded into the counts.
    pub fn total_events(&self) -> u64 {
        self.state.events
    }

    fn weight(&self, kind: &str) -> f64 {
        self.config
            .event_weights
            .get(kind)
            .copied()
            .unwrap_or(self.config.default_weight)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PopularityDelta {
    Increment {
        counts: BTreeMap<ProductId, f64>,
        events: u64,
        removed: Vec<ProductId>,
    },
    Replace(PopularityState),
}

impl Delta for PopularityDelta {
    type Target = PopularityScorer;

    fn commit(self, target: &mut PopularityScorer) -> Result<()> {
        match self {
            PopularityDelta::Increment {
                counts,
                events,
                removed,
            } => {
                for (product, count) in counts {
                    *target.state.counts.entry(product).or_insert(0.0) += count;
                }
                for product in removed {
                    target.state.counts.remove(&product);
                }
                target.state.events += events;
            }
            PopularityDelta::Replace(state) => target.state = state,
        }
        Ok(())
    }
}

impl Scorer for PopularityScorer {
    type Config = PopularityConfig;
    type Delta = PopularityDelta;

    fn from_config(config: &PopularityConfig) -> Self {
        Self {
            config: config.clone(),
            state: PopularityState::default(),
        }
    }

    fn config(&self) -> PopularityConfig {
        self.config.clone()
    }

    fn score(
        &self,
        _profile: Option<&ConsumerProfile>,
        batch: &mut Vec<Candidate>,
        _data: &DataStore,
        _tags: &Tags,
    ) {
        normalize(batch, |p| self.count(p));
        for candidate in batch.iter_mut() {
            candidate.explanation = Some(format!(
                "{} weighted interactions",
                self.count(candidate.product)
            ));
        }
    }

    fn score_similar(
        &self,
        seeds: &[ProductId],
        batch: &mut Vec<Candidate>,
        data: &DataStore,
        _tags: &Tags,
    ) {
        let co = data.co_occurrence(seeds);
        let shared = |p: ProductId| co.get(&p).copied().unwrap_or(0);
        normalize(batch, |p| shared(p) as f64);
        for candidate in batch.iter_mut() {
            candidate.explanation = Some(format!(
                "shared by {} consumers",
                shared(candidate.product)
            ));
        }
    }

    fn update_incremental(&self, batch: &Batch, _data: &DataStore) -> PopularityDelta {
        let mut counts = BTreeMap::new();
        for event in &batch.events {
            *counts.entry(event.product).or_insert(0.0) += self.weight(&event.kind);
        }
        PopularityDelta::Increment {
            counts,
            events: batch.events.len() as u64,
            removed: batch.products.removed.clone(),
        }
    }

    fn update_products(&self, changes: &ProductChanges, _data: &DataStore) -> PopularityDelta {
        PopularityDelta::Increment {
            counts: BTreeMap::new(),
            events: 0,
            removed: changes.removed.clone(),
        }
    }

    fn state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore(&self, state: serde_json::Value) -> Result<PopularityDelta> {
        Ok(PopularityDelta::Replace(serde_json::from_value(state)?))
    }

    fn min_profile_events(&self) -> u64 {
        self.config.min_profile_events
    }
}
