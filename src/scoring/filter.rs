use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{
    Batch, Candidate, ConsumerProfile, DataStore, Delta, Product, ProductChanges, ProductId, Tags,
};
use crate::scoring::{Scorer, ScoringConfig, ScoringDelta, ScoringEngine};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredConfig {
    /// Attributes a product must carry, with these exact values, to be recommended.
    #[serde(default)]
    pub required_attributes: BTreeMap<String, String>,
    pub inner: Box<ScoringConfig>,
}

impl FilteredConfig {
    pub fn new(inner: ScoringConfig) -> Self {
        Self {
            required_attributes: BTreeMap::new(),
            inner: Box::new(inner),
        }
    }

    pub fn require(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.required_attributes.insert(key.into(), value.into());
        self
    }
}

/// Decorator that drops candidates outside the allowed product set, then
/// delegates to the wrapped engine.
///
/// The allowed set is learned from product changes, so filtering a batch is a
/// set lookup rather than an attribute comparison per candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredScorer {
    required: BTreeMap<String, String>,
    allowed: BTreeSet<ProductId>,
    inner: Box<ScoringEngine>,
}

impl FilteredScorer {
    pub fn inner(&self) -> &ScoringEngine {
        &self.inner
    }

    pub fn is_allowed(&self, product: ProductId) -> bool {
        self.allowed.contains(&product)
    }

    fn matches(&self, product: &Product) -> bool {
        self.required
            .iter()
            .all(|(key, value)| product.attributes.get(key) == Some(value))
    }

    fn allowed_change(&self, changes: &ProductChanges) -> AllowedChange {
        if changes.is_empty() {
            return AllowedChange::Unchanged;
        }
        let mut admitted = Vec::new();
        let mut rejected = changes.removed.clone();
        for product in &changes.upserted {
            if self.matches(product) {
                admitted.push(product.id);
            } else {
                rejected.push(product.id);
            }
        }
        AllowedChange::Patch { admitted, rejected }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AllowedChange {
    Unchanged,
    Patch {
        admitted: Vec<ProductId>,
        rejected: Vec<ProductId>,
    },
    Replace(BTreeSet<ProductId>),
}

/// Composite delta: the filter's own change plus the wrapped engine's delta.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterDelta {
    pub allowed: AllowedChange,
    pub inner: Box<ScoringDelta>,
}

impl Delta for FilterDelta {
    type Target = FilteredScorer;

    fn commit(self, target: &mut FilteredScorer) -> Result<()> {
        self.inner.commit(&mut target.inner)?;
        match self.allowed {
            AllowedChange::Unchanged => {}
            AllowedChange::Patch { admitted, rejected } => {
                // Removal runs before admission, matching the data store's order.
                for id in rejected {
                    target.allowed.remove(&id);
                }
                target.allowed.extend(admitted);
            }
            AllowedChange::Replace(allowed) => target.allowed = allowed,
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct FilterState {
    allowed: BTreeSet<ProductId>,
    inner: serde_json::Value,
}

impl Scorer for FilteredScorer {
    type Config = FilteredConfig;
    type Delta = FilterDelta;

    fn from_config(config: &FilteredConfig) -> Self {
        Self {
            required: config.required_attributes.clone(),
            allowed: BTreeSet::new(),
            inner: Box::new(ScoringEngine::from_config(&config.inner)),
        }
    }

    fn config(&self) -> FilteredConfig {
        FilteredConfig {
            required_attributes: self.required.clone(),
            inner: Box::new(self.inner.config()),
        }
    }

    fn score(
        &self,
        profile: Option<&ConsumerProfile>,
        batch: &mut Vec<Candidate>,
        data: &DataStore,
        tags: &Tags,
    ) {
        batch.retain(|c| self.is_allowed(c.product));
        if batch.is_empty() {
            return;
        }
        self.inner.score(profile, batch, data, tags);
    }

    fn score_similar(
        &self,
        seeds: &[ProductId],
        batch: &mut Vec<Candidate>,
        data: &DataStore,
        tags: &Tags,
    ) {
        batch.retain(|c| self.is_allowed(c.product));
        if batch.is_empty() {
            return;
        }
        self.inner.score_similar(seeds, batch, data, tags);
    }

    fn update_incremental(&self, batch: &Batch, data: &DataStore) -> FilterDelta {
        FilterDelta {
            allowed: self.allowed_change(&batch.products),
            inner: Box::new(self.inner.update_incremental(batch, data)),
        }
    }

    fn update_products(&self, changes: &ProductChanges, data: &DataStore) -> FilterDelta {
        FilterDelta {
            allowed: self.allowed_change(changes),
            inner: Box::new(self.inner.update_products(changes, data)),
        }
    }

    fn state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(FilterState {
            allowed: self.allowed.clone(),
            inner: self.inner.state()?,
        })?)
    }

    fn restore(&self, state: serde_json::Value) -> Result<FilterDelta> {
        let state: FilterState = serde_json::from_value(state)?;
        Ok(FilterDelta {
            allowed: AllowedChange::Replace(state.allowed),
            inner: Box::new(self.inner.restore(state.inner)?),
        })
    }

    fn min_profile_events(&self) -> u64 {
        self.inner.min_profile_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Event;
    use crate::scoring::PopularityConfig;

    fn filtered() -> FilteredScorer {
        FilteredScorer::from_config(
            &FilteredConfig::new(ScoringConfig::Popularity(PopularityConfig::default()))
                .require("lang", "en"),
        )
    }

    fn catalogue() -> ProductChanges {
        ProductChanges {
            upserted: vec![
                Product::new(1, "english").with_attribute("lang", "en"),
                Product::new(2, "german").with_attribute("lang", "de"),
                Product::new(3, "untagged"),
            ],
            removed: vec![],
        }
    }

    #[test]
    fn only_matching_products_are_admitted() {
        let mut scorer = filtered();
        scorer
            .update_products(&catalogue(), &DataStore::new())
            .commit(&mut scorer)
            .unwrap();
        assert!(scorer.is_allowed(1));
        assert!(!scorer.is_allowed(2));
        assert!(!scorer.is_allowed(3));
    }

    #[test]
    fn score_drops_filtered_candidates_then_delegates() {
        let mut scorer = filtered();
        let batch = Batch::new(vec![Event::new(1, 1, "view")]).with_products(catalogue());
        scorer
            .update_incremental(&batch, &DataStore::new())
            .commit(&mut scorer)
            .unwrap();

        let mut candidates = vec![Candidate::new(1), Candidate::new(2), Candidate::new(3)];
        scorer.score(None, &mut candidates, &DataStore::new(), &Tags::new());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].product, 1);
        assert_eq!(candidates[0].score, 1.0);
    }

    #[test]
    fn retagged_product_leaves_allowed_set() {
        let mut scorer = filtered();
        scorer
            .update_products(&catalogue(), &DataStore::new())
            .commit(&mut scorer)
            .unwrap();
        let retag = ProductChanges {
            upserted: vec![Product::new(1, "english").with_attribute("lang", "fr")],
            removed: vec![],
        };
        scorer
            .update_products(&retag, &DataStore::new())
            .commit(&mut scorer)
            .unwrap();
        assert!(!scorer.is_allowed(1));
    }

    #[test]
    fn restore_rebuilds_filter_and_inner_engine() {
        let mut source = filtered();
        let batch = Batch::new(vec![Event::new(1, 1, "purchase")]).with_products(catalogue());
        source
            .update_incremental(&batch, &DataStore::new())
            .commit(&mut source)
            .unwrap();

        let mut fresh = filtered();
        let delta = fresh.restore(source.state().unwrap()).unwrap();
        delta.commit(&mut fresh).unwrap();
        assert_eq!(fresh, source);
    }
}
