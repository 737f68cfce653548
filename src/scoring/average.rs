use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{
    Batch, Candidate, ConsumerProfile, DataStore, Delta, ProductChanges, ProductId, Tags,
};
use crate::scoring::{normalize, Scorer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AverageRatingConfig {
    /// Event kind whose `value` carries the rating.
    pub rating_event: String,
    /// Products with fewer ratings score zero.
    pub min_ratings: u64,
    pub min_profile_events: u64,
}

impl Default for AverageRatingConfig {
    fn default() -> Self {
        Self {
            rating_event: "rating".to_string(),
            min_ratings: 1,
            min_profile_events: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingStats {
    pub sum: f64,
    pub count: u64,
}

impl RatingStats {
    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    fn add(&mut self, other: RatingStats) {
        self.sum += other.sum;
        self.count += other.count;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AverageRatingScorer {
    config: AverageRatingConfig,
    ratings: BTreeMap<ProductId, RatingStats>,
}

impl AverageRatingScorer {
    pub fn stats(&self, product: ProductId) -> RatingStats {
        self.ratings.get(&product).copied().unwrap_or_default()
    }

    fn eligible_mean(&self, product: ProductId) -> f64 {
        let stats = self.stats(product);
        if stats.count < self.config.min_ratings {
            0.0
        } else {
            stats.mean()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AverageRatingDelta {
    Increment {
        ratings: BTreeMap<ProductId, RatingStats>,
        removed: Vec<ProductId>,
    },
    Replace(BTreeMap<ProductId, RatingStats>),
}

impl Delta for AverageRatingDelta {
    type Target = AverageRatingScorer;

    fn commit(self, target: &mut AverageRatingScorer) -> Result<()> {
        match self {
            AverageRatingDelta::Increment { ratings, removed } => {
                for (product, stats) in ratings {
                    target.ratings.entry(product).or_default().add(stats);
                }
                for product in removed {
                    target.ratings.remove(&product);
                }
            }
            AverageRatingDelta::Replace(ratings) => target.ratings = ratings,
        }
        Ok(())
    }
}

impl Scorer for AverageRatingScorer {
    type Config = AverageRatingConfig;
    type Delta = AverageRatingDelta;

    fn from_config(config: &AverageRatingConfig) -> Self {
        Self {
            config: config.clone(),
            ratings: BTreeMap::new(),
        }
    }

    fn config(&self) -> AverageRatingConfig {
        self.config.clone()
    }

    fn score(
        &self,
        _profile: Option<&ConsumerProfile>,
        batch: &mut Vec<Candidate>,
        _data: &DataStore,
        _tags: &Tags,
    ) {
        normalize(batch, |p| self.eligible_mean(p));
        for candidate in batch.iter_mut() {
            let stats = self.stats(candidate.product);
            candidate.explanation = Some(if stats.count < self.config.min_ratings {
                "not enough ratings".to_string()
            } else {
                format!("average rating {:.2} from {} ratings", stats.mean(), stats.count)
            });
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
        normalize(batch, |p| {
            co.get(&p).copied().unwrap_or(0) as f64 * self.eligible_mean(p)
        });
        for candidate in batch.iter_mut() {
            candidate.explanation = Some(format!(
                "rated {:.2} by consumers of similar products",
                self.eligible_mean(candidate.product)
            ));
        }
    }

    fn update_incremental(&self, batch: &Batch, _data: &DataStore) -> AverageRatingDelta {
        let mut ratings: BTreeMap<ProductId, RatingStats> = BTreeMap::new();
        for event in batch
            .events
            .iter()
            .filter(|e| e.kind == self.config.rating_event)
        {
            ratings.entry(event.product).or_default().add(RatingStats {
                sum: event.value,
                count: 1,
            });
        }
        AverageRatingDelta::Increment {
            ratings,
            removed: batch.products.removed.clone(),
        }
    }

    fn update_products(&self, changes: &ProductChanges, _data: &DataStore) -> AverageRatingDelta {
        AverageRatingDelta::Increment {
            ratings: BTreeMap::new(),
            removed: changes.removed.clone(),
        }
    }

    fn state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.ratings)?)
    }

    fn restore(&self, state: serde_json::Value) -> Result<AverageRatingDelta> {
        Ok(AverageRatingDelta::Replace(serde_json::from_value(state)?))
    }

    fn min_profile_events(&self) -> u64 {
        self.config.min_profile_events
    }
}
