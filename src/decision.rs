//! Decision engines: select and order the final top-N from scored candidates.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::{RecoError, Result};
use crate::model::{Batch, Candidate, Delta, Recommendation, Tags};

/// Per-call override for the threshold decider's minimum score.
pub const MIN_SCORE_TAG: &str = "min_score";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DecisionConfig {
    #[default]
    TopScore,
    Threshold {
        min_score: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionEngine {
    TopScore,
    Threshold { min_score: f64 },
}

impl DecisionEngine {
    pub fn from_config(config: &DecisionConfig) -> Self {
        match config {
            DecisionConfig::TopScore => DecisionEngine::TopScore,
            DecisionConfig::Threshold { min_score } => DecisionEngine::Threshold {
                min_score: *min_score,
            },
        }
    }

    pub fn config(&self) -> DecisionConfig {
        match self {
            DecisionEngine::TopScore => DecisionConfig::TopScore,
            DecisionEngine::Threshold { min_score } => DecisionConfig::Threshold {
                min_score: *min_score,
            },
        }
    }

    pub fn clone_config_only(&self) -> Self {
        Self::from_config(&self.config())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DecisionEngine::TopScore => "top_score",
            DecisionEngine::Threshold { .. } => "threshold",
        }
    }

    /// Order candidates by descending score and keep at most `max_results`.
    ///
    /// With `randomize`, candidates with equal scores are shuffled among
    /// themselves; the relative order of different scores never changes.
    pub fn select_best(
        &self,
        mut candidates: Vec<Candidate>,
        max_results: usize,
        randomize: bool,
        tags: &Tags,
    ) -> Vec<Recommendation> {
        if let DecisionEngine::Threshold { min_score } = self {
            let min_score = tags
                .get(MIN_SCORE_TAG)
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(*min_score);
            candidates.retain(|c| c.score >= min_score);
        }

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.product.cmp(&b.product))
        });
        if randomize {
            shuffle_ties(&mut candidates);
        }
        candidates.truncate(max_results);
        candidates.into_iter().map(Recommendation::from).collect()
    }

    /// Decision engines learn nothing from source data.
    pub fn update_incremental(&self, _batch: &Batch) -> DecisionDelta {
        DecisionDelta::Noop
    }

    pub fn state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.config())?)
    }

    pub fn restore(&self, state: serde_json::Value) -> Result<DecisionDelta> {
        let restored = DecisionEngine::from_config(&serde_json::from_value(state)?);
        if restored.kind() != self.kind() {
            return Err(RecoError::DeltaMismatch {
                expected: self.kind(),
                found: restored.kind(),
            });
        }
        Ok(DecisionDelta::Replace(restored))
    }
}

fn shuffle_ties(candidates: &mut [Candidate]) {
    let mut rng = rand::thread_rng();
    let mut start = 0;
    while start < candidates.len() {
        let score = candidates[start].score;
        let end = candidates[start..]
            .iter()
            .position(|c| c.score != score)
            .map_or(candidates.len(), |offset| start + offset);
        candidates[start..end].shuffle(&mut rng);
        start = end;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionDelta {
    Noop,
    Replace(DecisionEngine),
}

impl Delta for DecisionDelta {
    type Target = DecisionEngine;

    fn commit(self, target: &mut DecisionEngine) -> Result<()> {
        if let DecisionDelta::Replace(engine) = self {
            *target = engine;
        }
        Ok(())
    }

    fn is_noop(&self) -> bool {
        matches!(self, DecisionDelta::Noop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(pairs: &[(u64, f64)]) -> Vec<Candidate> {
        pairs
            .iter()
            .map(|&(product, score)| Candidate {
                product,
                score,
                explanation: None,
            })
            .collect()
    }

    fn ids(result: &[Recommendation]) -> Vec<u64> {
        result.iter().map(|r| r.product).collect()
    }

    #[test]
    fn top_score_orders_and_truncates() {
        let engine = DecisionEngine::TopScore;
        let result = engine.select_best(
            scored(&[(1, 0.2), (2, 0.9), (3, 0.5)]),
            2,
            false,
            &Tags::new(),
        );
        assert_eq!(ids(&result), vec![2, 3]);
    }

    #[test]
    fn ties_break_by_product_id_without_randomize() {
        let engine = DecisionEngine::TopScore;
        let result = engine.select_best(
            scored(&[(3, 1.0), (1, 1.0), (2, 1.0)]),
            10,
            false,
            &Tags::new(),
        );
        assert_eq!(ids(&result), vec![1, 2, 3]);
    }

    #[test]
    fn randomize_only_permutes_within_ties() {
        let engine = DecisionEngine::TopScore;
        for _ in 0..20 {
            let result = engine.select_best(
                scored(&[(1, 0.5), (2, 0.5), (3, 0.9), (4, 0.1)]),
                10,
                true,
                &Tags::new(),
            );
            let order = ids(&result);
            assert_eq!(order[0], 3);
            assert!(order[1..3].contains(&1) && order[1..3].contains(&2));
            assert_eq!(order[3], 4);
        }
    }

    #[test]
    fn threshold_drops_low_scores_and_honours_tag() {
        let engine = DecisionEngine::Threshold { min_score: 0.5 };
        let candidates = scored(&[(1, 0.4), (2, 0.6), (3, 0.8)]);
        let result = engine.select_best(candidates.clone(), 10, false, &Tags::new());
        assert_eq!(ids(&result), vec![3, 2]);

        let tags = Tags::from([(MIN_SCORE_TAG.to_string(), "0.7".to_string())]);
        let result = engine.select_best(candidates, 10, false, &tags);
        assert_eq!(ids(&result), vec![3]);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let result = DecisionEngine::TopScore.select_best(Vec::new(), 5, true, &Tags::new());
        assert!(result.is_empty());
    }

    #[test]
    fn restore_rejects_other_strategy() {
        let engine = DecisionEngine::TopScore;
        let state = DecisionEngine::Threshold { min_score: 0.1 }.state().unwrap();
        assert!(engine.restore(state).is_err());
    }
}
