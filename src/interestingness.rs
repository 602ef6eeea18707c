//! Scoring how strongly predictors disagree on a block.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::predictors::PredictorOutcome;
use crate::util::ratio;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct InterestingnessConfig {
    /// A block is interesting iff its score reaches this threshold.
    pub min_interestingness: f64,
    /// A batch is mostly interesting iff at least this fraction of its
    /// blocks is interesting.
    pub mostly_interesting_ratio: f64,
    /// Search for agreement instead of disagreement.
    pub invert_interestingness: bool,
}

impl Default for InterestingnessConfig {
    fn default() -> Self {
        InterestingnessConfig {
            min_interestingness: 0.5,
            mostly_interesting_ratio: 1.0,
            invert_interestingness: false,
        }
    }
}

/// Decides when a group of predictor results is interesting.
///
/// The metric works for any number of predictors, not only two.
#[derive(Clone, Debug)]
pub struct InterestingnessMetric {
    config: InterestingnessConfig,
}

impl InterestingnessMetric {
    pub fn new(config: InterestingnessConfig) -> Self {
        InterestingnessMetric { config }
    }

    pub fn config(&self) -> &InterestingnessConfig {
        &self.config
    }

    /// The relative spread of the predictions: `max/min - 1`. A failed
    /// predictor next to a successful one makes the block maximally
    /// interesting; if every predictor failed there is no spread to speak
    /// of and the score is zero.
    pub fn score(&self, results: &BTreeMap<String, PredictorOutcome>) -> f64 {
        let values: Vec<f64> = results
            .values()
            .filter(|o| !o.is_failure())
            .map(|o| o.tp.unwrap())
            .collect();
        if values.is_empty() {
            return 0.0;
        }
        if values.len() < results.len() {
            return f64::INFINITY;
        }
        let max = values.iter().cloned().fold(f64::MIN, f64::max);
        let min = values.iter().cloned().fold(f64::MAX, f64::min);
        max / min - 1.0
    }

    pub fn is_interesting(&self, results: &BTreeMap<String, PredictorOutcome>) -> bool {
        let normally = self.score(results) >= self.config.min_interestingness;
        if self.config.invert_interestingness {
            !normally
        } else {
            normally
        }
    }

    /// Indices of the interesting blocks of a batch.
    pub fn filter_interesting(
        &self,
        per_block: &[BTreeMap<String, PredictorOutcome>],
    ) -> Vec<usize> {
        per_block
            .iter()
            .enumerate()
            .filter(|(_, r)| self.is_interesting(r))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Batch-level acceptance; an empty batch is never mostly interesting.
    pub fn is_mostly_interesting(
        &self,
        per_block: &[BTreeMap<String, PredictorOutcome>],
    ) -> bool {
        if per_block.is_empty() {
            return false;
        }
        let interesting = self.filter_interesting(per_block).len();
        ratio(interesting, per_block.len()) >= self.config.mostly_interesting_ratio
    }
}
