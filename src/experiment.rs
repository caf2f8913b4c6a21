//! Winner selection for experiment runs.
//!
//! Each variant runs through the full pipeline on its own. Once they have
//! all finished, a [`VariantScorer`] ranks the successful ones.

use crate::config::ExperimentConfig;
use crate::state_machine::ExecutionResult;

/// Composite score for a finished variant; higher wins.
pub trait VariantScorer: Send + Sync {
    fn score(&self, result: &ExecutionResult) -> f64;
}

/// `quality·percentage + first_pass·(100 if no auto-fix) − cost_weight·cost`
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedScorer {
    pub quality_weight: f64,
    pub first_pass_weight: f64,
    pub cost_weight: f64,
}

impl WeightedScorer {
    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self {
            quality_weight: config.quality_weight,
            first_pass_weight: config.first_pass_weight,
            cost_weight: config.cost_weight,
        }
    }
}

impl Default for WeightedScorer {
    fn default() -> Self {
        Self::from_config(&ExperimentConfig::default())
    }
}

impl VariantScorer for WeightedScorer {
    fn score(&self, result: &ExecutionResult) -> f64 {
        let meta = &result.metadata;
        let first_pass = if meta.auto_fix_applied { 0.0 } else { 100.0 };
        self.quality_weight * meta.qa.percentage + self.first_pass_weight * first_pass
            - self.cost_weight * meta.cost
    }
}

/// Index of the highest composite. The earliest variant wins ties.
pub fn pick_winner(composites: &[Option<f64>]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, composite) in composites.iter().enumerate() {
        let Some(value) = *composite else { continue };
        if best.is_none_or(|(_, top)| value > top) {
            best = Some((index, value));
        }
    }
    best.map(|(index, _)| index)
}
