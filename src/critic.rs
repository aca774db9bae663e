//! Critic rubric and verdicts
//!
//! A rubric names the scored dimensions, their pass thresholds and weights, and
//! an aggregate threshold on the weighted mean. The verdict is always computed
//! here from the scores, never taken from the critique service on trust.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionRule {
    pub threshold: f64,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub dimensions: BTreeMap<String, DimensionRule>,
    pub aggregate_threshold: f64,
}

impl Default for Rubric {
    fn default() -> Self {
        let mut dimensions = BTreeMap::new();
        dimensions.insert(
            "coverage".to_string(),
            DimensionRule {
                threshold: 0.90,
                weight: 0.4,
            },
        );
        dimensions.insert(
            "accuracy".to_string(),
            DimensionRule {
                threshold: 0.85,
                weight: 0.4,
            },
        );
        dimensions.insert(
            "clarity".to_string(),
            DimensionRule {
                threshold: 0.70,
                weight: 0.2,
            },
        );
        Self {
            dimensions,
            aggregate_threshold: 0.85,
        }
    }
}

/// Outcome of one critique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticResult {
    pub dimension_scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub dimension_thresholds: BTreeMap<String, f64>,
    #[serde(default)]
    pub weighted_score: f64,
    pub overall_pass: bool,
    #[serde(default)]
    pub feedback: Vec<String>,
    #[serde(default)]
    pub cost: f64,
}

impl Rubric {
    pub fn validate(&self) -> Result<(), String> {
        if self.dimensions.is_empty() {
            return Err("rubric must define at least one dimension".to_string());
        }
        for (name, rule) in &self.dimensions {
            if !(0.0..=1.0).contains(&rule.threshold) {
                return Err(format!("dimension '{}' threshold must be in [0, 1]", name));
            }
            if !rule.weight.is_finite() || rule.weight < 0.0 {
                return Err(format!("dimension '{}' weight must be non-negative", name));
            }
        }
        if self.dimensions.values().map(|r| r.weight).sum::<f64>() <= 0.0 {
            return Err("rubric weights must not all be zero".to_string());
        }
        if !(0.0..=1.0).contains(&self.aggregate_threshold) {
            return Err("aggregate threshold must be in [0, 1]".to_string());
        }
        Ok(())
    }

    /// Weighted mean of the scores over the rubric's dimensions.
    /// Dimensions the critic did not score count as zero.
    pub fn weighted_score(&self, scores: &BTreeMap<String, f64>) -> f64 {
        let total_weight: f64 = self.dimensions.values().map(|r| r.weight).sum();
        if total_weight <= 0.0 {
            return 0.0;
        }
        self.dimensions
            .iter()
            .map(|(name, rule)| rule.weight * scores.get(name).copied().unwrap_or(0.0))
            .sum::<f64>()
            / total_weight
    }

    /// Build a verdict from raw scores.
    pub fn judge(
        &self,
        dimension_scores: BTreeMap<String, f64>,
        feedback: Vec<String>,
        cost: f64,
    ) -> CriticResult {
        let dimension_scores: BTreeMap<String, f64> = dimension_scores
            .into_iter()
            .map(|(name, score)| {
                let score = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 };
                (name, score)
            })
            .collect();
        let dimension_thresholds: BTreeMap<String, f64> = self
            .dimensions
            .iter()
            .map(|(name, rule)| (name.clone(), rule.threshold))
            .collect();
        let every_dimension_passes = self.dimensions.iter().all(|(name, rule)| {
            dimension_scores
                .get(name)
                .map(|score| *score >= rule.threshold)
                .unwrap_or(false)
        });
        let weighted_score = self.weighted_score(&dimension_scores);
        CriticResult {
            dimension_scores,
            dimension_thresholds,
            weighted_score,
            overall_pass: every_dimension_passes && weighted_score >= self.aggregate_threshold,
            feedback,
            cost,
        }
    }

    /// Recompute a service-provided verdict against this rubric.
    pub fn reconcile(&self, reported: CriticResult) -> CriticResult {
        let claimed = reported.overall_pass;
        let judged = self.judge(reported.dimension_scores, reported.feedback, reported.cost);
        if claimed != judged.overall_pass {
            warn!(
                claimed,
                judged = judged.overall_pass,
                weighted_score = judged.weighted_score,
                "Critique verdict disagrees with rubric, using rubric verdict"
            );
        }
        judged
    }
}

impl CriticResult {
    /// Dimensions below their threshold, for feedback and diagnostics.
    pub fn failing_dimensions(&self) -> Vec<String> {
        self.dimension_thresholds
            .iter()
            .filter(|(name, threshold)| {
                self.dimension_scores
                    .get(*name)
                    .map(|score| score < *threshold)
                    .unwrap_or(true)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}
