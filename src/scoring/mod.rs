pub mod factors;
pub mod score;

use chrono::Duration;

use crate::config::{FactorWeights, LabelBoundaries, ScoringConfig};
use crate::core::history::BranchHistory;
use crate::core::{FactorScore, RiskFactor, RiskScore, TransactionRecord};
use crate::error::{ConfigError, InputError};
use factors::{Factor, FactorParams};

/// Predictive failure scoring: applies every factor and combines them with fixed weights.
/// Holds no mutable state.
pub struct RiskScorer {
    factors: Vec<Box<dyn Factor + Send + Sync>>,
    weights: FactorWeights,
    boundaries: LabelBoundaries,
    params: FactorParams,
}

impl RiskScorer {
    pub fn new(config: &ScoringConfig) -> Result<Self, ConfigError> {
        config.weights.validate()?;
        config.boundaries.validate()?;
        Ok(Self {
            factors: factors::default_factors(),
            weights: config.weights,
            boundaries: config.boundaries,
            params: FactorParams {
                min_samples: config.min_samples,
                default_risk: config.default_risk,
                velocity_window: Duration::seconds(config.velocity_window_secs as i64),
            },
        })
    }

    pub fn score(&self, tx: &TransactionRecord, history: &BranchHistory) -> Result<RiskScore, InputError> {
        tx.validate()?;

        let factors: Vec<FactorScore> = self
            .factors
            .iter()
            .map(|factor| {
                let kind = factor.kind();
                let out = factor.evaluate(tx, history, &self.params);
                let weight = weight_of(&self.weights, kind);
                FactorScore {
                    factor: kind,
                    value: out.value,
                    weight,
                    weighted_score: out.value * weight,
                    defaulted: out.defaulted,
                }
            })
            .collect();

        let value = score::compute_weighted(&factors);
        let label = score::label_for(value, &self.boundaries);
        let recommendations = recommendations(&factors);

        let defaulted = factors.iter().filter(|f| f.defaulted).count();
        if defaulted > 0 {
            tracing::debug!(
                id = %tx.id,
                branch = %tx.branch,
                history = history.len(),
                defaulted,
                "Scored with default factors"
            );
        }

        Ok(RiskScore {
            transaction_id: tx.id.clone(),
            value,
            label,
            factors,
            recommendations,
        })
    }
}

fn weight_of(weights: &FactorWeights, factor: RiskFactor) -> f64 {
    match factor {
        RiskFactor::Time => weights.time,
        RiskFactor::Branch => weights.branch,
        RiskFactor::Amount => weights.amount,
        RiskFactor::Velocity => weights.velocity,
        RiskFactor::Pattern => weights.pattern,
    }
}

fn recommendations(factors: &[FactorScore]) -> Vec<String> {
    let high = |kind: RiskFactor| factors.iter().any(|f| f.factor == kind && f.value > 0.7);
    let mut out = Vec::new();
    if high(RiskFactor::Time) {
        out.push("Consider delaying transaction to a lower-risk time".to_string());
    }
    if high(RiskFactor::Branch) {
        out.push("Route transaction through alternative gateway".to_string());
    }
    if high(RiskFactor::Amount) {
        out.push("Split large transaction into smaller chunks".to_string());
    }
    if out.is_empty() {
        out.push("Transaction can proceed with standard monitoring".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RiskLabel;
    use crate::core::history::NetworkStats;
    use crate::core::test_support::*;

    fn scorer() -> RiskScorer {
        RiskScorer::new(&ScoringConfig::default()).unwrap()
    }

    #[test]
    fn rejects_bad_weights() {
        let mut config = ScoringConfig::default();
        config.weights.pattern = 0.2;
        assert!(RiskScorer::new(&config).is_err());
    }

    #[test]
    fn rejects_bad_boundaries() {
        let mut config = ScoringConfig::default();
        config.boundaries.high = 0.9;
        assert!(RiskScorer::new(&config).is_err());
    }

    #[test]
    fn negative_amount_is_an_error_not_a_score() {
        let tx = make_tx("neg", "North", at(2025, 1, 1, 10, 0), -1.0);
        let err = scorer().score(&tx, &BranchHistory::default()).unwrap_err();
        assert!(matches!(err, InputError::InvalidAmount { .. }));
    }

    #[test]
    fn cold_start_marks_defaults() {
        let records: Vec<_> = (0..29u32)
            .map(|i| make_tx(&format!("t{i}"), "North", at(2025, 1, 1, 10, i), 40.0))
            .collect();
        let h = BranchHistory::new("North", records, NetworkStats::default());
        let s = scorer()
            .score(&make_tx("q", "North", at(2025, 1, 1, 11, 0), 40.0), &h)
            .unwrap();
        let defaulted = s.defaulted_factors();
        assert!(defaulted.contains(&RiskFactor::Time));
        assert!(defaulted.contains(&RiskFactor::Branch));
        assert!(s.value.is_finite());
        assert!(s.factors.iter().all(|f| f.value.is_finite()));
        assert!((0.0..=1.0).contains(&s.value));
    }

    #[test]
    fn empty_history_scores() {
        let s = scorer()
            .score(&make_tx("q", "North", at(2025, 1, 1, 11, 0), 40.0), &BranchHistory::default())
            .unwrap();
        // 0.3*0.5 + 0.25*0.5 + 0.2*0.3 + 0 + 0
        assert!((s.value - 0.335).abs() < 1e-9);
        assert_eq!(s.label, RiskLabel::Medium);
        assert_eq!(s.factors.len(), 5);
        assert_eq!(
            s.recommendations,
            vec!["Transaction can proceed with standard monitoring".to_string()]
        );
    }

    #[test]
    fn breakdown_weights_match_config() {
        let s = scorer()
            .score(&make_tx("q", "North", at(2025, 1, 1, 11, 0), 40.0), &BranchHistory::default())
            .unwrap();
        let total: f64 = s.factors.iter().map(|f| f.weight).sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert_eq!(s.factor(RiskFactor::Time).unwrap().weight, 0.30);
        assert_eq!(s.factor(RiskFactor::Pattern).unwrap().weight, 0.10);
    }

    #[test]
    fn high_amount_recommends_split() {
        let records: Vec<_> = (0..50u32)
            .map(|i| make_tx(&format!("t{i}"), "North", at(2025, 1, 1, 10, i), 40.0))
            .collect();
        let h = BranchHistory::new("North", records, NetworkStats::default());
        let s = scorer()
            .score(&make_tx("q", "North", at(2025, 1, 1, 11, 0), 900.0), &h)
            .unwrap();
        assert_eq!(s.factor(RiskFactor::Amount).unwrap().value, 1.0);
        assert!(s
            .recommendations
            .iter()
            .any(|r| r.contains("Split large transaction")));
    }
}
