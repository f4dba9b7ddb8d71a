use crate::config::LabelBoundaries;
use crate::core::{FactorScore, RiskLabel};

/// Weighted sum of factor scores, clamped to [0, 1].
pub fn compute_weighted(scores: &[FactorScore]) -> f64 {
    let total: f64 = scores.iter().map(|s| s.weighted_score).sum();
    if total.is_nan() {
        return 0.0;
    }
    total.clamp(0.0, 1.0)
}

/// Map a score onto the label scale. Each boundary is inclusive on its upper side.
pub fn label_for(score: f64, boundaries: &LabelBoundaries) -> RiskLabel {
    if score >= boundaries.critical {
        RiskLabel::Critical
    } else if score >= boundaries.high {
        RiskLabel::High
    } else if score >= boundaries.medium {
        RiskLabel::Medium
    } else {
        RiskLabel::Low
    }
}
