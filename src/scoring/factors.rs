use chrono::Duration;

use crate::core::history::BranchHistory;
use crate::core::{RiskFactor, TransactionRecord};

/// Knobs shared by every factor.
#[derive(Debug, Clone, Copy)]
pub struct FactorParams {
    pub min_samples: usize,
    pub default_risk: f64,
    pub velocity_window: Duration,
}

/// Normalized factor output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FactorValue {
    pub value: f64,
    pub defaulted: bool,
}

impl FactorValue {
    fn measured(value: f64) -> Self {
        Self {
            value: value.clamp(0.0, 1.0),
            defaulted: false,
        }
    }

    fn defaulted(value: f64) -> Self {
        Self {
            value: value.clamp(0.0, 1.0),
            defaulted: true,
        }
    }
}

/// A single risk factor. Returns a value in 0.0-1.0.
pub trait Factor {
    fn kind(&self) -> RiskFactor;
    fn evaluate(&self, tx: &TransactionRecord, history: &BranchHistory, params: &FactorParams) -> FactorValue;
}

/// Return all factors in breakdown order.
pub fn default_factors() -> Vec<Box<dyn Factor + Send + Sync>> {
    vec![
        Box::new(TimeRisk),
        Box::new(BranchRisk),
        Box::new(AmountRisk),
        Box::new(VelocityRisk),
        Box::new(PatternRisk),
    ]
}

/// Failure rate in `hour` relative to the worst hour. `None` if the hour has no data.
fn relative_hour_risk(rates: &[Option<f64>; 24], hour: usize) -> Option<f64> {
    let rate = rates[hour]?;
    let peak = rates.iter().flatten().fold(0.0_f64, |a, &b| a.max(b));
    if peak <= 0.0 {
        Some(0.0)
    } else {
        Some(rate / peak)
    }
}

// --- Individual Factors ---

struct TimeRisk;
impl Factor for TimeRisk {
    fn kind(&self) -> RiskFactor { RiskFactor::Time }
    fn evaluate(&self, tx: &TransactionRecord, history: &BranchHistory, params: &FactorParams) -> FactorValue {
        let hour = tx.hour() as usize;
        if history.len() >= params.min_samples {
            if let Some(risk) = relative_hour_risk(&history.hourly_failure_rates(), hour) {
                return FactorValue::measured(risk);
            }
        }
        // Cold branch or unseen hour: network-wide hourly distribution.
        let network = &history.network;
        if network.transactions as usize >= params.min_samples {
            let mut rates = [None; 24];
            for (h, rate) in rates.iter_mut().enumerate() {
                *rate = network.hourly_failure_rate(h);
            }
            if let Some(risk) = relative_hour_risk(&rates, hour) {
                return FactorValue::defaulted(risk);
            }
        }
        FactorValue::defaulted(params.default_risk)
    }
}

/// Branch failure rate against the network: `r / (1 + r)`, 0.5 at parity.
struct BranchRisk;
impl Factor for BranchRisk {
    fn kind(&self) -> RiskFactor { RiskFactor::Branch }
    fn evaluate(&self, _tx: &TransactionRecord, history: &BranchHistory, params: &FactorParams) -> FactorValue {
        if history.len() < params.min_samples {
            return FactorValue::defaulted(params.default_risk);
        }
        let branch_rate = history.failure_rate().unwrap_or(0.0);
        match history.network.failure_rate() {
            Some(network_rate) if network_rate > 0.0 => {
                let r = branch_rate / network_rate;
                FactorValue::measured(1.0 - 1.0 / (1.0 + r))
            }
            // No failures anywhere on record
            Some(_) => FactorValue::measured(0.0),
            None => FactorValue::defaulted(params.default_risk),
        }
    }
}

/// Empirical CDF of the amount within the branch's recent amounts.
struct AmountRisk;
impl Factor for AmountRisk {
    fn kind(&self) -> RiskFactor { RiskFactor::Amount }
    fn evaluate(&self, tx: &TransactionRecord, history: &BranchHistory, params: &FactorParams) -> FactorValue {
        if history.len() < params.min_samples {
            let tier = if tx.amount > 1000.0 {
                0.7
            } else if tx.amount > 500.0 {
                0.5
            } else {
                0.3
            };
            return FactorValue::defaulted(tier);
        }
        match history.amount_rank(tx.amount) {
            Some(rank) => FactorValue::measured(rank),
            None => FactorValue::defaulted(params.default_risk),
        }
    }
}

/// Burst detection: `1 - expected / recent` over the trailing window.
struct VelocityRisk;
impl Factor for VelocityRisk {
    fn kind(&self) -> RiskFactor { RiskFactor::Velocity }
    fn evaluate(&self, tx: &TransactionRecord, history: &BranchHistory, params: &FactorParams) -> FactorValue {
        if history.len() < params.min_samples {
            return FactorValue::defaulted(0.0);
        }
        let recent = history.count_within(tx.timestamp, params.velocity_window);
        if recent == 0 {
            return FactorValue::measured(0.0);
        }
        let expected = history.expected_within(params.velocity_window);
        FactorValue::measured(1.0 - expected / recent as f64)
    }
}

struct PatternRisk;
impl Factor for PatternRisk {
    fn kind(&self) -> RiskFactor { RiskFactor::Pattern }
    fn evaluate(&self, tx: &TransactionRecord, history: &BranchHistory, _params: &FactorParams) -> FactorValue {
        if history.failure_patterns.matches(tx) {
            FactorValue::measured(1.0)
        } else {
            FactorValue::measured(0.0)
        }
    }
}
