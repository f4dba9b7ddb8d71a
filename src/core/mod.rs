pub mod history;
pub mod ingest;
pub mod pipeline;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InputError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Sale,
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Completed,
    Failed,
}

/// A normalized retail payment transaction. Read-only to every engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub branch: String,
    pub mall: String,
    pub timestamp: DateTime<Utc>,
    pub amount: f64,
    pub tax_amount: f64,
    pub kind: TxKind,
    pub status: TxStatus,
}

impl TransactionRecord {
    pub fn hour(&self) -> u32 {
        self.timestamp.hour()
    }

    /// Day of week, Monday = 0.
    pub fn weekday(&self) -> u32 {
        self.timestamp.weekday().num_days_from_monday()
    }

    pub fn is_failed(&self) -> bool {
        self.status == TxStatus::Failed
    }

    /// Reject records no engine should look at.
    pub fn validate(&self) -> Result<(), InputError> {
        if self.id.trim().is_empty() {
            return Err(InputError::MissingField {
                id: self.id.clone(),
                field: "id",
            });
        }
        if self.branch.trim().is_empty() {
            return Err(InputError::MissingField {
                id: self.id.clone(),
                field: "branch",
            });
        }
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(InputError::InvalidAmount {
                id: self.id.clone(),
                amount: self.amount,
            });
        }
        if !self.tax_amount.is_finite() || self.tax_amount < 0.0 {
            return Err(InputError::InvalidTax {
                id: self.id.clone(),
                tax: self.tax_amount,
            });
        }
        Ok(())
    }
}

/// One factor's contribution to a risk score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorScore {
    pub factor: RiskFactor,
    /// Normalized 0.0-1.0.
    pub value: f64,
    pub weight: f64,
    pub weighted_score: f64,
    /// True when the branch lacked history and a fallback was used.
    pub defaulted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    Time,
    Branch,
    Amount,
    Velocity,
    Pattern,
}

impl RiskFactor {
    pub const ALL: [RiskFactor; 5] = [
        RiskFactor::Time,
        RiskFactor::Branch,
        RiskFactor::Amount,
        RiskFactor::Velocity,
        RiskFactor::Pattern,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskFactor::Time => "time_risk",
            RiskFactor::Branch => "branch_risk",
            RiskFactor::Amount => "amount_risk",
            RiskFactor::Velocity => "velocity_risk",
            RiskFactor::Pattern => "pattern_risk",
        }
    }
}

/// Failure-probability score for one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    pub transaction_id: String,
    pub value: f64, // 0.0-1.0
    pub label: RiskLabel,
    pub factors: Vec<FactorScore>,
    pub recommendations: Vec<String>,
}

impl RiskScore {
    pub fn factor(&self, factor: RiskFactor) -> Option<&FactorScore> {
        self.factors.iter().find(|f| f.factor == factor)
    }

    pub fn defaulted_factors(&self) -> Vec<RiskFactor> {
        self.factors
            .iter()
            .filter(|f| f.defaulted)
            .map(|f| f.factor)
            .collect()
    }
}

/// Ordered: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLabel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLabel::Low => "low",
            RiskLabel::Medium => "medium",
            RiskLabel::High => "high",
            RiskLabel::Critical => "critical",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            RiskLabel::Critical => "🔴",
            RiskLabel::High => "🟠",
            RiskLabel::Medium => "🟡",
            RiskLabel::Low => "⚪",
        }
    }
}
