use std::collections::HashSet;

use chrono::Timelike;
use serde::{Deserialize, Serialize};

use super::MetricsSnapshot;
use crate::core::RiskLabel;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Severity::Critical => "🚨",
            Severity::Warning => "⚠️",
            Severity::Info => "ℹ️",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Telegram,
    Slack,
    Sms,
    Email,
    Desktop,
    Log,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Telegram => "telegram",
            ChannelKind::Slack => "slack",
            ChannelKind::Sms => "sms",
            ChannelKind::Email => "email",
            ChannelKind::Desktop => "desktop",
            ChannelKind::Log => "log",
        }
    }
}

/// What a rule looks for in a metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    /// Branch failure rate over a trailing window exceeds `threshold`.
    FailureRate {
        threshold: f64,
        window_secs: u64,
        min_transactions: u64,
    },
    /// The scored transaction is labelled critical.
    RiskCritical,
    /// The transaction amount fell outside the branch signature band.
    AnomalyFlagged,
    /// Recent volume is at least `ratio` times the branch's usual volume.
    VelocitySpike { ratio: f64, min_transactions: u64 },
    /// The current hour's failure rate sits more than `sigma` standard
    /// deviations above the branch's mean hourly rate.
    HourlyFailureSpike { sigma: f64, min_transactions: u64 },
    /// Failure rate over the trailing window exceeds `factor` times the rate
    /// over the whole held history.
    FailureSurge {
        factor: f64,
        window_secs: u64,
        min_transactions: u64,
    },
    /// Another branch fails at the same hours, with cosine similarity above
    /// `min_similarity`.
    SharedFailurePattern { min_similarity: f64 },
}

impl RuleKind {
    /// Description of the violation, or `None` if the snapshot is fine.
    pub fn check(&self, snapshot: &MetricsSnapshot) -> Option<String> {
        match self {
            RuleKind::FailureRate {
                threshold,
                window_secs,
                min_transactions,
            } => {
                let stats = snapshot.windows.get(window_secs)?;
                if stats.transactions < *min_transactions {
                    return None;
                }
                let rate = stats.failure_rate();
                (rate > *threshold).then(|| {
                    format!(
                        "failure rate {:.1}% ({} of {}) over the last {} min exceeds {:.1}%",
                        rate * 100.0,
                        stats.failures,
                        stats.transactions,
                        window_secs / 60,
                        threshold * 100.0
                    )
                })
            }
            RuleKind::RiskCritical => {
                let risk = snapshot.risk.as_ref()?;
                (risk.label == RiskLabel::Critical).then(|| {
                    format!(
                        "transaction {} scored {:.2} ({})",
                        risk.transaction_id,
                        risk.value,
                        risk.label.as_str()
                    )
                })
            }
            RuleKind::AnomalyFlagged => {
                let flag = snapshot.anomaly.as_ref()?;
                flag.anomalous.then(|| {
                    format!(
                        "transaction {} amount {:.2} is {:.1}σ from the usual {:.2}",
                        flag.transaction_id, flag.observed, flag.deviation, flag.expected
                    )
                })
            }
            RuleKind::VelocitySpike {
                ratio,
                min_transactions,
            } => {
                let v = snapshot.velocity.as_ref()?;
                if v.recent < *min_transactions || v.expected <= 0.0 {
                    return None;
                }
                let observed = v.ratio();
                (observed >= *ratio).then(|| {
                    format!(
                        "{} transactions in the last {} s, {:.1}x the usual {:.2}",
                        v.recent, v.window_secs, observed, v.expected
                    )
                })
            }
            RuleKind::HourlyFailureSpike {
                sigma,
                min_transactions,
            } => {
                let hourly = snapshot.hourly.as_ref()?;
                let hour = snapshot.timestamp.hour() as usize;
                if hourly.total[hour] < *min_transactions {
                    return None;
                }
                let hours = hourly.anomalous_hours(*sigma);
                if !hours.contains(&hour) {
                    return None;
                }
                let listed: Vec<String> = hours.iter().map(|h| format!("{h:02}:00")).collect();
                Some(format!(
                    "failure rate {:.1}% at {hour:02}:00 is unusually high (anomalous hours: {})",
                    hourly.rate(hour).unwrap_or(0.0) * 100.0,
                    listed.join(", ")
                ))
            }
            RuleKind::FailureSurge {
                factor,
                window_secs,
                min_transactions,
            } => {
                let recent = snapshot.windows.get(window_secs)?;
                let overall = snapshot.overall.as_ref()?;
                if recent.transactions < *min_transactions || overall.failures == 0 {
                    return None;
                }
                let (recent_rate, overall_rate) = (recent.failure_rate(), overall.failure_rate());
                (recent_rate > overall_rate * factor).then(|| {
                    format!(
                        "failure rate {:.2}% over the last {} h is {:.1}% above the branch average {:.2}%",
                        recent_rate * 100.0,
                        window_secs / 3600,
                        (recent_rate - overall_rate) / overall_rate * 100.0,
                        overall_rate * 100.0
                    )
                })
            }
            RuleKind::SharedFailurePattern { min_similarity } => {
                let similar: Vec<String> = snapshot
                    .pattern_matches
                    .iter()
                    .filter(|m| m.similarity > *min_similarity)
                    .map(|m| format!("{} ({:.2})", m.branch, m.similarity))
                    .collect();
                (!similar.is_empty())
                    .then(|| format!("hourly failure pattern matches {}", similar.join(", ")))
            }
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidRule {
            rule: name.to_string(),
            reason: reason.to_string(),
        };
        match self {
            RuleKind::FailureRate {
                threshold,
                window_secs,
                ..
            } => {
                if !(*threshold > 0.0 && *threshold <= 1.0) {
                    return Err(invalid("threshold must be within (0, 1]"));
                }
                crate::config::window("window_secs", *window_secs).map_err(|e| invalid(&e.to_string()))?;
            }
            RuleKind::VelocitySpike { ratio, .. } => {
                if !(ratio.is_finite() && *ratio > 0.0) {
                    return Err(invalid("ratio must be positive"));
                }
            }
            RuleKind::HourlyFailureSpike { sigma, .. } => {
                if !(sigma.is_finite() && *sigma >= 0.0) {
                    return Err(invalid("sigma must be non-negative"));
                }
            }
            RuleKind::FailureSurge {
                factor,
                window_secs,
                ..
            } => {
                if !(factor.is_finite() && *factor > 0.0) {
                    return Err(invalid("factor must be positive"));
                }
                crate::config::window("window_secs", *window_secs).map_err(|e| invalid(&e.to_string()))?;
            }
            RuleKind::SharedFailurePattern { min_similarity } => {
                if !(0.0..1.0).contains(min_similarity) {
                    return Err(invalid("min_similarity must be within [0, 1)"));
                }
            }
            RuleKind::RiskCritical | RuleKind::AnomalyFlagged => {}
        }
        Ok(())
    }
}

/// One row of the rule table. `channels` overrides the severity routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub kind: RuleKind,
    pub severity: Severity,
    #[serde(default)]
    pub channels: Option<Vec<ChannelKind>>,
}

/// Validated set of alert rules.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: Vec<RuleConfig>,
}

impl RuleTable {
    pub fn new(rules: Vec<RuleConfig>) -> Result<Self, ConfigError> {
        let mut names = HashSet::new();
        for rule in &rules {
            if rule.name.trim().is_empty() {
                return Err(ConfigError::InvalidRule {
                    rule: rule.name.clone(),
                    reason: "name is empty".into(),
                });
            }
            if !names.insert(rule.name.as_str()) {
                return Err(ConfigError::DuplicateRule(rule.name.clone()));
            }
            rule.kind.validate(&rule.name)?;
        }
        Ok(Self { rules })
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuleConfig> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.iter().any(|r| r.name == name)
    }

    /// Distinct trailing windows the failure-rate rules need, in seconds.
    pub fn failure_windows(&self) -> Vec<u64> {
        let mut windows: Vec<u64> = self
            .rules
            .iter()
            .filter_map(|r| match r.kind {
                RuleKind::FailureRate { window_secs, .. } | RuleKind::FailureSurge { window_secs, .. } => {
                    Some(window_secs)
                }
                _ => None,
            })
            .collect();
        windows.sort_unstable();
        windows.dedup();
        windows
    }

    pub fn needs_pattern_matches(&self) -> bool {
        self.rules
            .iter()
            .any(|r| matches!(r.kind, RuleKind::SharedFailurePattern { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::VelocitySample;
    use crate::config::default_rules;
    use crate::core::history::WindowStats;
    use crate::core::test_support::at;
    use crate::signature::{HourlyCounts, PatternMatch};
    use std::collections::BTreeMap;

    fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            branch: "North".into(),
            timestamp: at(2025, 1, 1, 12, 0),
            transaction_id: None,
            windows: BTreeMap::new(),
            risk: None,
            anomaly: None,
            velocity: None,
            overall: None,
            hourly: None,
            pattern_matches: Vec::new(),
        }
    }

    fn failure_rule() -> RuleKind {
        RuleKind::FailureRate {
            threshold: 0.05,
            window_secs: 3600,
            min_transactions: 10,
        }
    }

    #[test]
    fn failure_rate_fires_above_threshold() {
        let mut s = snapshot();
        s.windows.insert(3600, WindowStats { transactions: 100, failures: 6 });
        let msg = failure_rule().check(&s).unwrap();
        assert!(msg.contains("6.0%"));

        s.windows.insert(3600, WindowStats { transactions: 100, failures: 5 });
        assert!(failure_rule().check(&s).is_none());
    }

    #[test]
    fn failure_rate_needs_volume() {
        let mut s = snapshot();
        s.windows.insert(3600, WindowStats { transactions: 9, failures: 9 });
        assert!(failure_rule().check(&s).is_none());
    }

    #[test]
    fn failure_rate_ignores_other_windows() {
        let mut s = snapshot();
        s.windows.insert(600, WindowStats { transactions: 100, failures: 50 });
        assert!(failure_rule().check(&s).is_none());
    }

    #[test]
    fn velocity_spike() {
        let rule = RuleKind::VelocitySpike {
            ratio: 5.0,
            min_transactions: 5,
        };
        let mut s = snapshot();
        s.velocity = Some(VelocitySample { window_secs: 300, recent: 10, expected: 2.0 });
        assert!(rule.check(&s).is_some());
        s.velocity = Some(VelocitySample { window_secs: 300, recent: 4, expected: 0.1 });
        assert!(rule.check(&s).is_none());
        s.velocity = Some(VelocitySample { window_secs: 300, recent: 9, expected: 2.0 });
        assert!(rule.check(&s).is_none());
    }

    #[test]
    fn hourly_spike_only_for_the_anomalous_hour() {
        let rule = RuleKind::HourlyFailureSpike {
            sigma: 2.0,
            min_transactions: 10,
        };
        let mut hourly = HourlyCounts {
            total: [0; 24],
            failures: [0; 24],
        };
        for h in 0..24 {
            hourly.total[h] = 40;
            hourly.failures[h] = 1;
        }
        hourly.failures[12] = 20;
        let mut s = snapshot();
        s.hourly = Some(hourly);
        let msg = rule.check(&s).unwrap();
        assert!(msg.contains("50.0% at 12:00"), "{msg}");

        s.timestamp = at(2025, 1, 1, 13, 0);
        assert!(rule.check(&s).is_none());

        hourly.total[12] = 9;
        hourly.failures[12] = 9;
        s.timestamp = at(2025, 1, 1, 12, 0);
        s.hourly = Some(hourly);
        assert!(rule.check(&s).is_none());
    }

    #[test]
    fn failure_surge_against_overall_rate() {
        let rule = RuleKind::FailureSurge {
            factor: 1.2,
            window_secs: 604_800,
            min_transactions: 20,
        };
        let mut s = snapshot();
        s.overall = Some(WindowStats { transactions: 1000, failures: 50 });
        s.windows.insert(604_800, WindowStats { transactions: 200, failures: 13 });
        let msg = rule.check(&s).unwrap();
        assert!(msg.contains("6.50%"), "{msg}");
        assert!(msg.contains("30.0% above"), "{msg}");

        s.windows.insert(604_800, WindowStats { transactions: 200, failures: 12 });
        assert!(rule.check(&s).is_none());

        s.overall = Some(WindowStats { transactions: 1000, failures: 0 });
        assert!(rule.check(&s).is_none());
    }

    #[test]
    fn shared_pattern_respects_similarity() {
        let rule = RuleKind::SharedFailurePattern { min_similarity: 0.7 };
        let mut s = snapshot();
        assert!(rule.check(&s).is_none());
        s.pattern_matches = vec![
            PatternMatch { branch: "South".into(), similarity: 0.93 },
            PatternMatch { branch: "East".into(), similarity: 0.7 },
        ];
        let msg = rule.check(&s).unwrap();
        assert_eq!(msg, "hourly failure pattern matches South (0.93)");
    }

    #[test]
    fn oversized_rule_window_rejected() {
        let rules = vec![RuleConfig {
            name: "forever".into(),
            kind: RuleKind::FailureSurge {
                factor: 1.2,
                window_secs: u64::MAX,
                min_transactions: 1,
            },
            severity: Severity::Warning,
            channels: None,
        }];
        assert!(matches!(
            RuleTable::new(rules),
            Err(ConfigError::InvalidRule { .. })
        ));
    }

    #[test]
    fn default_table_is_valid() {
        let table = RuleTable::new(default_rules()).unwrap();
        assert_eq!(table.len(), 7);
        assert_eq!(table.failure_windows(), vec![3600, 604_800]);
        assert!(table.needs_pattern_matches());
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut rules = default_rules();
        rules.push(rules[0].clone());
        assert_eq!(
            RuleTable::new(rules).unwrap_err(),
            ConfigError::DuplicateRule("failure-rate".into())
        );
    }

    #[test]
    fn bad_threshold_rejected() {
        let rules = vec![RuleConfig {
            name: "bad".into(),
            kind: RuleKind::FailureRate {
                threshold: 1.5,
                window_secs: 3600,
                min_transactions: 1,
            },
            severity: Severity::Warning,
            channels: None,
        }];
        assert!(matches!(
            RuleTable::new(rules),
            Err(ConfigError::InvalidRule { .. })
        ));
    }

    #[test]
    fn severity_order() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert_eq!(Severity::Critical.emoji(), "🚨");
    }
}
