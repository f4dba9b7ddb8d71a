pub mod channels;
pub mod dispatch;
pub mod rules;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::{AlertConfig, SeverityRouting};
use crate::core::RiskScore;
use crate::core::history::WindowStats;
use crate::error::ConfigError;
use crate::signature::{AnomalyFlag, HourlyCounts, PatternMatch};
use rules::{ChannelKind, RuleConfig, RuleTable, Severity};

/// Recent volume against the branch's usual volume for the same window length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocitySample {
    pub window_secs: u64,
    pub recent: u64,
    pub expected: f64,
}

impl VelocitySample {
    pub fn ratio(&self) -> f64 {
        if self.expected <= 0.0 {
            0.0
        } else {
            self.recent as f64 / self.expected
        }
    }
}

/// Everything the rules look at for one branch at one moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub branch: String,
    /// Event time. Dedup windows are measured against this, not the wall clock.
    pub timestamp: DateTime<Utc>,
    pub transaction_id: Option<String>,
    /// Trailing window length in seconds -> counts.
    pub windows: BTreeMap<u64, WindowStats>,
    pub risk: Option<RiskScore>,
    pub anomaly: Option<AnomalyFlag>,
    pub velocity: Option<VelocitySample>,
    /// Counts over the branch's whole held history.
    pub overall: Option<WindowStats>,
    /// Hour-of-day counts from the branch signature.
    pub hourly: Option<HourlyCounts>,
    #[serde(default)]
    pub pattern_matches: Vec<PatternMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: String,
    pub branch: String,
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub metrics: serde_json::Value,
    pub channels: Vec<ChannelKind>,
    pub created_at: DateTime<Utc>,
}

/// Marker and upper-cased severity in front of the text, e.g. `🚨 CRITICAL: ...`.
pub fn format_message(severity: Severity, branch: &str, detail: &str) -> String {
    format!(
        "{} {}: [{branch}] {detail}",
        severity.emoji(),
        severity.as_str().to_uppercase()
    )
}

/// A (branch, rule) pair that alerted at `pending_since`. Further violations
/// before the window closes are absorbed.
#[derive(Debug, Clone, Copy)]
struct DedupState {
    pending_since: DateTime<Utc>,
    absorbed: u64,
}

/// Evaluates rules against snapshots and emits deduplicated alert events.
pub struct AlertEngine {
    enabled: bool,
    window: Duration,
    routing: SeverityRouting,
    registered: Vec<ChannelKind>,
    table: RwLock<Arc<RuleTable>>,
    state: DashMap<(String, String), DedupState>,
    seq: AtomicU64,
}

impl AlertEngine {
    /// `registered` is the set of channels that can actually deliver.
    pub fn new(config: &AlertConfig, registered: Vec<ChannelKind>) -> Result<Self, ConfigError> {
        let table = RuleTable::new(config.rules.clone())?;
        Ok(Self {
            enabled: config.enabled,
            window: config.dedup_window()?,
            routing: config.routing.clone(),
            registered,
            table: RwLock::new(Arc::new(table)),
            state: DashMap::new(),
            seq: AtomicU64::new(0),
        })
    }

    pub fn rules(&self) -> Arc<RuleTable> {
        self.table.read().clone()
    }

    /// Validate and swap in a new rule table. On error the old table stays.
    pub fn reconfigure(&self, rules: Vec<RuleConfig>) -> Result<(), ConfigError> {
        let table = RuleTable::new(rules)?;
        self.state.retain(|(_, rule), _| table.contains(rule));
        let count = table.len();
        *self.table.write() = Arc::new(table);
        tracing::info!(rules = count, "Alert rules reconfigured");
        Ok(())
    }

    /// Forget all dedup state.
    pub fn reset(&self) {
        self.state.clear();
    }

    /// Forget dedup state for one branch.
    pub fn reset_branch(&self, branch: &str) {
        self.state.retain(|(b, _), _| b != branch);
    }

    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Vec<AlertEvent> {
        if !self.enabled {
            return Vec::new();
        }
        let table = self.rules();
        let mut events = Vec::new();
        for rule in table.iter() {
            let Some(detail) = rule.kind.check(snapshot) else {
                continue;
            };
            if !self.open_window(&snapshot.branch, &rule.name, snapshot.timestamp) {
                continue;
            }
            let message = format_message(rule.severity, &snapshot.branch, &detail);
            tracing::info!(
                branch = %snapshot.branch,
                rule = %rule.name,
                severity = rule.severity.as_str(),
                "{message}"
            );
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            events.push(AlertEvent {
                id: format!(
                    "{}:{}:{}:{seq}",
                    snapshot.branch,
                    rule.name,
                    snapshot.timestamp.timestamp_millis()
                ),
                branch: snapshot.branch.clone(),
                rule: rule.name.clone(),
                severity: rule.severity,
                message,
                metrics: serde_json::to_value(snapshot).unwrap_or_default(),
                channels: self.channels_for(rule),
                created_at: snapshot.timestamp,
            });
        }
        events
    }

    /// True if this violation starts a new window and should alert.
    fn open_window(&self, branch: &str, rule: &str, at: DateTime<Utc>) -> bool {
        match self.state.entry((branch.to_string(), rule.to_string())) {
            Entry::Vacant(e) => {
                e.insert(DedupState {
                    pending_since: at,
                    absorbed: 0,
                });
                true
            }
            Entry::Occupied(mut e) => {
                let state = e.get_mut();
                if at >= state.pending_since + self.window {
                    if state.absorbed > 0 {
                        tracing::debug!(
                            branch,
                            rule,
                            absorbed = state.absorbed,
                            "Dedup window closed"
                        );
                    }
                    *state = DedupState {
                        pending_since: at,
                        absorbed: 0,
                    };
                    true
                } else {
                    // Inside the window, or late for one already opened.
                    state.absorbed += 1;
                    false
                }
            }
        }
    }

    fn channels_for(&self, rule: &RuleConfig) -> Vec<ChannelKind> {
        if let Some(explicit) = &rule.channels {
            return explicit.clone();
        }
        let wanted: &[ChannelKind] = match rule.severity {
            Severity::Critical => return self.registered.clone(),
            Severity::Warning => &self.routing.warning,
            Severity::Info => &self.routing.info,
        };
        wanted
            .iter()
            .copied()
            .filter(|c| self.registered.contains(c))
            .collect()
    }
}
