use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::RoutingConfig;
use crate::core::{RiskLabel, RiskScore, TransactionRecord};
use crate::signature::BranchSignature;

/// Hours failing less often than this are good hours to route through.
const OPTIMAL_HOUR_RATE: f64 = 0.05;

/// Health of one payment gateway as reported by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub id: String,
    pub healthy: bool,
}

impl GatewayStatus {
    pub fn new(id: impl Into<String>, healthy: bool) -> Self {
        Self {
            id: id.into(),
            healthy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteReason {
    Normal,
    HighRiskFailover,
    NoHealthyBackup,
    UnscoredManualReview,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::HighRiskFailover => "high-risk-failover",
            Self::NoHealthyBackup => "no-healthy-backup",
            Self::UnscoredManualReview => "unscored-manual-review",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub transaction_id: String,
    pub gateway: String,
    pub reason: RouteReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BranchStatus {
    Normal,
    MonitorClosely,
    RerouteRequired,
}

impl BranchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::MonitorClosely => "monitor-closely",
            Self::RerouteRequired => "reroute-required",
        }
    }
}

/// Standing routing advice for one branch, from its observed failure rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchAdvice {
    pub branch: String,
    pub status: BranchStatus,
    pub failure_rate: f64,
    /// Primary unless a reroute is required and a healthy backup exists.
    pub gateway: Option<String>,
    /// Hours failing more often than the reroute rate.
    pub risk_hours: Vec<usize>,
    pub optimal_hours: Vec<usize>,
}

/// Picks a gateway from a risk score. Holds no gateway state.
#[derive(Debug, Clone, Copy)]
pub struct Router {
    switch_threshold: f64,
    monitor_rate: f64,
    reroute_rate: f64,
}

impl Router {
    pub fn new(switch_threshold: f64) -> Self {
        let defaults = RoutingConfig::default();
        Self {
            switch_threshold,
            monitor_rate: defaults.monitor_rate,
            reroute_rate: defaults.reroute_rate,
        }
    }

    pub fn from_config(config: &RoutingConfig) -> Self {
        Self {
            switch_threshold: config.switch_threshold,
            monitor_rate: config.monitor_rate,
            reroute_rate: config.reroute_rate,
        }
    }

    pub fn status_for(&self, failure_rate: f64) -> BranchStatus {
        if failure_rate > self.reroute_rate {
            BranchStatus::RerouteRequired
        } else if failure_rate > self.monitor_rate {
            BranchStatus::MonitorClosely
        } else {
            BranchStatus::Normal
        }
    }

    /// Branch-level advice from its signature and the current gateway health.
    pub fn advise(&self, signature: &BranchSignature, gateways: &[GatewayStatus]) -> BranchAdvice {
        let failure_rate = signature.failure_rate().unwrap_or(0.0);
        let status = self.status_for(failure_rate);
        let gateway = match gateways.split_first() {
            Some((primary, backups)) if status == BranchStatus::RerouteRequired => {
                Some(backups.iter().find(|g| g.healthy).unwrap_or(primary).id.clone())
            }
            Some((primary, _)) => Some(primary.id.clone()),
            None => None,
        };
        let counts = signature.hourly_counts();
        let rated: Vec<(usize, f64)> = (0..24).filter_map(|h| Some((h, counts.rate(h)?))).collect();
        BranchAdvice {
            branch: signature.branch.clone(),
            status,
            failure_rate,
            gateway,
            risk_hours: rated
                .iter()
                .filter(|(_, r)| *r > self.reroute_rate)
                .map(|(h, _)| *h)
                .collect(),
            optimal_hours: rated
                .iter()
                .filter(|(_, r)| *r < OPTIMAL_HOUR_RATE)
                .map(|(h, _)| *h)
                .collect(),
        }
    }

    /// `gateways` is ordered `[primary, backup_1, ...]`. Returns `None` only
    /// for an empty list.
    pub fn route(
        &self,
        tx: &TransactionRecord,
        score: &RiskScore,
        gateways: &[GatewayStatus],
    ) -> Option<RoutingDecision> {
        let (primary, backups) = gateways.split_first()?;
        let risky = score.label >= RiskLabel::High && score.value >= self.switch_threshold;

        if !risky {
            return Some(decision(tx, primary, RouteReason::Normal));
        }

        match backups.iter().find(|g| g.healthy) {
            Some(backup) => {
                tracing::info!(
                    id = %tx.id,
                    branch = %tx.branch,
                    score = score.value,
                    gateway = %backup.id,
                    "High-risk transaction switched to backup gateway"
                );
                Some(decision(tx, backup, RouteReason::HighRiskFailover))
            }
            None => {
                tracing::warn!(
                    id = %tx.id,
                    branch = %tx.branch,
                    score = score.value,
                    "No healthy backup gateway, staying on primary"
                );
                Some(decision(tx, primary, RouteReason::NoHealthyBackup))
            }
        }
    }

    /// Route a transaction the scorer rejected. Always primary, flagged for review.
    pub fn route_unscored(
        &self,
        tx: &TransactionRecord,
        gateways: &[GatewayStatus],
    ) -> Option<RoutingDecision> {
        let primary = gateways.first()?;
        Some(decision(tx, primary, RouteReason::UnscoredManualReview))
    }
}

fn decision(tx: &TransactionRecord, gateway: &GatewayStatus, reason: RouteReason) -> RoutingDecision {
    RoutingDecision {
        transaction_id: tx.id.clone(),
        gateway: gateway.id.clone(),
        reason,
    }
}

/// Latest gateway health, written by health checks and operator commands and read per transaction.
#[derive(Debug, Default)]
pub struct HealthBoard {
    gateways: RwLock<Vec<GatewayStatus>>,
}

impl HealthBoard {
    pub fn from_config(config: &RoutingConfig) -> Self {
        Self {
            gateways: RwLock::new(
                config
                    .gateways
                    .iter()
                    .map(|g| GatewayStatus::new(g.id.clone(), g.healthy))
                    .collect(),
            ),
        }
    }

    /// Mark a gateway healthy or not. Returns false for an unknown id.
    pub fn set_health(&self, id: &str, healthy: bool) -> bool {
        let mut gateways = self.gateways.write();
        match gateways.iter_mut().find(|g| g.id == id) {
            Some(g) => {
                if g.healthy != healthy {
                    tracing::info!(gateway = id, healthy, "Gateway health changed");
                }
                g.healthy = healthy;
                true
            }
            None => false,
        }
    }

    pub fn current(&self) -> Vec<GatewayStatus> {
        self.gateways.read().clone()
    }
}
