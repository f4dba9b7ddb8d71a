use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::TransactionRecord;
use crate::config::HistoryConfig;
use crate::error::ConfigError;
use crate::signature::FailurePatterns;

/// Network-wide aggregates across every branch window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub transactions: u64,
    pub failures: u64,
    pub hourly_total: [u64; 24],
    pub hourly_failures: [u64; 24],
}

impl NetworkStats {
    pub fn failure_rate(&self) -> Option<f64> {
        if self.transactions == 0 {
            None
        } else {
            Some(self.failures as f64 / self.transactions as f64)
        }
    }

    pub fn hourly_failure_rate(&self, hour: usize) -> Option<f64> {
        let total = self.hourly_total[hour];
        if total == 0 {
            None
        } else {
            Some(self.hourly_failures[hour] as f64 / total as f64)
        }
    }

    fn absorb(&mut self, window: &BranchWindow) {
        self.transactions += window.records.len() as u64;
        self.failures += window.failures;
        for h in 0..24 {
            self.hourly_total[h] += window.hourly_total[h];
            self.hourly_failures[h] += window.hourly_failures[h];
        }
    }
}

/// Read-only view of one branch's recent activity, handed to the scorer.
#[derive(Debug, Clone, Default)]
pub struct BranchHistory {
    pub branch: String,
    /// Sorted by timestamp, oldest first.
    pub records: Vec<TransactionRecord>,
    pub network: NetworkStats,
    pub failure_patterns: FailurePatterns,
}

impl BranchHistory {
    pub fn new(branch: impl Into<String>, mut records: Vec<TransactionRecord>, network: NetworkStats) -> Self {
        records.sort_by_key(|r| r.timestamp);
        Self {
            branch: branch.into(),
            records,
            network,
            failure_patterns: FailurePatterns::default(),
        }
    }

    pub fn with_failure_patterns(mut self, patterns: FailurePatterns) -> Self {
        self.failure_patterns = patterns;
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn failures(&self) -> usize {
        self.records.iter().filter(|r| r.is_failed()).count()
    }

    pub fn failure_rate(&self) -> Option<f64> {
        if self.records.is_empty() {
            None
        } else {
            Some(self.failures() as f64 / self.records.len() as f64)
        }
    }

    /// Failure rate per hour-of-day; `None` for hours with no transactions.
    pub fn hourly_failure_rates(&self) -> [Option<f64>; 24] {
        let mut total = [0u64; 24];
        let mut failed = [0u64; 24];
        for r in &self.records {
            let h = r.hour() as usize;
            total[h] += 1;
            if r.is_failed() {
                failed[h] += 1;
            }
        }
        let mut rates = [None; 24];
        for h in 0..24 {
            if total[h] > 0 {
                rates[h] = Some(failed[h] as f64 / total[h] as f64);
            }
        }
        rates
    }

    /// Fraction of recorded amounts that are ≤ `amount`.
    pub fn amount_rank(&self, amount: f64) -> Option<f64> {
        if self.records.is_empty() {
            return None;
        }
        let below = self.records.iter().filter(|r| r.amount <= amount).count();
        Some(below as f64 / self.records.len() as f64)
    }

    /// Transactions with timestamps in `[at - window, at]`.
    pub fn count_within(&self, at: DateTime<Utc>, window: Duration) -> usize {
        let from = at - window;
        self.records
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= at)
            .count()
    }

    /// Typical number of records per `window` over the held span.
    pub fn expected_within(&self, window: Duration) -> f64 {
        let window_secs = window.num_seconds().max(1) as f64;
        let span_secs = self.span().num_seconds().max(0) as f64;
        self.len() as f64 * window_secs / span_secs.max(window_secs)
    }

    /// Time between the oldest and newest record.
    pub fn span(&self) -> Duration {
        match (self.records.first(), self.records.last()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => Duration::zero(),
        }
    }
}

/// Transaction and failure counts for a trailing window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub transactions: u64,
    pub failures: u64,
}

impl WindowStats {
    pub fn failure_rate(&self) -> f64 {
        if self.transactions == 0 {
            0.0
        } else {
            self.failures as f64 / self.transactions as f64
        }
    }
}

/// Totals over everything currently held, mirroring the dashboard headline numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyMetrics {
    pub total_transactions: u64,
    pub failed_transactions: u64,
    pub failure_rate: f64, // percent
    pub total_amount: f64,
    pub failed_amount: f64,
    pub total_tax: f64,
    pub unique_branches: usize,
    pub unique_malls: usize,
}

#[derive(Debug, Default)]
struct BranchWindow {
    records: VecDeque<TransactionRecord>,
    failures: u64,
    hourly_total: [u64; 24],
    hourly_failures: [u64; 24],
}

impl BranchWindow {
    fn insert(&mut self, tx: TransactionRecord) {
        let h = tx.hour() as usize;
        self.hourly_total[h] += 1;
        if tx.is_failed() {
            self.failures += 1;
            self.hourly_failures[h] += 1;
        }
        // Late arrivals land in timestamp order.
        let pos = self.records.partition_point(|r| r.timestamp <= tx.timestamp);
        self.records.insert(pos, tx);
    }

    fn evict_front(&mut self) {
        if let Some(old) = self.records.pop_front() {
            let h = old.hour() as usize;
            self.hourly_total[h] -= 1;
            if old.is_failed() {
                self.failures -= 1;
                self.hourly_failures[h] -= 1;
            }
        }
    }

    fn prune(&mut self, max_records: usize, max_age: Duration) {
        while self.records.len() > max_records {
            self.evict_front();
        }
        let Some(newest) = self.records.back().map(|r| r.timestamp) else {
            return;
        };
        let cutoff = newest - max_age;
        while self.records.front().is_some_and(|r| r.timestamp < cutoff) {
            self.evict_front();
        }
    }
}

/// Bounded sliding window of recent transactions per branch.
pub struct HistoryStore {
    windows: DashMap<String, BranchWindow>,
    max_records: usize,
    max_age: Duration,
}

impl HistoryStore {
    pub fn new(config: &HistoryConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            windows: DashMap::new(),
            max_records: config.max_records.max(1),
            max_age: config.max_age()?,
        })
    }

    pub fn record(&self, tx: TransactionRecord) {
        let mut window = self.windows.entry(tx.branch.clone()).or_default();
        window.insert(tx);
        window.prune(self.max_records, self.max_age);
    }

    pub fn network_stats(&self) -> NetworkStats {
        let mut stats = NetworkStats::default();
        for window in self.windows.iter() {
            stats.absorb(window.value());
        }
        stats
    }

    /// Copy of the branch window plus current network aggregates.
    pub fn snapshot(&self, branch: &str) -> BranchHistory {
        let network = self.network_stats();
        let records = self
            .windows
            .get(branch)
            .map(|w| w.records.iter().cloned().collect())
            .unwrap_or_default();
        BranchHistory {
            branch: branch.to_string(),
            records,
            network,
            failure_patterns: FailurePatterns::default(),
        }
    }

    /// Counts in `[at - window, at]` for one branch, read in place.
    pub fn window_stats(&self, branch: &str, at: DateTime<Utc>, window: Duration) -> WindowStats {
        let Some(w) = self.windows.get(branch) else {
            return WindowStats::default();
        };
        let from = at - window;
        let mut stats = WindowStats::default();
        for r in w.records.iter().filter(|r| r.timestamp >= from && r.timestamp <= at) {
            stats.transactions += 1;
            if r.is_failed() {
                stats.failures += 1;
            }
        }
        stats
    }

    pub fn branch_len(&self, branch: &str) -> usize {
        self.windows.get(branch).map(|w| w.records.len()).unwrap_or(0)
    }

    pub fn key_metrics(&self) -> KeyMetrics {
        let mut m = KeyMetrics::default();
        let mut malls = HashSet::new();
        for window in self.windows.iter() {
            m.unique_branches += 1;
            for r in &window.records {
                m.total_transactions += 1;
                m.total_amount += r.amount;
                m.total_tax += r.tax_amount;
                if r.is_failed() {
                    m.failed_transactions += 1;
                    m.failed_amount += r.amount;
                }
                malls.insert(r.mall.clone());
            }
        }
        m.unique_malls = malls.len();
        if m.total_transactions > 0 {
            m.failure_rate = m.failed_transactions as f64 / m.total_transactions as f64 * 100.0;
        }
        m
    }

    /// Drop one branch window. Returns whether it existed.
    pub fn remove(&self, branch: &str) -> bool {
        self.windows.remove(branch).is_some()
    }

    /// Drop every window.
    pub fn clear(&self) {
        self.windows.clear();
    }
}
