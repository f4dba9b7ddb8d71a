use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::TransactionRecord;

/// Online mean/variance (Welford). O(1) per observation, no stored amounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    pub count: u64,
    pub mean: f64,
    m2: f64,
    pub min: f64,
    pub max: f64,
}

impl RunningStats {
    pub fn push(&mut self, x: f64) {
        if self.count == 0 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64).max(0.0)
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// An (hour-of-day, amount bucket) cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternKey {
    pub hour: u8,
    pub amount_bucket: u32,
}

impl PatternKey {
    pub fn of(tx: &TransactionRecord, bucket_width: f64) -> Self {
        Self {
            hour: tx.hour() as u8,
            amount_bucket: amount_bucket(tx.amount, bucket_width),
        }
    }
}

fn amount_bucket(amount: f64, width: f64) -> u32 {
    // f64 -> u32 casts saturate
    (amount / width).floor() as u32
}

/// Cells where a branch has failed often enough to count as a known failure signature.
#[derive(Debug, Clone, PartialEq)]
pub struct FailurePatterns {
    pub bucket_width: f64,
    pub keys: HashSet<PatternKey>,
}

impl Default for FailurePatterns {
    fn default() -> Self {
        Self {
            bucket_width: 50.0,
            keys: HashSet::new(),
        }
    }
}

impl FailurePatterns {
    pub fn matches(&self, tx: &TransactionRecord) -> bool {
        !self.keys.is_empty() && self.keys.contains(&PatternKey::of(tx, self.bucket_width))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Per hour-of-day transaction and failure counts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HourlyCounts {
    pub total: [u64; 24],
    pub failures: [u64; 24],
}

impl HourlyCounts {
    pub fn rate(&self, hour: usize) -> Option<f64> {
        let total = *self.total.get(hour)?;
        if total == 0 {
            None
        } else {
            Some(self.failures[hour] as f64 / total as f64)
        }
    }

    /// Hours whose failure rate exceeds `mean + sigma * std` over the hours that
    /// saw traffic (sample std). Empty with fewer than two such hours or when
    /// every rate is equal.
    pub fn anomalous_hours(&self, sigma: f64) -> Vec<usize> {
        let rates: Vec<(usize, f64)> = (0..24).filter_map(|h| Some((h, self.rate(h)?))).collect();
        if rates.len() < 2 {
            return Vec::new();
        }
        let n = rates.len() as f64;
        let mean = rates.iter().map(|(_, r)| r).sum::<f64>() / n;
        let var = rates.iter().map(|(_, r)| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std = var.sqrt();
        if std <= 0.0 {
            return Vec::new();
        }
        let cut = mean + sigma * std;
        rates
            .into_iter()
            .filter(|(_, r)| *r > cut)
            .map(|(h, _)| h)
            .collect()
    }
}

/// Cosine similarity of two hourly failure-rate profiles. Zero when either
/// profile has no failures.
pub fn profile_similarity(a: &[f64; 24], b: &[f64; 24]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        (dot / (na * nb)).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileMarkers {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Behavioral fingerprint of one branch. Never mutated after publication:
/// `observed` returns the next version.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchSignature {
    pub branch: String,
    /// Transactions per hour-of-day; sums to `amounts.count`.
    pub hourly_total: [u64; 24],
    pub hourly_failures: [u64; 24],
    /// Transactions per day of week, Monday first.
    pub daily_total: [u64; 7],
    pub daily_failures: [u64; 7],
    pub amounts: RunningStats,
    amount_buckets: BTreeMap<u32, u64>,
    failure_cells: HashMap<PatternKey, u32>,
    /// Failures per hour, exponentially weighted.
    pub failure_velocity: f64,
    pub last_failure_at: Option<DateTime<Utc>>,
    bucket_width: f64,
}

impl BranchSignature {
    pub fn new(branch: impl Into<String>, bucket_width: f64) -> Self {
        Self {
            branch: branch.into(),
            hourly_total: [0; 24],
            hourly_failures: [0; 24],
            daily_total: [0; 7],
            daily_failures: [0; 7],
            amounts: RunningStats::default(),
            amount_buckets: BTreeMap::new(),
            failure_cells: HashMap::new(),
            failure_velocity: 0.0,
            last_failure_at: None,
            bucket_width,
        }
    }

    pub fn observations(&self) -> u64 {
        self.amounts.count
    }

    pub fn mean(&self) -> f64 {
        self.amounts.mean
    }

    pub fn std_dev(&self) -> f64 {
        self.amounts.std_dev()
    }

    /// Copy of this signature with `tx` folded in.
    pub fn observed(&self, tx: &TransactionRecord, velocity_alpha: f64) -> Self {
        let mut next = self.clone();
        next.apply(tx, velocity_alpha);
        next
    }

    fn apply(&mut self, tx: &TransactionRecord, velocity_alpha: f64) {
        let hour = tx.hour() as usize;
        let day = tx.weekday() as usize;
        self.hourly_total[hour] += 1;
        self.daily_total[day] += 1;
        self.amounts.push(tx.amount);
        *self
            .amount_buckets
            .entry(amount_bucket(tx.amount, self.bucket_width))
            .or_insert(0) += 1;

        if !tx.is_failed() {
            return;
        }
        self.hourly_failures[hour] += 1;
        self.daily_failures[day] += 1;
        *self
            .failure_cells
            .entry(PatternKey::of(tx, self.bucket_width))
            .or_insert(0) += 1;

        match self.last_failure_at {
            Some(last) => {
                // Floor at one minute so bursts and late arrivals stay finite.
                let hours = ((tx.timestamp - last).num_seconds().abs() as f64 / 3600.0).max(1.0 / 60.0);
                let instantaneous = 1.0 / hours;
                self.failure_velocity =
                    velocity_alpha * instantaneous + (1.0 - velocity_alpha) * self.failure_velocity;
                self.last_failure_at = Some(last.max(tx.timestamp));
            }
            None => self.last_failure_at = Some(tx.timestamp),
        }
    }

    /// Estimate of the `p` quantile from the bucket histogram: upper edge of the
    /// bucket where the cumulative count first reaches `p * n`, capped at the max.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.amounts.count == 0 {
            return None;
        }
        let target = (p.clamp(0.0, 1.0) * self.amounts.count as f64).ceil().max(1.0) as u64;
        let mut cumulative = 0;
        for (&bucket, &count) in &self.amount_buckets {
            cumulative += count;
            if cumulative >= target {
                let upper = (bucket as f64 + 1.0) * self.bucket_width;
                return Some(upper.min(self.amounts.max));
            }
        }
        Some(self.amounts.max)
    }

    pub fn percentile_markers(&self) -> Option<PercentileMarkers> {
        Some(PercentileMarkers {
            p50: self.percentile(0.50)?,
            p95: self.percentile(0.95)?,
            p99: self.percentile(0.99)?,
        })
    }

    pub fn hourly_counts(&self) -> HourlyCounts {
        HourlyCounts {
            total: self.hourly_total,
            failures: self.hourly_failures,
        }
    }

    /// Failure rate per hour, 0 for hours without traffic.
    pub fn hourly_profile(&self) -> [f64; 24] {
        let counts = self.hourly_counts();
        std::array::from_fn(|h| counts.rate(h).unwrap_or(0.0))
    }

    pub fn failures(&self) -> u64 {
        self.hourly_failures.iter().sum()
    }

    pub fn failure_rate(&self) -> Option<f64> {
        (self.amounts.count > 0).then(|| self.failures() as f64 / self.amounts.count as f64)
    }

    /// Mean of the daily failure rates over (weekdays, weekend), skipping days
    /// without traffic.
    pub fn weekday_weekend_rates(&self) -> (Option<f64>, Option<f64>) {
        let mean_of = |days: std::ops::Range<usize>| {
            let rates: Vec<f64> = days
                .filter(|&d| self.daily_total[d] > 0)
                .map(|d| self.daily_failures[d] as f64 / self.daily_total[d] as f64)
                .collect();
            (!rates.is_empty()).then(|| rates.iter().sum::<f64>() / rates.len() as f64)
        };
        (mean_of(0..5), mean_of(5..7))
    }

    pub fn failure_patterns(&self, min_failures: u32) -> FailurePatterns {
        FailurePatterns {
            bucket_width: self.bucket_width,
            keys: self
                .failure_cells
                .iter()
                .filter(|(_, count)| **count >= min_failures)
                .map(|(key, _)| *key)
                .collect(),
        }
    }
}
