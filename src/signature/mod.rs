pub mod dna;

pub use dna::{BranchSignature, FailurePatterns, HourlyCounts, PercentileMarkers};

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::SignatureConfig;
use crate::core::TransactionRecord;

/// Result of comparing a transaction amount against its branch signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFlag {
    pub branch: String,
    pub transaction_id: String,
    pub observed: f64,
    pub expected: f64,
    /// Half-width of the accepted band: `threshold * std`.
    pub band: f64,
    /// |observed - expected| in standard deviations. Infinite when std is zero
    /// and the amount differs.
    pub deviation: f64,
    pub samples: u64,
    pub anomalous: bool,
}

/// Another branch whose hourly failure profile resembles this one's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub branch: String,
    pub similarity: f64,
}

/// Recently seen transaction ids, capped FIFO.
#[derive(Debug)]
struct SeenIds {
    order: VecDeque<String>,
    set: HashSet<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if the id was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        self.order.push_back(id.to_string());
        self.set.insert(id.to_string());
        true
    }
}

/// Writer-side state of a slot. `retired` is set under the lock when the slot
/// leaves the map, so a writer that fetched it earlier retries on the new one.
struct SlotWriter {
    seen: SeenIds,
    retired: bool,
}

/// One branch: writers serialize on `writer`, readers clone the current `Arc`.
struct BranchSlot {
    writer: Mutex<SlotWriter>,
    current: RwLock<Arc<BranchSignature>>,
}

/// Owned store of per-branch signatures. Starts empty; cleared only by `reset*`.
pub struct SignatureStore {
    slots: DashMap<String, Arc<BranchSlot>>,
    config: SignatureConfig,
}

impl SignatureStore {
    pub fn new(config: SignatureConfig) -> Self {
        Self {
            slots: DashMap::new(),
            config,
        }
    }

    fn slot(&self, branch: &str) -> Arc<BranchSlot> {
        if let Some(slot) = self.slots.get(branch) {
            return Arc::clone(slot.value());
        }
        let slot = self.slots.entry(branch.to_string()).or_insert_with(|| {
            Arc::new(BranchSlot {
                writer: Mutex::new(SlotWriter {
                    seen: SeenIds::new(self.config.seen_id_capacity),
                    retired: false,
                }),
                current: RwLock::new(Arc::new(BranchSignature::new(
                    branch,
                    self.config.amount_bucket_width,
                ))),
            })
        });
        Arc::clone(slot.value())
    }

    /// Fold a transaction into its branch signature. Returns false for a
    /// duplicate id, which leaves the signature unchanged.
    pub fn observe(&self, tx: &TransactionRecord) -> bool {
        loop {
            let slot = self.slot(&tx.branch);
            if let Some(fresh) = self.observe_in(&slot, tx) {
                return fresh;
            }
        }
    }

    /// `None` if the slot was retired by a reset before the lock was taken.
    fn observe_in(&self, slot: &BranchSlot, tx: &TransactionRecord) -> Option<bool> {
        let mut writer = slot.writer.lock();
        if writer.retired {
            return None;
        }
        if !writer.seen.insert(&tx.id) {
            tracing::debug!(id = %tx.id, branch = %tx.branch, "Duplicate transaction ignored");
            return Some(false);
        }
        let next = slot.current.read().observed(tx, self.config.velocity_alpha);
        *slot.current.write() = Arc::new(next);
        Some(true)
    }

    /// Consistent view of a branch signature, if the branch has been seen.
    pub fn snapshot(&self, branch: &str) -> Option<Arc<BranchSignature>> {
        let slot = Arc::clone(self.slots.get(branch)?.value());
        let current = slot.current.read().clone();
        Some(current)
    }

    /// Evaluate `tx.amount` against `signature`. Read-only.
    pub fn compare(&self, tx: &TransactionRecord, signature: &BranchSignature) -> AnomalyFlag {
        compare(
            tx,
            signature,
            self.config.deviation_threshold,
            self.config.min_samples,
        )
    }

    /// Compare against the branch's current signature (empty if never seen).
    pub fn compare_current(&self, tx: &TransactionRecord) -> AnomalyFlag {
        match self.snapshot(&tx.branch) {
            Some(sig) => self.compare(tx, &sig),
            None => self.compare(
                tx,
                &BranchSignature::new(&tx.branch, self.config.amount_bucket_width),
            ),
        }
    }

    pub fn failure_patterns(&self, branch: &str) -> FailurePatterns {
        match self.snapshot(branch) {
            Some(sig) => sig.failure_patterns(self.config.pattern_min_failures),
            None => FailurePatterns {
                bucket_width: self.config.amount_bucket_width,
                keys: HashSet::new(),
            },
        }
    }

    /// Branches seen so far, sorted.
    pub fn branches(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Other branches whose hourly failure profile is similar to `branch`'s,
    /// most similar first. Both sides need `min_samples` observations.
    pub fn match_pattern(&self, branch: &str) -> Vec<PatternMatch> {
        let Some(own) = self.snapshot(branch) else {
            return Vec::new();
        };
        if own.observations() < self.config.min_samples || own.failures() == 0 {
            return Vec::new();
        }
        let profile = own.hourly_profile();
        let others: Vec<Arc<BranchSlot>> = self
            .slots
            .iter()
            .filter(|e| e.key() != branch)
            .map(|e| Arc::clone(e.value()))
            .collect();
        let mut matches: Vec<PatternMatch> = others
            .iter()
            .map(|slot| slot.current.read().clone())
            .filter(|sig| sig.observations() >= self.config.min_samples)
            .filter_map(|sig| {
                let similarity = dna::profile_similarity(&profile, &sig.hourly_profile());
                (similarity > 0.0).then(|| PatternMatch {
                    branch: sig.branch.clone(),
                    similarity,
                })
            })
            .collect();
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity).then_with(|| a.branch.cmp(&b.branch)));
        matches
    }

    /// Administrative reset of one branch. Returns whether it existed.
    ///
    /// The slot is retired under its writer lock, so an `observe` racing with
    /// the reset either lands before it or on the fresh slot.
    pub fn reset(&self, branch: &str) -> bool {
        let Some(slot) = self.slots.get(branch).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        let mut writer = slot.writer.lock();
        writer.retired = true;
        self.slots.remove_if(branch, |_, current| Arc::ptr_eq(current, &slot));
        tracing::info!(branch, "Branch signature reset");
        true
    }

    pub fn reset_all(&self) {
        let branches = self.branches();
        for branch in &branches {
            self.reset(branch);
        }
        tracing::info!(branches = branches.len(), "All branch signatures reset");
    }
}

/// Anomalous when the branch has `min_samples` observations and the amount sits
/// more than `threshold` standard deviations from the running mean.
pub fn compare(
    tx: &TransactionRecord,
    signature: &BranchSignature,
    threshold: f64,
    min_samples: u64,
) -> AnomalyFlag {
    let expected = signature.mean();
    let std = signature.std_dev();
    let diff = (tx.amount - expected).abs();
    let deviation = if std > 0.0 {
        diff / std
    } else if diff > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };
    let samples = signature.observations();
    AnomalyFlag {
        branch: signature.branch.clone(),
        transaction_id: tx.id.clone(),
        observed: tx.amount,
        expected,
        band: threshold * std,
        deviation,
        samples,
        anomalous: samples >= min_samples && deviation > threshold,
    }
}
