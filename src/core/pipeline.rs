use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::alerts::dispatch::{Channel, DeliveryResult, Dispatcher};
use crate::alerts::rules::RuleConfig;
use crate::alerts::{AlertEngine, AlertEvent, MetricsSnapshot, VelocitySample};
use crate::config::Config;
use crate::control::AdminCommand;
use crate::core::history::{BranchHistory, HistoryStore, WindowStats};
use crate::core::{RiskLabel, RiskScore, TransactionRecord};
use crate::db::{ScoreEntry, SharedDatabase};
use crate::error::{ConfigError, InputError};
use crate::routing::{BranchAdvice, HealthBoard, Router, RoutingDecision};
use crate::scoring::RiskScorer;
use crate::signature::{AnomalyFlag, PercentileMarkers, SignatureStore};

/// Score rows written per SQLite transaction.
const SCORE_BATCH: usize = 256;

/// Everything the pipeline needs, built once from config.
pub struct Engines {
    pub scorer: RiskScorer,
    pub signatures: SignatureStore,
    pub history: HistoryStore,
    pub router: Router,
    pub health: HealthBoard,
    pub alerts: AlertEngine,
    pub dispatcher: Dispatcher,
    velocity_window: Duration,
    min_samples: usize,
}

/// One branch's standing: routing advice plus the signature figures behind it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchReport {
    pub advice: BranchAdvice,
    pub markers: Option<PercentileMarkers>,
    pub weekday_rate: Option<f64>,
    pub weekend_rate: Option<f64>,
    pub failure_velocity: f64,
}

impl Engines {
    pub fn new(config: &Config, channels: Vec<Arc<dyn Channel>>) -> Result<Self, ConfigError> {
        let dispatcher = Dispatcher::from_config(channels, &config.alerts);
        let alerts = AlertEngine::new(&config.alerts, dispatcher.registered())?;
        Ok(Self {
            scorer: RiskScorer::new(&config.scoring)?,
            signatures: SignatureStore::new(config.signature.clone()),
            history: HistoryStore::new(&config.history)?,
            router: Router::from_config(&config.routing),
            health: HealthBoard::from_config(&config.routing),
            alerts,
            dispatcher,
            velocity_window: config.scoring.velocity_window()?,
            min_samples: config.scoring.min_samples,
        })
    }

    /// Fold a historical record into branch state without scoring or alerting.
    pub fn seed(&self, tx: TransactionRecord) -> Result<(), InputError> {
        tx.validate()?;
        if self.signatures.observe(&tx) {
            self.history.record(tx);
        }
        Ok(())
    }

    /// Drop everything learned about one branch. Returns whether it was known.
    pub fn reset_branch(&self, branch: &str) -> bool {
        let had_signature = self.signatures.reset(branch);
        let had_history = self.history.remove(branch);
        self.alerts.reset_branch(branch);
        had_signature || had_history
    }

    pub fn reset_all(&self) {
        self.signatures.reset_all();
        self.history.clear();
        self.alerts.reset();
    }

    /// Swap the alert rule table. On error the running rules stay.
    pub fn reconfigure(&self, rules: Vec<RuleConfig>) -> Result<(), ConfigError> {
        self.alerts.reconfigure(rules)
    }

    /// Apply one operator command. Database queries are handled by the caller.
    pub fn apply(&self, command: AdminCommand) {
        match command {
            AdminCommand::ResetBranch(branch) => {
                if !self.reset_branch(&branch) {
                    warn!(branch = %branch, "Reset of unknown branch");
                }
            }
            AdminCommand::ResetAll => self.reset_all(),
            AdminCommand::Reconfigure(rules) => {
                if let Err(e) = self.reconfigure(rules) {
                    warn!("Rule reconfiguration rejected: {e}");
                }
            }
            AdminCommand::SetGateway { id, healthy } => {
                if !self.health.set_health(&id, healthy) {
                    warn!(gateway = %id, "Unknown gateway");
                }
            }
            AdminCommand::Report => log_report(&self.branch_report()),
            AdminCommand::RecentScores(_) => {}
        }
    }

    /// Advice and signature figures for every known branch, sorted by name.
    pub fn branch_report(&self) -> Vec<BranchReport> {
        let gateways = self.health.current();
        self.signatures
            .branches()
            .iter()
            .filter_map(|branch| self.signatures.snapshot(branch))
            .map(|sig| {
                let (weekday_rate, weekend_rate) = sig.weekday_weekend_rates();
                BranchReport {
                    advice: self.router.advise(&sig, &gateways),
                    markers: sig.percentile_markers(),
                    weekday_rate,
                    weekend_rate,
                    failure_velocity: sig.failure_velocity,
                }
            })
            .collect()
    }

    /// Score, compare, learn, route and evaluate rules for one transaction.
    /// Does no I/O; dispatch and persistence are up to the caller.
    pub fn process(&self, tx: TransactionRecord) -> PipelineOutput {
        let gateways = self.health.current();

        if let Err(e) = tx.validate() {
            warn!(id = %tx.id, branch = %tx.branch, "Rejected transaction: {e}");
            let decision = self.router.route_unscored(&tx, &gateways);
            return PipelineOutput {
                tx,
                score: Err(e),
                anomaly: None,
                decision,
                alerts: Vec::new(),
                duplicate: false,
            };
        }

        let history = self
            .history
            .snapshot(&tx.branch)
            .with_failure_patterns(self.signatures.failure_patterns(&tx.branch));

        let score = self.scorer.score(&tx, &history);
        let anomaly = self.signatures.compare_current(&tx);

        let duplicate = !self.signatures.observe(&tx);
        if !duplicate {
            self.history.record(tx.clone());
        }

        let decision = match &score {
            Ok(score) => self.router.route(&tx, score, &gateways),
            Err(_) => self.router.route_unscored(&tx, &gateways),
        };

        let snapshot = self.metrics_snapshot(&tx, &history, duplicate, score.as_ref().ok(), &anomaly);
        let alerts = self.alerts.evaluate(&snapshot);

        PipelineOutput {
            tx,
            score,
            anomaly: Some(anomaly),
            decision,
            alerts,
            duplicate,
        }
    }

    /// `history` is the branch window before `tx` was recorded.
    fn metrics_snapshot(
        &self,
        tx: &TransactionRecord,
        history: &BranchHistory,
        duplicate: bool,
        score: Option<&RiskScore>,
        anomaly: &AnomalyFlag,
    ) -> MetricsSnapshot {
        let rules = self.alerts.rules();
        let windows = rules
            .failure_windows()
            .into_iter()
            .filter_map(|secs| {
                let window = crate::config::window("alerts.rules.window_secs", secs).ok()?;
                Some((secs, self.history.window_stats(&tx.branch, tx.timestamp, window)))
            })
            .collect();
        let velocity = (history.len() >= self.min_samples).then(|| VelocitySample {
            window_secs: self.velocity_window.num_seconds().max(0) as u64,
            recent: history.count_within(tx.timestamp, self.velocity_window) as u64,
            expected: history.expected_within(self.velocity_window),
        });
        let recorded = u64::from(!duplicate);
        let overall = WindowStats {
            transactions: history.len() as u64 + recorded,
            failures: history.failures() as u64 + recorded * u64::from(tx.is_failed()),
        };
        let hourly = self.signatures.snapshot(&tx.branch).map(|sig| sig.hourly_counts());
        let pattern_matches = if rules.needs_pattern_matches() {
            self.signatures.match_pattern(&tx.branch)
        } else {
            Vec::new()
        };
        MetricsSnapshot {
            branch: tx.branch.clone(),
            timestamp: tx.timestamp,
            transaction_id: Some(tx.id.clone()),
            windows,
            risk: score.cloned(),
            anomaly: Some(anomaly.clone()),
            velocity,
            overall: Some(overall),
            hourly,
            pattern_matches,
        }
    }
}

fn log_report(report: &[BranchReport]) {
    for entry in report {
        let advice = &entry.advice;
        info!(
            branch = %advice.branch,
            status = advice.status.as_str(),
            failure_rate_pct = advice.failure_rate * 100.0,
            gateway = advice.gateway.as_deref().unwrap_or("-"),
            risk_hours = ?advice.risk_hours,
            optimal_hours = ?advice.optimal_hours,
            weekday_rate = ?entry.weekday_rate,
            weekend_rate = ?entry.weekend_rate,
            p95 = ?entry.markers.map(|m| m.p95),
            failure_velocity = entry.failure_velocity,
            "Branch advice"
        );
    }
}

/// Result of processing one transaction.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub tx: TransactionRecord,
    pub score: Result<RiskScore, InputError>,
    pub anomaly: Option<AnomalyFlag>,
    pub decision: Option<RoutingDecision>,
    pub alerts: Vec<AlertEvent>,
    /// The id was already seen for this branch; signature and history were left as they were.
    pub duplicate: bool,
}

impl PipelineOutput {
    pub fn is_anomalous(&self) -> bool {
        self.anomaly.as_ref().is_some_and(|a| a.anomalous)
    }
}

fn flush_scores(db: Option<&SharedDatabase>, batch: &mut Vec<ScoreEntry>) {
    if batch.is_empty() {
        return;
    }
    if let Some(db) = db {
        if let Err(e) = db.store_scores_batch(batch) {
            warn!(rows = batch.len(), "Failed to store risk scores: {e}");
        }
    }
    batch.clear();
}

fn log_recent_scores(db: Option<&SharedDatabase>, limit: usize) {
    let Some(db) = db else {
        warn!("No audit database configured");
        return;
    };
    match db.get_recent_scores(limit) {
        Ok(rows) => {
            for row in rows {
                info!(
                    id = %row.transaction_id,
                    branch = %row.branch,
                    score = ?row.score,
                    label = %row.label,
                    gateway = ?row.gateway,
                    "Recent score"
                );
            }
        }
        Err(e) => warn!("Failed to read recent scores: {e}"),
    }
}

/// Run the pipeline: receive transactions and operator commands, process,
/// dispatch alerts, persist, forward. Commands take effect between transactions.
pub async fn run_pipeline(
    mut rx: mpsc::UnboundedReceiver<TransactionRecord>,
    mut admin_rx: mpsc::UnboundedReceiver<AdminCommand>,
    out_tx: mpsc::UnboundedSender<PipelineOutput>,
    delivery_tx: mpsc::UnboundedSender<DeliveryResult>,
    engines: Arc<Engines>,
    db: Option<SharedDatabase>,
) {
    let mut tx_count: u64 = 0;
    let mut alert_count: u64 = 0;
    let mut admin_open = true;
    let mut batch: Vec<ScoreEntry> = Vec::with_capacity(SCORE_BATCH);

    info!("Pipeline started, waiting for transactions...");

    loop {
        let tx = tokio::select! {
            biased;
            command = admin_rx.recv(), if admin_open => {
                match command {
                    Some(AdminCommand::RecentScores(limit)) => {
                        flush_scores(db.as_ref(), &mut batch);
                        log_recent_scores(db.as_ref(), limit);
                    }
                    Some(command) => engines.apply(command),
                    None => admin_open = false,
                }
                continue;
            }
            tx = rx.recv() => match tx {
                Some(tx) => tx,
                None => break,
            },
        };

        let output = engines.process(tx);
        tx_count += 1;

        for event in &output.alerts {
            alert_count += 1;
            if let Some(db) = &db {
                if let Err(e) = db.store_alert(event) {
                    warn!(event = %event.id, "Failed to store alert: {e}");
                }
            }
            engines.dispatcher.spawn(event.clone(), delivery_tx.clone());
        }

        if db.is_some() {
            batch.push(ScoreEntry::new(
                &output.tx,
                output.score.as_ref().ok(),
                output.is_anomalous(),
                output.decision.as_ref(),
            ));
            if batch.len() >= SCORE_BATCH || rx.is_empty() {
                flush_scores(db.as_ref(), &mut batch);
            }
        }

        if let Ok(score) = &output.score {
            if score.label >= RiskLabel::High {
                debug!(
                    id = %output.tx.id,
                    branch = %output.tx.branch,
                    score = score.value,
                    label = score.label.as_str(),
                    "{} High-risk transaction",
                    score.label.emoji()
                );
            }
        }

        if tx_count % 1000 == 0 {
            info!("Pipeline processed {tx_count} txs, {alert_count} alerts");
        }

        if out_tx.send(output).is_err() {
            info!("Output channel closed, stopping pipeline");
            break;
        }
    }

    flush_scores(db.as_ref(), &mut batch);
    info!("Pipeline shutting down after {tx_count} txs, {alert_count} alerts");
}

/// Persist delivery results as they arrive. Returns (delivered, failed).
pub async fn record_deliveries(
    mut rx: mpsc::UnboundedReceiver<DeliveryResult>,
    db: Option<SharedDatabase>,
) -> (u64, u64) {
    let (mut delivered, mut failed) = (0, 0);
    while let Some(result) = rx.recv().await {
        if result.success {
            delivered += 1;
        } else {
            failed += 1;
        }
        if let Some(db) = &db {
            if let Err(e) = db.store_delivery(&result) {
                warn!(event = %result.event_id, "Failed to store delivery result: {e}");
            }
        }
    }
    (delivered, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::dispatch::tests::MockChannel;
    use crate::alerts::rules::{ChannelKind, Severity};
    use crate::config::GatewayConfig;
    use crate::core::test_support::*;
    use crate::routing::{BranchStatus, RouteReason};
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_db() -> SharedDatabase {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "txguard_pipeline_{}_{}.db",
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_file(&path);
        SharedDatabase::open(&path).unwrap()
    }

    fn gateway(id: &str, healthy: bool) -> GatewayConfig {
        GatewayConfig {
            id: id.into(),
            healthy,
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.routing.gateways = vec![
            gateway("primary", true),
            gateway("backup1", false),
            gateway("backup2", true),
        ];
        config
    }

    fn mock_channels() -> (Vec<Arc<MockChannel>>, Vec<Arc<dyn Channel>>) {
        let mocks: Vec<Arc<MockChannel>> = [ChannelKind::Telegram, ChannelKind::Slack, ChannelKind::Log]
            .into_iter()
            .map(|k| Arc::new(MockChannel::new(k)))
            .collect();
        let channels = mocks.iter().map(|m| m.clone() as Arc<dyn Channel>).collect();
        (mocks, channels)
    }

    /// Z Mall: 1000 records alternating 35/55 (mean 45, std 10), 30 failures all
    /// at 02:xx, and a burst of 10 sales just before the new transaction. North
    /// keeps the network failure rate at 1%.
    fn seed_z_mall(engines: &Engines) {
        let start = at(2025, 1, 1, 0, 0);
        let mut failures = 0;
        for i in 0..990u32 {
            let ts = start + Duration::minutes(15 * i as i64);
            let amount = if i % 2 == 0 { 35.0 } else { 55.0 };
            let id = format!("Z{i}");
            let tx = if ts.format("%H").to_string() == "02" && failures < 30 {
                failures += 1;
                make_failed(&id, "Z Mall", ts, amount)
            } else {
                make_tx(&id, "Z Mall", ts, amount)
            };
            engines.seed(tx).unwrap();
        }
        assert_eq!(failures, 30);
        for i in 0..10u32 {
            let ts = at(2025, 1, 12, 2, 0) + Duration::seconds(20 * i as i64);
            let amount = if i % 2 == 0 { 35.0 } else { 55.0 };
            engines.seed(make_tx(&format!("ZB{i}"), "Z Mall", ts, amount)).unwrap();
        }
        for i in 0..2000u32 {
            let ts = start + Duration::minutes(7 * i as i64);
            engines.seed(make_tx(&format!("N{i}"), "North", ts, 40.0)).unwrap();
        }
    }

    #[tokio::test]
    async fn z_mall_end_to_end() {
        let (mocks, channels) = mock_channels();
        let engines = Arc::new(Engines::new(&config(), channels).unwrap());
        seed_z_mall(&engines);

        let db = temp_db();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (_admin_tx, admin_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let pipeline = tokio::spawn(run_pipeline(
            in_rx,
            admin_rx,
            out_tx,
            delivery_tx,
            Arc::clone(&engines),
            Some(db.clone()),
        ));

        in_tx
            .send(make_tx("Z-NEW", "Z Mall", at(2025, 1, 12, 2, 4), 200.0))
            .unwrap();
        drop(in_tx);

        let output = out_rx.recv().await.unwrap();
        pipeline.await.unwrap();

        let score = output.score.as_ref().unwrap();
        assert_eq!(score.label, RiskLabel::Critical);
        assert!(score.value >= 0.8, "{}", score.value);
        let amount = score.factor(crate::core::RiskFactor::Amount).unwrap();
        assert!((amount.value - 1.0).abs() < 1e-9);

        let anomaly = output.anomaly.as_ref().unwrap();
        assert!(anomaly.anomalous);
        assert!((anomaly.deviation - 15.5).abs() < 1e-6);

        let decision = output.decision.as_ref().unwrap();
        assert_eq!(decision.gateway, "backup2");
        assert_eq!(decision.reason, RouteReason::HighRiskFailover);

        let critical: Vec<_> = output
            .alerts
            .iter()
            .filter(|e| e.severity == Severity::Critical)
            .collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(
            critical[0].channels,
            vec![ChannelKind::Telegram, ChannelKind::Slack, ChannelKind::Log]
        );
        let critical_id = critical[0].id.clone();

        let (delivered, failed) = record_deliveries(delivery_rx, Some(db.clone())).await;
        assert_eq!(failed, 0);
        assert!(delivered >= 3);
        for mock in &mocks {
            assert!(mock.received.lock().contains(&critical_id));
        }

        assert_eq!(db.get_score_count().unwrap(), 1);
        assert_eq!(db.get_alert_count().unwrap(), output.alerts.len());
        assert!(db.get_failed_deliveries(10).unwrap().is_empty());
    }

    #[test]
    fn invalid_transaction_goes_to_manual_review() {
        let engines = Engines::new(&config(), vec![]).unwrap();
        let output = engines.process(make_tx("bad", "North", at(2025, 1, 1, 10, 0), -3.0));
        assert!(matches!(output.score, Err(InputError::InvalidAmount { .. })));
        let decision = output.decision.unwrap();
        assert_eq!(decision.gateway, "primary");
        assert_eq!(decision.reason, RouteReason::UnscoredManualReview);
        assert!(engines.signatures.snapshot("North").is_none());
        assert_eq!(engines.history.branch_len("North"), 0);
    }

    #[test]
    fn duplicate_is_scored_but_not_learned() {
        let engines = Engines::new(&config(), vec![]).unwrap();
        let tx = make_tx("same", "North", at(2025, 1, 1, 10, 0), 30.0);
        assert!(!engines.process(tx.clone()).duplicate);
        let again = engines.process(tx);
        assert!(again.duplicate);
        assert!(again.score.is_ok());
        assert_eq!(engines.history.branch_len("North"), 1);
        assert_eq!(engines.signatures.snapshot("North").unwrap().observations(), 1);
    }

    #[test]
    fn cold_branch_scores_with_defaults_and_no_alerts() {
        let engines = Engines::new(&config(), vec![]).unwrap();
        let output = engines.process(make_tx("first", "South", at(2025, 1, 1, 10, 0), 80.0));
        let score = output.score.unwrap();
        assert!(!score.defaulted_factors().is_empty());
        assert!(!output.anomaly.unwrap().anomalous);
        assert!(output.alerts.is_empty());
        assert_eq!(output.decision.unwrap().reason, RouteReason::Normal);
    }

    /// Three days at one sale every 5 minutes; half the 03:xx sales fail.
    fn seed_night_failures(engines: &Engines, branch: &str) {
        let start = at(2025, 1, 1, 0, 0);
        for i in 0..(3 * 288u32) {
            let ts = start + Duration::minutes(5 * i as i64);
            let id = format!("{branch}{i}");
            let tx = if ts.format("%H").to_string() == "03" && i % 2 == 0 {
                make_failed(&id, branch, ts, 40.0)
            } else {
                make_tx(&id, branch, ts, 40.0)
            };
            engines.seed(tx).unwrap();
        }
    }

    fn fired(output: &PipelineOutput, rule: &str) -> bool {
        output.alerts.iter().any(|e| e.rule == rule)
    }

    #[test]
    fn night_failures_raise_hourly_and_shared_pattern_alerts() {
        let engines = Engines::new(&config(), vec![]).unwrap();
        seed_night_failures(&engines, "A");
        seed_night_failures(&engines, "B");

        let output = engines.process(make_failed("A-new", "A", at(2025, 1, 4, 3, 1), 40.0));
        assert!(fired(&output, "hourly-failure-spike"));
        let shared = output
            .alerts
            .iter()
            .find(|e| e.rule == "shared-failure-pattern")
            .unwrap();
        assert!(shared.message.contains("matches B"), "{}", shared.message);

        let daytime = engines.process(make_tx("A-day", "A", at(2025, 1, 4, 14, 0), 40.0));
        assert!(!fired(&daytime, "hourly-failure-spike"));
    }

    #[test]
    fn reset_branch_forgets_history_signature_and_dedup() {
        let engines = Engines::new(&config(), vec![]).unwrap();
        seed_night_failures(&engines, "A");
        seed_night_failures(&engines, "B");
        let tx = make_failed("A-new", "A", at(2025, 1, 4, 3, 1), 40.0);
        assert!(fired(&engines.process(tx.clone()), "hourly-failure-spike"));

        assert!(engines.reset_branch("A"));
        assert!(engines.signatures.snapshot("A").is_none());
        assert_eq!(engines.history.branch_len("A"), 0);
        assert!(engines.history.branch_len("B") > 0);
        assert!(!engines.reset_branch("nowhere"));

        // The same id is new again, and the cold branch has nothing to alert on.
        let again = engines.process(tx);
        assert!(!again.duplicate);
        assert!(!fired(&again, "hourly-failure-spike"));
        assert_eq!(engines.history.branch_len("A"), 1);
    }

    #[test]
    fn reset_all_and_rejected_reconfigure() {
        let engines = Engines::new(&config(), vec![]).unwrap();
        seed_night_failures(&engines, "A");
        engines.reset_all();
        assert!(engines.signatures.branches().is_empty());
        assert_eq!(engines.history.key_metrics().total_transactions, 0);

        let mut rules = crate::config::default_rules();
        rules.push(rules[0].clone());
        assert!(engines.reconfigure(rules).is_err());
        assert_eq!(engines.alerts.rules().len(), 7);

        engines.apply(AdminCommand::Reconfigure(crate::config::default_rules()[..2].to_vec()));
        assert_eq!(engines.alerts.rules().len(), 2);
    }

    #[test]
    fn branch_report_advises_reroute_for_failing_branch() {
        let engines = Engines::new(&config(), vec![]).unwrap();
        let start = at(2025, 1, 1, 0, 0);
        for i in 0..100u32 {
            let ts = start + Duration::minutes(10 * i as i64);
            let tx = if i % 5 == 0 {
                make_failed(&format!("S{i}"), "South", ts, 40.0)
            } else {
                make_tx(&format!("S{i}"), "South", ts, 40.0)
            };
            engines.seed(tx).unwrap();
            engines.seed(make_tx(&format!("N{i}"), "North", ts, 40.0)).unwrap();
        }

        let report = engines.branch_report();
        let names: Vec<&str> = report.iter().map(|r| r.advice.branch.as_str()).collect();
        assert_eq!(names, ["North", "South"]);
        assert_eq!(report[0].advice.status, BranchStatus::Normal);
        assert_eq!(report[0].advice.gateway.as_deref(), Some("primary"));
        assert_eq!(report[1].advice.status, BranchStatus::RerouteRequired);
        assert_eq!(report[1].advice.gateway.as_deref(), Some("backup2"));

        engines.apply(AdminCommand::SetGateway {
            id: "backup2".into(),
            healthy: false,
        });
        assert_eq!(engines.branch_report()[1].advice.gateway.as_deref(), Some("primary"));
    }

    #[tokio::test]
    async fn admin_command_applies_before_the_next_transaction() {
        let engines = Arc::new(Engines::new(&config(), vec![]).unwrap());
        seed_night_failures(&engines, "A");

        let db = temp_db();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (admin_tx, admin_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (delivery_tx, _delivery_rx) = mpsc::unbounded_channel();
        let pipeline = tokio::spawn(run_pipeline(
            in_rx,
            admin_rx,
            out_tx,
            delivery_tx,
            Arc::clone(&engines),
            Some(db.clone()),
        ));

        in_tx.send(make_tx("warm", "A", at(2025, 1, 4, 10, 0), 40.0)).unwrap();
        let warm = out_rx.recv().await.unwrap();
        assert!(warm.score.unwrap().defaulted_factors().is_empty());

        admin_tx.send(AdminCommand::ResetBranch("A".into())).unwrap();
        in_tx.send(make_tx("cold", "A", at(2025, 1, 4, 10, 5), 40.0)).unwrap();
        let cold = out_rx.recv().await.unwrap();
        assert!(!cold.score.unwrap().defaulted_factors().is_empty());

        admin_tx.send(AdminCommand::RecentScores(5)).unwrap();
        drop(admin_tx);
        drop(in_tx);
        pipeline.await.unwrap();

        assert_eq!(db.get_score_count().unwrap(), 2);
        assert_eq!(engines.history.branch_len("A"), 1);
    }
}
