mod alerts;
mod config;
mod control;
mod core;
mod db;
mod error;
mod routing;
mod scoring;
mod signature;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::core::RiskLabel;
use crate::core::pipeline::{Engines, PipelineOutput, record_deliveries, run_pipeline};
use crate::db::SharedDatabase;
use crate::routing::RouteReason;

#[tokio::main]
async fn main() {
    // Initialize logging
    let filter = match "txguard=info".parse() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("🛡️ txguard starting...");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    tracing::debug!("Config: {:?}", config);

    // Open audit database
    let db_path = Path::new(&config.database.path);
    if let Some(parent) = db_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!("Failed to create database directory {}: {e}", parent.display());
            std::process::exit(1);
        }
    }
    let db = match SharedDatabase::open(db_path) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Failed to open audit database {}: {e}", config.database.path);
            std::process::exit(1);
        }
    };
    tracing::info!("Audit database opened at {}", config.database.path);

    let channels = alerts::channels::build_channels(&config.channels);
    let engines = match Engines::new(&config, channels) {
        Ok(engines) => Arc::new(engines),
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    // Fold the historical export into branch state before the replay
    if let Some(ref csv_path) = config.data.history_csv {
        let records = load_records(Path::new(csv_path));
        let total = records.len();
        let mut seeded = 0;
        for record in records {
            let id = record.id.clone();
            match engines.seed(record) {
                Ok(()) => seeded += 1,
                Err(e) => tracing::warn!(id = %id, "Skipped history record: {e}"),
            }
        }
        tracing::info!(seeded, total, "Branch state seeded from {csv_path}");
    }

    let records = match config.data.transactions_csv {
        Some(ref csv_path) => load_records(Path::new(csv_path)),
        None => Vec::new(),
    };

    // Source → Pipeline, Control → Pipeline, Pipeline → summary, Dispatch → recorder
    let (tx_in, rx_in) = mpsc::unbounded_channel();
    let (admin_tx, admin_rx) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<PipelineOutput>();
    let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

    let pipeline = tokio::spawn(run_pipeline(
        rx_in,
        admin_rx,
        out_tx,
        delivery_tx,
        Arc::clone(&engines),
        Some(db.clone()),
    ));
    let recorder = tokio::spawn(record_deliveries(delivery_rx, Some(db.clone())));
    let collector = tokio::spawn(async move {
        let mut summary = Summary::default();
        while let Some(output) = out_rx.recv().await {
            summary.add(&output);
        }
        summary
    });
    tracing::info!("Pipeline started");

    for record in records {
        if tx_in.send(record).is_err() {
            break;
        }
    }
    tracing::info!("Replay queued; reading commands from stdin until EOF or Ctrl-C");

    control::run(PathBuf::from(&config_path), admin_tx).await;
    drop(tx_in);

    if let Err(e) = pipeline.await {
        tracing::error!("Pipeline task failed: {e}");
    }
    let summary = match collector.await {
        Ok(summary) => summary,
        Err(e) => {
            tracing::error!("Summary collector failed: {e}");
            Summary::default()
        }
    };
    let (delivered, failed) = match recorder.await {
        Ok(counts) => counts,
        Err(e) => {
            tracing::error!("Delivery recorder failed: {e}");
            (0, 0)
        }
    };

    tracing::info!(
        processed = summary.processed,
        rejected = summary.rejected,
        critical = summary.critical,
        anomalies = summary.anomalies,
        failovers = summary.failovers,
        alerts = summary.alerts,
        delivered,
        failed,
        "Replay finished"
    );

    let m = engines.history.key_metrics();
    tracing::info!(
        total = m.total_transactions,
        failed = m.failed_transactions,
        failure_rate_pct = m.failure_rate,
        total_amount = m.total_amount,
        failed_amount = m.failed_amount,
        total_tax = m.total_tax,
        branches = m.unique_branches,
        malls = m.unique_malls,
        "Key metrics"
    );

    for entry in engines.branch_report() {
        let advice = &entry.advice;
        tracing::info!(
            branch = %advice.branch,
            status = advice.status.as_str(),
            failure_rate_pct = advice.failure_rate * 100.0,
            gateway = advice.gateway.as_deref().unwrap_or("-"),
            risk_hours = ?advice.risk_hours,
            "Branch advice"
        );
    }

    match (db.get_score_count(), db.get_alert_count()) {
        (Ok(scores), Ok(alerts)) => tracing::info!(scores, alerts, "Audit database totals"),
        (Err(e), _) | (_, Err(e)) => tracing::warn!("Failed to read audit totals: {e}"),
    }

    match db.get_alert_counts_by_severity() {
        Ok(counts) => {
            for (severity, count) in counts {
                tracing::info!("Stored {severity} alerts: {count}");
            }
        }
        Err(e) => tracing::warn!("Failed to read alert counts: {e}"),
    }

    match db.get_scores_above(config.routing.switch_threshold, 5) {
        Ok(rows) => {
            for row in rows {
                tracing::info!(
                    id = %row.transaction_id,
                    branch = %row.branch,
                    score = ?row.score,
                    gateway = ?row.gateway,
                    "Top risk"
                );
            }
        }
        Err(e) => tracing::warn!("Failed to read top scores: {e}"),
    }

    match db.get_failed_deliveries(10) {
        Ok(rows) => {
            for row in rows {
                tracing::warn!(
                    alert = %row.alert_id,
                    channel = %row.channel,
                    attempts = row.attempts,
                    error = row.error_detail.as_deref().unwrap_or("-"),
                    "Undelivered alert"
                );
            }
        }
        Err(e) => tracing::warn!("Failed to read failed deliveries: {e}"),
    }
}

/// Load a transaction export, oldest first. Missing or unreadable files give no records.
fn load_records(csv_path: &Path) -> Vec<crate::core::TransactionRecord> {
    if !csv_path.exists() {
        tracing::warn!("CSV {} not found", csv_path.display());
        return Vec::new();
    }
    let mut records = match crate::core::ingest::load_csv(csv_path) {
        Ok(report) => {
            if report.rejected > 0 {
                tracing::warn!("{} rows rejected from {}", report.rejected, csv_path.display());
            }
            report.records
        }
        Err(e) => {
            tracing::warn!("Failed to load {}: {e}", csv_path.display());
            Vec::new()
        }
    };
    records.sort_by_key(|r| r.timestamp);
    records
}

#[derive(Debug, Default)]
struct Summary {
    processed: u64,
    rejected: u64,
    critical: u64,
    anomalies: u64,
    failovers: u64,
    alerts: u64,
}

impl Summary {
    fn add(&mut self, output: &PipelineOutput) {
        self.processed += 1;
        match &output.score {
            Ok(score) if score.label == RiskLabel::Critical => self.critical += 1,
            Ok(_) => {}
            Err(_) => self.rejected += 1,
        }
        if output.is_anomalous() {
            self.anomalies += 1;
        }
        if output
            .decision
            .as_ref()
            .is_some_and(|d| d.reason == RouteReason::HighRiskFailover)
        {
            self.failovers += 1;
        }
        self.alerts += output.alerts.len() as u64;
    }
}
