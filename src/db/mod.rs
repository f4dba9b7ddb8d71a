pub mod schema;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::alerts::AlertEvent;
use crate::alerts::dispatch::DeliveryResult;
use crate::core::{RiskScore, TransactionRecord};
use crate::routing::RoutingDecision;

/// A persisted risk score row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub id: i64,
    pub transaction_id: String,
    pub branch: String,
    pub score: Option<f64>,
    pub label: String,
    pub factors_json: String,
    pub anomalous: bool,
    pub gateway: Option<String>,
    pub route_reason: Option<String>,
    pub tx_time: String,
    pub created_at: String,
}

/// A persisted delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: i64,
    pub alert_id: String,
    pub channel: String,
    pub success: bool,
    pub error_detail: Option<String>,
    pub attempts: u32,
    pub created_at: String,
}

/// Entry for score insertion. `score == None` marks a transaction the scorer rejected.
pub struct ScoreEntry {
    pub transaction_id: String,
    pub branch: String,
    pub score: Option<f64>,
    pub label: String,
    pub factors_json: Option<String>,
    pub recommendations_json: Option<String>,
    pub anomalous: bool,
    pub gateway: Option<String>,
    pub route_reason: Option<String>,
    pub tx_time: DateTime<Utc>,
}

impl ScoreEntry {
    pub fn new(
        tx: &TransactionRecord,
        score: Option<&RiskScore>,
        anomalous: bool,
        decision: Option<&RoutingDecision>,
    ) -> Self {
        Self {
            transaction_id: tx.id.clone(),
            branch: tx.branch.clone(),
            score: score.map(|s| s.value),
            label: score.map_or("unscored", |s| s.label.as_str()).to_string(),
            factors_json: score.and_then(|s| serde_json::to_string(&s.factors).ok()),
            recommendations_json: score.and_then(|s| serde_json::to_string(&s.recommendations).ok()),
            anomalous,
            gateway: decision.map(|d| d.gateway.clone()),
            route_reason: decision.map(|d| d.reason.as_str().to_string()),
            tx_time: tx.timestamp,
        }
    }
}

pub struct Database {
    conn: Connection,
}

/// Thread-safe wrapper around Database.
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let db = Database::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    /// Batch-store multiple scores in a single transaction.
    pub fn store_scores_batch(&self, entries: &[ScoreEntry]) -> Result<(), rusqlite::Error> {
        self.inner.lock().store_scores_batch(entries)
    }

    pub fn store_alert(&self, event: &AlertEvent) -> Result<(), rusqlite::Error> {
        self.inner.lock().store_alert(event)
    }

    pub fn store_delivery(&self, result: &DeliveryResult) -> Result<(), rusqlite::Error> {
        self.inner.lock().store_delivery(result)
    }

    /// Get recent scores ordered by transaction time.
    pub fn get_recent_scores(&self, limit: usize) -> Result<Vec<ScoreRecord>, rusqlite::Error> {
        self.inner.lock().get_recent_scores(limit)
    }

    /// Get scores at or above a threshold, highest first.
    pub fn get_scores_above(&self, min_score: f64, limit: usize) -> Result<Vec<ScoreRecord>, rusqlite::Error> {
        self.inner.lock().get_scores_above(min_score, limit)
    }

    pub fn get_score_count(&self) -> Result<usize, rusqlite::Error> {
        self.inner.lock().count("risk_scores")
    }

    pub fn get_alert_count(&self) -> Result<usize, rusqlite::Error> {
        self.inner.lock().count("alerts")
    }

    /// Alert counts grouped by severity.
    pub fn get_alert_counts_by_severity(&self) -> Result<Vec<(String, usize)>, rusqlite::Error> {
        self.inner.lock().get_alert_counts_by_severity()
    }

    pub fn get_failed_deliveries(&self, limit: usize) -> Result<Vec<DeliveryRecord>, rusqlite::Error> {
        self.inner.lock().get_failed_deliveries(limit)
    }
}

const SCORE_INSERT: &str = "INSERT INTO risk_scores
    (transaction_id, branch, score, label, factors, recommendations, anomalous, gateway, route_reason, tx_time, created_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, datetime('now'))";

const SCORE_COLUMNS: &str = "id, transaction_id, branch, score, label, factors, anomalous, gateway, route_reason, tx_time, created_at";

impl Database {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    fn insert_score(stmt: &mut rusqlite::Statement, e: &ScoreEntry) -> Result<(), rusqlite::Error> {
        stmt.execute(rusqlite::params![
            e.transaction_id,
            e.branch,
            e.score,
            e.label,
            e.factors_json,
            e.recommendations_json,
            e.anomalous as i32,
            e.gateway,
            e.route_reason,
            e.tx_time.to_rfc3339(),
        ])?;
        Ok(())
    }

    /// Batch-store multiple scores in a single transaction.
    pub fn store_scores_batch(&self, entries: &[ScoreEntry]) -> Result<(), rusqlite::Error> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(SCORE_INSERT)?;
            for e in entries {
                Self::insert_score(&mut stmt, e)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Alerts are keyed by event id; storing the same event twice is a no-op.
    pub fn store_alert(&self, event: &AlertEvent) -> Result<(), rusqlite::Error> {
        let channels: Vec<&str> = event.channels.iter().map(|c| c.as_str()).collect();
        self.conn.execute(
            "INSERT OR IGNORE INTO alerts (id, branch, rule, severity, message, metrics, channels, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                event.id,
                event.branch,
                event.rule,
                event.severity.as_str(),
                event.message,
                event.metrics.to_string(),
                serde_json::to_string(&channels).ok(),
                event.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn store_delivery(&self, result: &DeliveryResult) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO deliveries (alert_id, channel, success, error_detail, attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))",
            rusqlite::params![
                result.event_id,
                result.channel.as_str(),
                result.success as i32,
                result.error_detail,
                result.attempts,
            ],
        )?;
        Ok(())
    }

    fn row_to_score(row: &rusqlite::Row) -> rusqlite::Result<ScoreRecord> {
        let anomalous: i32 = row.get(6)?;
        Ok(ScoreRecord {
            id: row.get(0)?,
            transaction_id: row.get(1)?,
            branch: row.get(2)?,
            score: row.get(3)?,
            label: row.get(4)?,
            factors_json: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            anomalous: anomalous != 0,
            gateway: row.get(7)?,
            route_reason: row.get(8)?,
            tx_time: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    pub fn get_recent_scores(&self, limit: usize) -> Result<Vec<ScoreRecord>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SCORE_COLUMNS} FROM risk_scores ORDER BY tx_time DESC, id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(rusqlite::params![limit as i64], Self::row_to_score)?;
        rows.collect()
    }

    pub fn get_scores_above(&self, min_score: f64, limit: usize) -> Result<Vec<ScoreRecord>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SCORE_COLUMNS} FROM risk_scores WHERE score >= ?1 ORDER BY score DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(rusqlite::params![min_score, limit as i64], Self::row_to_score)?;
        rows.collect()
    }

    fn count(&self, table: &str) -> Result<usize, rusqlite::Error> {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get::<_, i64>(0).map(|c| c as usize)
            })
    }

    pub fn get_alert_counts_by_severity(&self) -> Result<Vec<(String, usize)>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT severity, COUNT(*) FROM alerts GROUP BY severity ORDER BY severity",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        rows.collect()
    }

    pub fn get_failed_deliveries(&self, limit: usize) -> Result<Vec<DeliveryRecord>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT id, alert_id, channel, success, error_detail, attempts, created_at
             FROM deliveries WHERE success = 0 ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
            let success: i32 = row.get(3)?;
            Ok(DeliveryRecord {
                id: row.get(0)?,
                alert_id: row.get(1)?,
                channel: row.get(2)?,
                success: success != 0,
                error_detail: row.get(4)?,
                attempts: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        rows.collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::rules::{ChannelKind, Severity};
    use crate::core::test_support::*;
    use crate::core::{RiskLabel, RiskScore};
    use crate::routing::RouteReason;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn open_temp_db() -> SharedDatabase {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "txguard_test_{}_{}.db",
            std::process::id(),
            id
        ));
        // Remove if leftover from previous run
        let _ = std::fs::remove_file(&path);
        SharedDatabase::open(&path).unwrap()
    }

    fn score(id: &str, value: f64, label: RiskLabel) -> RiskScore {
        RiskScore {
            transaction_id: id.into(),
            value,
            label,
            factors: vec![],
            recommendations: vec!["Transaction can proceed with standard monitoring".into()],
        }
    }

    fn alert(id: &str, severity: Severity) -> AlertEvent {
        AlertEvent {
            id: id.into(),
            branch: "North".into(),
            rule: "risk-critical".into(),
            severity,
            message: "test".into(),
            metrics: serde_json::json!({ "branch": "North" }),
            channels: vec![ChannelKind::Slack, ChannelKind::Log],
            created_at: at(2025, 1, 1, 10, 0),
        }
    }

    #[test]
    fn store_and_query_scores() {
        let db = open_temp_db();
        let low = make_tx("a", "North", at(2025, 1, 1, 10, 0), 10.0);
        let high = make_tx("b", "North", at(2025, 1, 1, 10, 5), 900.0);
        let decision = RoutingDecision {
            transaction_id: "b".into(),
            gateway: "secondary".into(),
            reason: RouteReason::HighRiskFailover,
        };
        db.store_scores_batch(&[
            ScoreEntry::new(&low, Some(&score("a", 0.1, RiskLabel::Low)), false, None),
            ScoreEntry::new(
                &high,
                Some(&score("b", 0.9, RiskLabel::Critical)),
                true,
                Some(&decision),
            ),
        ])
        .unwrap();

        assert_eq!(db.get_score_count().unwrap(), 2);
        let recent = db.get_recent_scores(10).unwrap();
        assert_eq!(recent[0].transaction_id, "b");
        assert!(recent[0].anomalous);
        assert_eq!(recent[0].route_reason.as_deref(), Some("high-risk-failover"));

        let above = db.get_scores_above(0.5, 10).unwrap();
        assert_eq!(above.len(), 1);
        assert_eq!(above[0].label, "critical");
    }

    #[test]
    fn unscored_rows_have_null_score() {
        let db = open_temp_db();
        let tx = make_tx("bad", "North", at(2025, 1, 1, 10, 0), 10.0);
        db.store_scores_batch(&[ScoreEntry::new(&tx, None, false, None)]).unwrap();
        let rows = db.get_recent_scores(1).unwrap();
        assert_eq!(rows[0].score, None);
        assert_eq!(rows[0].label, "unscored");
        assert!(db.get_scores_above(0.0, 10).unwrap().is_empty());
    }

    #[test]
    fn alerts_and_deliveries() {
        let db = open_temp_db();
        db.store_alert(&alert("e1", Severity::Critical)).unwrap();
        db.store_alert(&alert("e1", Severity::Critical)).unwrap();
        db.store_alert(&alert("e2", Severity::Warning)).unwrap();
        assert_eq!(db.get_alert_count().unwrap(), 2);
        assert_eq!(
            db.get_alert_counts_by_severity().unwrap(),
            vec![("critical".to_string(), 1), ("warning".to_string(), 1)]
        );

        db.store_delivery(&DeliveryResult {
            event_id: "e1".into(),
            channel: ChannelKind::Slack,
            success: false,
            error_detail: Some("rate limited by provider".into()),
            attempts: 2,
        })
        .unwrap();
        db.store_delivery(&DeliveryResult {
            event_id: "e1".into(),
            channel: ChannelKind::Log,
            success: true,
            error_detail: None,
            attempts: 1,
        })
        .unwrap();
        let failed = db.get_failed_deliveries(10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].channel, "slack");
        assert_eq!(failed[0].attempts, 2);
    }

    #[test]
    fn alert_refired_after_reset_is_stored() {
        use crate::alerts::{AlertEngine, MetricsSnapshot};
        use crate::config::AlertConfig;

        let db = open_temp_db();
        let engine = AlertEngine::new(&AlertConfig::default(), vec![ChannelKind::Log]).unwrap();
        let snapshot = MetricsSnapshot {
            branch: "North".into(),
            timestamp: at(2025, 1, 1, 10, 0),
            transaction_id: Some("z1".into()),
            windows: Default::default(),
            risk: Some(score("z1", 0.9, RiskLabel::Critical)),
            anomaly: None,
            velocity: None,
            overall: None,
            hourly: None,
            pattern_matches: Vec::new(),
        };
        for event in engine.evaluate(&snapshot) {
            db.store_alert(&event).unwrap();
        }
        engine.reset();
        for event in engine.evaluate(&snapshot) {
            db.store_alert(&event).unwrap();
        }
        assert_eq!(db.get_alert_count().unwrap(), 2);
    }
}
