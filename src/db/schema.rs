use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS risk_scores (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_id  TEXT NOT NULL,
            branch          TEXT NOT NULL,
            score           REAL,           -- NULL when the transaction was rejected
            label           TEXT NOT NULL,
            factors         TEXT,           -- JSON
            recommendations TEXT,           -- JSON
            anomalous       INTEGER NOT NULL DEFAULT 0,
            gateway         TEXT,
            route_reason    TEXT,
            tx_time         TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS alerts (
            id          TEXT PRIMARY KEY,
            branch      TEXT NOT NULL,
            rule        TEXT NOT NULL,
            severity    TEXT NOT NULL,
            message     TEXT NOT NULL,
            metrics     TEXT,   -- JSON
            channels    TEXT,   -- JSON
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS deliveries (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            alert_id     TEXT NOT NULL,
            channel      TEXT NOT NULL,
            success      INTEGER NOT NULL,
            error_detail TEXT,
            attempts     INTEGER NOT NULL,
            created_at   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_risk_scores_score ON risk_scores(score DESC);
        CREATE INDEX IF NOT EXISTS idx_risk_scores_branch ON risk_scores(branch, tx_time);
        CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_deliveries_alert ON deliveries(alert_id);
        ",
    )?;
    Ok(())
}
