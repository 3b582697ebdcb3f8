//! Durable storage for alerts, trigger history, and custom metrics.
//!
//! A single `rusqlite::Connection` behind `Arc<parking_lot::Mutex<Connection>>`,
//! opened in WAL mode, schema applied with one `execute_batch` at
//! construction, and batch writes wrapped in an explicit transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};

use crate::model::{Alert, AlertChannel, CustomMetric, Priority, TriggerRecord};

#[derive(Debug, Clone)]
pub enum StoreError {
    Connection { reason: String },
    Query { reason: String },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Connection { reason } => write!(f, "store connection error: {reason}"),
            StoreError::Query { reason } => write!(f, "store query error: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Query { reason: e.to_string() }
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    phone TEXT,
    email TEXT
);

CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    fixture_id TEXT,
    expression_json TEXT NOT NULL,
    channels TEXT NOT NULL,
    priority TEXT NOT NULL,
    cooldown_seconds INTEGER NOT NULL DEFAULT 300,
    active INTEGER NOT NULL DEFAULT 1,
    trigger_count INTEGER NOT NULL DEFAULT 0,
    last_triggered_at TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS alert_triggers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_id INTEGER NOT NULL,
    fixture_id TEXT NOT NULL,
    triggered_at TEXT NOT NULL,
    metric_snapshot_json TEXT NOT NULL,
    channels_attempted TEXT NOT NULL DEFAULT '[]',
    channels_succeeded TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS custom_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    formula_text TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

#[derive(Clone)]
pub struct AlertStore {
    conn: Arc<Mutex<Connection>>,
}

impl AlertStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .map_err(|e| StoreError::Connection { reason: e.to_string() })?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn active_alerts(&self) -> Result<Vec<Alert>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, name, description, fixture_id, expression_json, channels, \
             priority, cooldown_seconds, active, trigger_count, last_triggered_at \
             FROM alerts WHERE active = 1",
        )?;
        let rows = stmt.query_map([], row_to_alert)?;
        let mut alerts = Vec::new();
        for row in rows {
            alerts.push(row?);
        }
        Ok(alerts)
    }

    pub fn insert_alert(&self, alert: &Alert) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        let expression_json = serde_json::to_string(&alert.expression).unwrap_or_default();
        let channels_json = serde_json::to_string(&alert.channels).unwrap_or_default();
        let priority_json = serde_json::to_string(&alert.priority).unwrap_or_default();
        conn.execute(
            "INSERT INTO alerts (user_id, name, description, fixture_id, expression_json, channels, \
             priority, cooldown_seconds, active, trigger_count, last_triggered_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                alert.owner_user_id,
                alert.name,
                alert.description,
                alert.fixture_id,
                expression_json,
                channels_json,
                priority_json,
                alert.cooldown_seconds as i64,
                alert.active as i64,
                alert.trigger_count as i64,
                alert.last_triggered_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_trigger(&self, record: &TriggerRecord) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| {
            conn.execute(
                "INSERT INTO alert_triggers (alert_id, fixture_id, triggered_at, metric_snapshot_json, \
                 channels_attempted, channels_succeeded) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.alert_id,
                    record.fixture_id,
                    record.triggered_at.to_rfc3339(),
                    record.metric_snapshot_json,
                    serde_json::to_string(&record.channels_attempted).unwrap_or_default(),
                    serde_json::to_string(&record.channels_succeeded).unwrap_or_default(),
                ],
            )?;
            Ok::<i64, rusqlite::Error>(conn.last_insert_rowid())
        })();
        match result {
            Ok(id) => {
                conn.execute("COMMIT", [])?;
                Ok(id)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e.into())
            }
        }
    }

    pub fn update_trigger_channels_succeeded(&self, trigger_id: i64, succeeded: &[AlertChannel]) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE alert_triggers SET channels_succeeded = ?1 WHERE id = ?2",
            params![serde_json::to_string(succeeded).unwrap_or_default(), trigger_id],
        )?;
        Ok(())
    }

    pub fn update_alert_counters(&self, alert_id: i64, trigger_count: u64, last_triggered_at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE alerts SET trigger_count = ?1, last_triggered_at = ?2 WHERE id = ?3",
            params![trigger_count as i64, last_triggered_at.to_rfc3339(), alert_id],
        )?;
        Ok(())
    }

    pub fn custom_metrics_by_owner(&self, owner_user_id: i64) -> Result<Vec<CustomMetric>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, name, formula_text FROM custom_metrics WHERE user_id = ?1",
        )?;
        let rows = stmt.query_map(params![owner_user_id], |row| {
            Ok(CustomMetric {
                id: row.get(0)?,
                owner_user_id: row.get(1)?,
                name: row.get(2)?,
                formula_text: row.get(3)?,
                variable_names: Vec::new(),
            })
        })?;
        let mut metrics = Vec::new();
        for row in rows {
            metrics.push(row?);
        }
        Ok(metrics)
    }

    pub fn insert_custom_metric(&self, metric: &CustomMetric) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO custom_metrics (user_id, name, formula_text) VALUES (?1, ?2, ?3)",
            params![metric.owner_user_id, metric.name, metric.formula_text],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn contact_for_user(&self, user_id: i64) -> Result<(Option<String>, Option<String>), StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT phone, email FROM users WHERE id = ?1")?;
        let result = stmt.query_row(params![user_id], |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?))
        });
        match result {
            Ok(contact) => Ok(contact),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok((None, None)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn upsert_user_contact(&self, user_id: i64, phone: Option<&str>, email: Option<&str>) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, phone, email) VALUES (?1, ?2, ?3) \
             ON CONFLICT(id) DO UPDATE SET phone = excluded.phone, email = excluded.email",
            params![user_id, phone, email],
        )?;
        Ok(())
    }
}

fn row_to_alert(row: &rusqlite::Row) -> rusqlite::Result<Alert> {
    let expression_json: String = row.get(5)?;
    let channels_json: String = row.get(6)?;
    let priority_json: String = row.get(7)?;
    let last_triggered_at: Option<String> = row.get(11)?;

    let expression = serde_json::from_str(&expression_json).unwrap_or(crate::condition::Expression::And(vec![]));
    let channels = serde_json::from_str(&channels_json).unwrap_or_default();
    let priority: Priority = serde_json::from_str(&priority_json).unwrap_or(Priority::Medium);

    Ok(Alert {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        fixture_id: row.get(4)?,
        expression,
        channels,
        priority,
        cooldown_seconds: row.get::<_, i64>(8)? as u64,
        active: row.get::<_, i64>(9)? != 0,
        trigger_count: row.get::<_, i64>(10)? as u64,
        last_triggered_at: last_triggered_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
    })
}
