//! Append-only audit sinks for sensor, capability, and energy events.
//!
//! Two stores share one trait: a JSON-lines text file and a SQLite table.
//! `log` never propagates an error to the emitting thread (a failed audit
//! write must not take down a sensor or runtime loop); failures are traced
//! and the row is dropped. `summarize` and `prune` surface their errors to
//! the caller, and `close` is idempotent on every sink.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit store failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("audit row encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One audited event. `sensor_type`/`capability`/`detail` are populated by
/// whichever subsystem emits the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRow {
    pub ts_ns: u64,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditRow {
    /// Stamp a row with the current wall clock.
    pub fn new(action: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            ts_ns: now_ts_ns(),
            action: action.into(),
            sensor_type: None,
            capability: None,
            actor: actor.into(),
            detail: None,
        }
    }

    pub fn with_sensor_type(mut self, sensor_type: impl Into<String>) -> Self {
        self.sensor_type = Some(sensor_type.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditSummary {
    pub total: u64,
    pub by_action: BTreeMap<String, u64>,
    pub by_sensor: BTreeMap<String, u64>,
}

/// Shared contract for audit stores. Implementations must tolerate `log`
/// from multiple threads and repeated `close` calls.
pub trait AuditSink: Send + Sync {
    fn log(&self, row: &AuditRow);
    fn summarize(&self) -> Result<AuditSummary, AuditError>;
    fn prune(&self, max_rows: u64) -> Result<u64, AuditError>;
    fn close(&self);
}

/// Discards every row; the default when no sink is configured.
#[derive(Debug, Default)]
pub struct NullSink;

impl AuditSink for NullSink {
    fn log(&self, _row: &AuditRow) {}

    fn summarize(&self) -> Result<AuditSummary, AuditError> {
        Ok(AuditSummary::default())
    }

    fn prune(&self, _max_rows: u64) -> Result<u64, AuditError> {
        Ok(0)
    }

    fn close(&self) {}
}

/// One compact JSON object per line, append-only.
pub struct JsonlSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    fn append(&self, row: &AuditRow) -> Result<(), AuditError> {
        let line = serde_json::to_string(row)?;
        let _guard = lock_or_recover(&self.lock);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    fn read_rows(&self) -> Result<Vec<String>, AuditError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut rows = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                rows.push(line);
            }
        }
        Ok(rows)
    }
}

impl AuditSink for JsonlSink {
    fn log(&self, row: &AuditRow) {
        if let Err(error) = self.append(row) {
            warn!(target: "audit.jsonl", %error, "dropping audit row");
        }
    }

    fn summarize(&self) -> Result<AuditSummary, AuditError> {
        let _guard = lock_or_recover(&self.lock);
        let mut summary = AuditSummary::default();
        for line in self.read_rows()? {
            // Malformed lines are skipped rather than failing the report.
            let Ok(row) = serde_json::from_str::<AuditRow>(&line) else {
                continue;
            };
            summary.total += 1;
            *summary.by_action.entry(row.action).or_insert(0) += 1;
            *summary
                .by_sensor
                .entry(row.sensor_type.unwrap_or_default())
                .or_insert(0) += 1;
        }
        Ok(summary)
    }

    fn prune(&self, max_rows: u64) -> Result<u64, AuditError> {
        if max_rows == 0 {
            return Ok(0);
        }
        let _guard = lock_or_recover(&self.lock);
        let rows = self.read_rows()?;
        let keep = max_rows as usize;
        if rows.len() <= keep {
            return Ok(0);
        }
        let removed = rows.len() - keep;
        let mut file = File::create(&self.path)?;
        for row in &rows[removed..] {
            file.write_all(row.as_bytes())?;
            file.write_all(b"\n")?;
        }
        Ok(removed as u64)
    }

    fn close(&self) {}
}

/// Relational store over a single `audit_events` table.
pub struct SqliteSink {
    conn: Mutex<Option<Connection>>,
}

impl SqliteSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts_ns INTEGER NOT NULL,
                action TEXT NOT NULL,
                sensor_type TEXT NOT NULL DEFAULT '',
                actor TEXT NOT NULL,
                payload_json TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn insert(&self, row: &AuditRow) -> Result<(), AuditError> {
        let payload = serde_json::to_string(row)?;
        let guard = lock_or_recover(&self.conn);
        let Some(conn) = guard.as_ref() else {
            return Ok(());
        };
        conn.execute(
            "INSERT INTO audit_events (ts_ns, action, sensor_type, actor, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                row.ts_ns as i64,
                row.action,
                row.sensor_type.as_deref().unwrap_or(""),
                row.actor,
                payload,
            ],
        )?;
        Ok(())
    }
}

impl AuditSink for SqliteSink {
    fn log(&self, row: &AuditRow) {
        if let Err(error) = self.insert(row) {
            warn!(target: "audit.sqlite", %error, "dropping audit row");
        }
    }

    fn summarize(&self) -> Result<AuditSummary, AuditError> {
        let guard = lock_or_recover(&self.conn);
        let Some(conn) = guard.as_ref() else {
            return Ok(AuditSummary::default());
        };
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM audit_events", [], |r| r.get(0))?;
        let mut summary = AuditSummary {
            total: total as u64,
            ..AuditSummary::default()
        };
        let mut stmt =
            conn.prepare("SELECT action, COUNT(*) FROM audit_events GROUP BY action")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (action, count) = row?;
            summary.by_action.insert(action, count as u64);
        }
        let mut stmt =
            conn.prepare("SELECT sensor_type, COUNT(*) FROM audit_events GROUP BY sensor_type")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (sensor, count) = row?;
            summary.by_sensor.insert(sensor, count as u64);
        }
        Ok(summary)
    }

    fn prune(&self, max_rows: u64) -> Result<u64, AuditError> {
        if max_rows == 0 {
            return Ok(0);
        }
        let guard = lock_or_recover(&self.conn);
        let Some(conn) = guard.as_ref() else {
            return Ok(0);
        };
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM audit_events", [], |r| r.get(0))?;
        let overflow = total - max_rows as i64;
        if overflow <= 0 {
            return Ok(0);
        }
        conn.execute(
            "DELETE FROM audit_events WHERE id IN
             (SELECT id FROM audit_events ORDER BY id ASC LIMIT ?1)",
            rusqlite::params![overflow],
        )?;
        Ok(overflow as u64)
    }

    fn close(&self) {
        let mut guard = lock_or_recover(&self.conn);
        if let Some(conn) = guard.take()
            && let Err((_conn, error)) = conn.close()
        {
            warn!(target: "audit.sqlite", %error, "close failed");
        }
    }
}

impl Drop for SqliteSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock_or_recover<T>(lock: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn now_ts_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn sensor_row(action: &str, sensor: &str) -> AuditRow {
        AuditRow::new(action, "test").with_sensor_type(sensor)
    }

    #[test]
    fn jsonl_sink_logs_and_summarizes() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::new(dir.path().join("audit.jsonl")).unwrap();
        sink.log(&sensor_row("enabled", "thermal.temperature"));
        sink.log(&sensor_row("enabled", "sensor.motion"));
        sink.log(&sensor_row("disabled", "thermal.temperature"));
        let summary = sink.summarize().unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_action.get("enabled"), Some(&2));
        assert_eq!(summary.by_sensor.get("thermal.temperature"), Some(&2));
    }

    #[test]
    fn jsonl_summarize_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlSink::new(&path).unwrap();
        sink.log(&sensor_row("enabled", "thermal.temperature"));
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"not json\n")
            .unwrap();
        assert_eq!(sink.summarize().unwrap().total, 1);
    }

    #[test]
    fn jsonl_prune_keeps_newest_rows() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::new(dir.path().join("audit.jsonl")).unwrap();
        for i in 0..5 {
            sink.log(&sensor_row(&format!("a{i}"), "s"));
        }
        assert_eq!(sink.prune(2).unwrap(), 3);
        let summary = sink.summarize().unwrap();
        assert_eq!(summary.total, 2);
        assert!(summary.by_action.contains_key("a4"));
        assert!(!summary.by_action.contains_key("a0"));
        assert_eq!(sink.prune(2).unwrap(), 0);
    }

    #[test]
    fn sqlite_sink_round_trips_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteSink::open(dir.path().join("audit.db")).unwrap();
        for i in 0..4 {
            sink.log(&sensor_row("enabled", &format!("sensor{i}")));
        }
        let summary = sink.summarize().unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.by_action.get("enabled"), Some(&4));
        assert_eq!(sink.prune(1).unwrap(), 3);
        let summary = sink.summarize().unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.by_sensor.get("sensor3"), Some(&1));
    }

    #[test]
    fn sqlite_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteSink::open(dir.path().join("audit.db")).unwrap();
        sink.log(&sensor_row("enabled", "s"));
        sink.close();
        sink.close();
        // A closed sink degrades to a no-op store.
        sink.log(&sensor_row("enabled", "s"));
        assert_eq!(sink.summarize().unwrap().total, 0);
    }

    #[test]
    fn concurrent_logging_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(JsonlSink::new(dir.path().join("audit.jsonl")).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let sink = Arc::clone(&sink);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        sink.log(&sensor_row(&format!("t{t}"), &format!("s{i}")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sink.summarize().unwrap().total, 100);
    }
}
