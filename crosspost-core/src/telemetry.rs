use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;

use crate::config::CrosspostConfig;
use crate::pipeline::{PipelineRun, PublishAttempt};

pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Attempts from concurrent tasks share one database file.
fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One line of `attempts.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub ts: DateTime<Utc>,
    pub run_id: String,
    pub platform: String,
    pub state: String,
    pub retry_count: u32,
    pub asset_ref: Option<String>,
    pub artifact: Option<String>,
    pub failure_kind: Option<String>,
    pub error: Option<String>,
    pub diagnostic: Option<String>,
    pub transitions: Vec<String>,
}

impl AttemptRecord {
    fn from_attempt(run_id: &str, attempt: &PublishAttempt) -> Self {
        Self {
            ts: Utc::now(),
            run_id: run_id.to_string(),
            platform: attempt.platform.to_string(),
            state: attempt.state.to_string(),
            retry_count: attempt.retry_count,
            asset_ref: attempt.asset_ref.clone(),
            artifact: attempt.artifact.as_ref().map(|a| a.reference.clone()),
            failure_kind: attempt.failure_kind().map(|kind| kind.to_string()),
            error: attempt.last_error.as_ref().map(|e| e.message.clone()),
            diagnostic: attempt.diagnostic.as_ref().map(|d| d.reference()),
            transitions: attempt
                .history
                .iter()
                .map(|change| change.state.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRow {
    pub run_id: String,
    pub platform: String,
    pub kind: String,
    pub message: String,
    pub diagnostic: Option<String>,
}

/// Append-only record of publish attempts: a JSON-lines log for humans and a
/// SQLite database for queries.
#[derive(Debug)]
pub struct PublishTelemetry {
    log: Mutex<File>,
    db_path: PathBuf,
    flags: OpenFlags,
}

impl PublishTelemetry {
    pub fn new(log_path: impl AsRef<Path>, db_path: impl AsRef<Path>) -> TelemetryResult<Self> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let telemetry = Self {
            log: Mutex::new(file),
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        telemetry.initialize_db()?;
        Ok(telemetry)
    }

    pub fn from_config(config: &CrosspostConfig) -> TelemetryResult<Self> {
        let logs = config.logs_dir();
        Self::new(logs.join("attempts.jsonl"), logs.join("telemetry.sqlite"))
    }

    fn initialize_db(&self) -> TelemetryResult<()> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS publish_runs (
                run_id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                platforms TEXT NOT NULL,
                overall_state TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS publish_attempts (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                run_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                state TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                asset_ref TEXT,
                artifact_ref TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_publish_attempts_run ON publish_attempts(run_id);
            CREATE TABLE IF NOT EXISTS publish_failures (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                run_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                diagnostic_ref TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_publish_failures_ts ON publish_failures(ts DESC);",
        )?;
        Ok(())
    }

    fn open_db(&self) -> TelemetryResult<Connection> {
        let conn = Connection::open_with_flags(&self.db_path, self.flags)?;
        configure_connection(&conn)?;
        Ok(conn)
    }

    pub fn record_attempt(&self, run_id: &str, attempt: &PublishAttempt) -> TelemetryResult<()> {
        let record = AttemptRecord::from_attempt(run_id, attempt);
        let json = serde_json::to_string(&record)?;
        if let Ok(mut guard) = self.log.lock() {
            writeln!(guard, "{json}")?;
            guard.flush()?;
        }
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO publish_attempts (run_id, platform, state, retry_count, asset_ref, artifact_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.run_id,
                record.platform,
                record.state,
                record.retry_count as i64,
                record.asset_ref,
                record.artifact,
            ],
        )?;
        if let (Some(kind), Some(message)) = (&record.failure_kind, &record.error) {
            conn.execute(
                "INSERT INTO publish_failures (run_id, platform, kind, message, diagnostic_ref)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![record.run_id, record.platform, kind, message, record.diagnostic],
            )?;
        }
        Ok(())
    }

    pub fn record_run(&self, run: &PipelineRun) -> TelemetryResult<()> {
        let platforms = run
            .requested_platforms
            .iter()
            .map(|platform| platform.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let conn = self.open_db()?;
        conn.execute(
            "INSERT OR REPLACE INTO publish_runs (run_id, started_at, finished_at, platforms, overall_state)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.run_id,
                run.started_at.to_rfc3339(),
                run.finished_at.map(|at| at.to_rfc3339()),
                platforms,
                run.overall_state().as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn recent_failures(&self, limit: usize) -> TelemetryResult<Vec<FailureRow>> {
        let conn = self.open_db()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, platform, kind, message, diagnostic_ref FROM publish_failures
             ORDER BY ts DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(FailureRow {
                run_id: row.get(0)?,
                platform: row.get(1)?,
                kind: row.get(2)?,
                message: row.get(3)?,
                diagnostic: row.get(4)?,
            })
        })?;
        let mut failures = Vec::new();
        for row in rows {
            failures.push(row?);
        }
        Ok(failures)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }
}
