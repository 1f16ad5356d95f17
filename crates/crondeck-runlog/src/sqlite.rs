use std::{path::Path, time::Duration};

use chrono::{DateTime, SecondsFormat};
use crondeck_core::JobRun;
use parking_lot::Mutex;
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::{
    db::init_db,
    error::Result,
    sink::RunLogSink,
};

/// SQLite-backed run log.
///
/// One connection behind a mutex; every statement is short, so writers from
/// concurrently running jobs simply queue.
pub struct SqliteRunLog {
    db: Mutex<Connection>,
}

impl SqliteRunLog {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!(path = %path.display(), "run log opened");
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }
}

/// Run keys compare as text, so the timestamp format must be stable.
fn encode_timestamp(run: &JobRun) -> String {
    run.triggered_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn row_to_run(row: &Row<'_>, include_log: bool) -> rusqlite::Result<JobRun> {
    let raw: String = row.get("triggered_at")?;
    let triggered_at = DateTime::parse_from_rfc3339(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
    })?;
    let duration: Option<i64> = row.get("duration")?;
    Ok(JobRun {
        id: Some(row.get("id")?),
        name: row.get("job")?,
        status: row.get("status")?,
        log: if include_log {
            row.get("message")?
        } else {
            String::new()
        },
        triggered_at,
        triggered_by: row.get("triggered_by")?,
        triggered: Vec::new(),
        triggered_by_job_run: None,
        duration: duration.map(|ms| Duration::from_millis(ms.max(0) as u64)),
        retry_attempt: row.get("retry_attempt")?,
        retries_exhausted: row.get("retries_exhausted")?,
        cancelled: false,
    })
}

const SELECT_COLUMNS: &str = "SELECT id, job, triggered_at, triggered_by, duration, status,
        message, retry_attempt, retries_exhausted FROM log";

impl RunLogSink for SqliteRunLog {
    fn upsert(&self, run: &JobRun) -> Result<i64> {
        let db = self.db.lock();
        let duration = run.duration.map(|d| d.as_millis() as i64);
        let id: i64 = db.query_row(
            "INSERT INTO log
             (job, triggered_at, triggered_by, duration, status, message,
              retry_attempt, retries_exhausted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(job, triggered_at, triggered_by) DO UPDATE SET
                duration = excluded.duration,
                status = excluded.status,
                message = excluded.message,
                retry_attempt = excluded.retry_attempt,
                retries_exhausted = excluded.retries_exhausted
             RETURNING id",
            params![
                run.name,
                encode_timestamp(run),
                run.triggered_by,
                duration,
                run.status,
                run.log,
                run.retry_attempt,
                run.retries_exhausted,
            ],
            |row| row.get(0),
        )?;
        debug!(job = %run.name, id, status = ?run.status, "run log row written");
        Ok(id)
    }

    fn last_run(&self, job: &str) -> Result<Option<JobRun>> {
        let db = self.db.lock();
        let row = db
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE job = ?1 ORDER BY id DESC LIMIT 1"),
                [job],
                |row| row_to_run(row, true),
            )
            .optional()?;
        Ok(row)
    }

    fn run_by_id(&self, id: i64) -> Result<Option<JobRun>> {
        let db = self.db.lock();
        let row = db
            .query_row(&format!("{SELECT_COLUMNS} WHERE id = ?1"), [id], |row| {
                row_to_run(row, true)
            })
            .optional()?;
        Ok(row)
    }

    fn recent_runs(&self, job: &str, limit: usize, include_log: bool) -> Result<Vec<JobRun>> {
        let db = self.db.lock();
        let mut stmt = db.prepare_cached(&format!(
            "{SELECT_COLUMNS} WHERE job = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let runs = stmt
            .query_map(params![job, limit as i64], |row| row_to_run(row, include_log))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }
}
