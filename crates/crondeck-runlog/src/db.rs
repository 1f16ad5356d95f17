use rusqlite::{Connection, Result};
use tracing::warn;

/// Initialise the run log table. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_log_table(conn)?;
    dedupe_runs(conn)?;
    create_run_key_index(conn)?;
    Ok(())
}

fn create_log_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS log (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            job               TEXT NOT NULL,
            triggered_at      TEXT NOT NULL,
            triggered_by      TEXT NOT NULL,
            duration          INTEGER,
            status            INTEGER,
            message           TEXT NOT NULL DEFAULT '',
            retry_attempt     INTEGER NOT NULL DEFAULT 0,
            retries_exhausted INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_log_job
            ON log(job, id);",
    )
}

/// Databases written before the unique key existed can hold several rows per
/// run. Keep the earliest of each so the unique index can be created.
fn dedupe_runs(conn: &Connection) -> Result<()> {
    let removed = conn.execute(
        "DELETE FROM log WHERE id NOT IN (
            SELECT MIN(id) FROM log GROUP BY job, triggered_at, triggered_by
        )",
        [],
    )?;
    if removed > 0 {
        warn!(removed, "removed duplicate run log rows");
    }
    Ok(())
}

fn create_run_key_index(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_log_run_key
            ON log(job, triggered_at, triggered_by);",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn legacy_duplicates_are_collapsed() {
        let conn = Connection::open_in_memory().unwrap();
        create_log_table(&conn).unwrap();
        for msg in ["first", "second", "third"] {
            conn.execute(
                "INSERT INTO log (job, triggered_at, triggered_by, status, message)
                 VALUES ('a', '2024-01-01T00:00:00Z', 'cron', 0, ?1)",
                [msg],
            )
            .unwrap();
        }
        conn.execute(
            "INSERT INTO log (job, triggered_at, triggered_by, status, message)
             VALUES ('a', '2024-01-01T00:01:00Z', 'cron', 0, 'other')",
            [],
        )
        .unwrap();

        init_db(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
        let kept: String = conn
            .query_row(
                "SELECT message FROM log WHERE triggered_at = '2024-01-01T00:00:00Z'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(kept, "first");

        let dup = conn.execute(
            "INSERT INTO log (job, triggered_at, triggered_by)
             VALUES ('a', '2024-01-01T00:01:00Z', 'cron')",
            [],
        );
        assert!(dup.is_err(), "unique key must be enforced");
    }
}
