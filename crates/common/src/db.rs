use anyhow::Result;
use rusqlite::Connection;
use std::time::Duration;

/// Store failures that are safe to retry: nothing was committed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database connection closed")]
    ConnectionClosed,
    #[error("store call {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
}

/// Async database wrapper around `tokio_rusqlite::Connection`.
///
/// Runs all SQLite operations on a dedicated background thread via
/// `tokio_rusqlite`, keeping the Tokio runtime cooperative. Clone is
/// cheap (shared mpsc sender to the background thread).
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open a database at `path`, set PRAGMAs (WAL, foreign keys, busy_timeout),
    /// and apply the schema, all on the background thread.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;

        // Schema setup needs the write lock and can race with another process
        // holding it (a second scoring instance, an operator sqlite3 shell).
        // Retry with backoff instead of failing startup, using a short
        // busy_timeout per attempt so the backoff stays in Rust.
        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(30);
        let max_total_wait = Duration::from_secs(10 * 60);
        let start = std::time::Instant::now();

        loop {
            let res = conn
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(Duration::from_secs(1))?;
                    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                    apply_schema(conn)?;
                    // Runtime writers wait longer for the lock than startup does.
                    conn.busy_timeout(Duration::from_secs(30))?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err)) => {
                    if !is_locked(&err) {
                        return Err(anyhow::Error::from(err).context("AsyncDb::open: schema setup failed"));
                    }

                    if start.elapsed() >= max_total_wait {
                        return Err(anyhow::Error::from(err).context(
                            "AsyncDb::open: schema setup failed (database stayed locked too long)",
                        ));
                    }

                    tracing::warn!(
                        wait_for = ?backoff,
                        "AsyncDb::open: database is locked; retrying schema setup"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
            }
        }

        Ok(Self { conn })
    }

    /// Run a closure on the background SQLite thread and return the result.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => StoreError::ConnectionClosed.into(),
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records Prometheus metrics for DB latency and errors.
    ///
    /// Latency covers queueing on the SQLite thread plus execution of all SQL
    /// in the closure.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        let status = if res.is_ok() { "ok" } else { "err" };
        metrics::histogram!(
            "scoring_db_query_latency_ms",
            "op" => op,
            "status" => status
        )
        .record(ms);
        if res.is_err() {
            metrics::counter!("scoring_db_query_errors_total", "op" => op).increment(1);
        }

        res
    }

    /// Like [`Self::call_named`], but gives up waiting after `limit`.
    ///
    /// Only for reads: the closure keeps running on the SQLite thread after a
    /// timeout, so a write issued here could still commit.
    pub async fn call_bounded<F, R>(&self, op: &'static str, limit: Duration, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        match tokio::time::timeout(limit, self.call_named(op, function)).await {
            Ok(res) => res,
            Err(_elapsed) => {
                metrics::counter!("scoring_db_query_timeouts_total", "op" => op).increment(1);
                Err(StoreError::Timeout { op, after: limit }.into())
            }
        }
    }
}

fn is_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy | rusqlite::ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

/// True when the store could not be reached or locked in time. Such failures
/// never leave a partial commit behind and are safe to retry.
pub fn is_unavailable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<StoreError>().is_some()
            || cause.downcast_ref::<rusqlite::Error>().is_some_and(is_locked)
    })
}

/// Create tables, indexes and guards, then bring older databases up to date.
/// Idempotent.
pub fn apply_schema(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)?;
    migrate_forecasts_is_correct(conn)?;
    conn.execute_batch(RESOLVED_IMMUTABLE_TRIGGER)?;
    Ok(())
}

/// Add forecasts.is_correct if missing (databases created before correctness was stored).
/// Backfills it from points for already-resolved rows; the immutability trigger
/// is dropped for the backfill and recreated by [`apply_schema`].
fn migrate_forecasts_is_correct(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    let has: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info('forecasts') WHERE name='is_correct'",
        [],
        |row| row.get(0),
    )?;
    if has == 0 {
        conn.execute_batch(
            "DROP TRIGGER IF EXISTS trg_forecasts_resolved_immutable;
             ALTER TABLE forecasts ADD COLUMN is_correct INTEGER;
             UPDATE forecasts SET is_correct = (points_awarded > 0) WHERE is_resolved = 1;",
        )?;
    }
    Ok(())
}

const RESOLVED_IMMUTABLE_TRIGGER: &str = r"
CREATE TRIGGER IF NOT EXISTS trg_forecasts_resolved_immutable
BEFORE UPDATE ON forecasts
WHEN OLD.is_resolved = 1
BEGIN
    SELECT RAISE(ABORT, 'forecast is resolved and immutable');
END;
";

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    total_points INTEGER NOT NULL DEFAULT 0,
    win_streak INTEGER NOT NULL DEFAULT 0 CHECK (win_streak >= 0),
    total_predictions INTEGER NOT NULL DEFAULT 0,
    correct_predictions INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL          -- fixed-width RFC 3339 UTC, leaderboard tie-break
);

CREATE TABLE IF NOT EXISTS forecasts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    event_type TEXT NOT NULL,         -- cpi, unemployment, fed_rate, gdp, ...
    predicted_outcome TEXT NOT NULL,  -- yes/no/higher/lower/same or a custom label
    prediction_value TEXT NOT NULL,   -- JSON, tagged by kind
    confidence INTEGER NOT NULL CHECK (confidence BETWEEN 0 AND 100),
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    is_resolved INTEGER NOT NULL DEFAULT 0,
    actual_outcome TEXT,
    is_correct INTEGER,               -- NULL until resolved
    points_awarded INTEGER NOT NULL DEFAULT 0,
    resolved_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_forecasts_open_expiry ON forecasts(is_resolved, expires_at);
CREATE INDEX IF NOT EXISTS idx_forecasts_user ON forecasts(user_id);
CREATE INDEX IF NOT EXISTS idx_forecasts_event_resolved ON forecasts(event_type, is_resolved);
CREATE INDEX IF NOT EXISTS idx_forecasts_resolved_at ON forecasts(resolved_at);

-- Resolved forecasts may be neither edited nor deleted.
CREATE TRIGGER IF NOT EXISTS trg_forecasts_resolved_undeletable
BEFORE DELETE ON forecasts
WHEN OLD.is_resolved = 1
BEGIN
    SELECT RAISE(ABORT, 'forecast is resolved and immutable');
END;

-- Persisted rows exist for `overall` only; other categories rank on read.
CREATE TABLE IF NOT EXISTS leaderboard_entries (
    user_id INTEGER NOT NULL REFERENCES users(id),
    category TEXT NOT NULL,
    points INTEGER NOT NULL DEFAULT 0,
    rank INTEGER NOT NULL DEFAULT 0,
    total_predictions INTEGER NOT NULL DEFAULT 0,
    accuracy_percentage REAL NOT NULL DEFAULT 0.0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, category)
);

CREATE INDEX IF NOT EXISTS idx_leaderboard_category_rank ON leaderboard_entries(category, rank);

CREATE TABLE IF NOT EXISTS job_status (
    job_name TEXT PRIMARY KEY,
    status TEXT NOT NULL,             -- running, idle, failed
    last_run_at TEXT,
    duration_ms INTEGER,
    last_error TEXT,
    metadata TEXT,                    -- JSON
    updated_at TEXT NOT NULL
);
";
