//! Run bookkeeping for periodic jobs in `job_status`.

use anyhow::Result;
use chrono::Utc;
use common::db::AsyncDb;
use common::types::to_db_timestamp;
use std::time::Instant;

pub struct JobTracker {
    db: AsyncDb,
    job_name: String,
    start_time: Instant,
}

impl JobTracker {
    pub async fn start(db: &AsyncDb, job_name: &str) -> Result<Self> {
        let name = job_name.to_string();
        db.call_named("job_tracker.start", move |conn| {
            let now = to_db_timestamp(Utc::now());
            conn.execute(
                "INSERT INTO job_status (job_name, status, last_run_at, updated_at)
                 VALUES (?1, 'running', ?2, ?2)
                 ON CONFLICT(job_name) DO UPDATE SET
                    status = 'running',
                    last_run_at = ?2,
                    updated_at = ?2,
                    last_error = NULL,
                    duration_ms = NULL",
                rusqlite::params![name, now],
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            db: db.clone(),
            job_name: job_name.to_string(),
            start_time: Instant::now(),
        })
    }

    pub async fn success(self, metadata: Option<serde_json::Value>) -> Result<()> {
        let duration_ms = self.start_time.elapsed().as_millis() as i64;
        let name = self.job_name;
        let meta_str = metadata.map(|v| v.to_string());

        self.db
            .call_named("job_tracker.success", move |conn| {
                conn.execute(
                    "UPDATE job_status SET
                        status = 'idle',
                        duration_ms = ?2,
                        metadata = ?3,
                        updated_at = ?4
                     WHERE job_name = ?1",
                    rusqlite::params![name, duration_ms, meta_str, to_db_timestamp(Utc::now())],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn fail(self, error: &str, metadata: Option<serde_json::Value>) -> Result<()> {
        let duration_ms = self.start_time.elapsed().as_millis() as i64;
        let name = self.job_name;
        let error_msg = error.to_string();
        let meta_str = metadata.map(|v| v.to_string());

        self.db
            .call_named("job_tracker.fail", move |conn| {
                conn.execute(
                    "UPDATE job_status SET
                        status = 'failed',
                        duration_ms = ?2,
                        last_error = ?3,
                        metadata = ?4,
                        updated_at = ?5
                     WHERE job_name = ?1",
                    rusqlite::params![name, duration_ms, error_msg, meta_str, to_db_timestamp(Utc::now())],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
