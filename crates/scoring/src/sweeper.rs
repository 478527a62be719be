//! Expiry sweep: forecasts past their deadline are resolved as `expired`.
//!
//! Each forecast is resolved independently through the normal resolution
//! path. A failure on one row is recorded in the report and the batch moves on.

use crate::cache::LeaderboardCache;
use crate::engine::ScoringEngine;
use crate::error::{EngineError, EngineResult};
use crate::events::ResolutionEvent;
use crate::jobs::JobTracker;
use chrono::{DateTime, Utc};
use common::types::{to_db_timestamp, ResolutionData, EXPIRED_OUTCOME};
use serde::Serialize;

pub const SWEEP_JOB_NAME: &str = "expiry_sweep";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub resolved_count: u64,
    /// Resolved by someone else between selection and resolution.
    pub skipped_count: u64,
    pub errors: Vec<SweepFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    /// `None` when the candidate query itself failed.
    pub forecast_id: Option<i64>,
    pub error: String,
}

impl<C: LeaderboardCache> ScoringEngine<C> {
    pub async fn run_expiry_sweep(&self) -> SweepReport {
        self.run_expiry_sweep_at(Utc::now()).await
    }

    /// Resolve every Open forecast with `expires_at < now`. Never fails as a
    /// whole; problems are listed in the report.
    pub async fn run_expiry_sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let tracker = match JobTracker::start(&self.db, SWEEP_JOB_NAME).await {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!(error = %e, "could not record sweep start");
                None
            }
        };

        let mut report = SweepReport::default();
        match self.expired_candidates(now).await {
            Ok(ids) => {
                tracing::info!(candidates = ids.len(), "expiry sweep started");
                for id in ids {
                    match self
                        .resolve_forecast_at(id, EXPIRED_OUTCOME, &ResolutionData::default(), now)
                        .await
                    {
                        Ok(_) => report.resolved_count += 1,
                        Err(EngineError::AlreadyResolved(_)) => report.skipped_count += 1,
                        Err(e) => {
                            tracing::warn!(forecast_id = id, error = %e, "expiry resolution failed");
                            report.errors.push(SweepFailure {
                                forecast_id: Some(id),
                                error: e.to_string(),
                            });
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "expiry sweep could not list candidates");
                report.errors.push(SweepFailure {
                    forecast_id: None,
                    error: e.to_string(),
                });
            }
        }

        metrics::counter!("scoring_sweep_resolved_total").increment(report.resolved_count);
        metrics::counter!("scoring_sweep_errors_total").increment(report.errors.len() as u64);
        tracing::info!(
            resolved = report.resolved_count,
            skipped = report.skipped_count,
            failed = report.errors.len(),
            "expiry sweep finished"
        );

        if let Some(tracker) = tracker {
            let meta = serde_json::json!({
                "resolved": report.resolved_count,
                "skipped": report.skipped_count,
                "failed": report.errors.len(),
            });
            let recorded = if report.errors.is_empty() {
                tracker.success(Some(meta)).await
            } else {
                let summary = format!("{} forecast(s) failed to expire", report.errors.len());
                tracker.fail(&summary, Some(meta)).await
            };
            if let Err(e) = recorded {
                tracing::warn!(error = %e, "could not record sweep result");
            }
        }

        self.bus.publish(ResolutionEvent::SweepCompleted {
            resolved: report.resolved_count,
            skipped: report.skipped_count,
            failed: report.errors.len() as u64,
            completed_at: Utc::now(),
        });
        report
    }

    async fn expired_candidates(&self, now: DateTime<Utc>) -> EngineResult<Vec<i64>> {
        let cutoff = to_db_timestamp(now);
        self.db
            .call_bounded("sweeper.expired_candidates", self.settings.query_timeout, move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id FROM forecasts
                     WHERE is_resolved = 0 AND expires_at < ?1
                     ORDER BY expires_at ASC, id ASC",
                )?;
                let ids = stmt
                    .query_map([cutoff], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<i64>>>()?;
                Ok(ids)
            })
            .await
            .map_err(EngineError::from_store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, MemoryCache};
    use crate::engine::EngineSettings;
    use crate::events::ResultBus;
    use crate::store::NewForecast;
    use chrono::Duration;
    use common::db::AsyncDb;
    use common::types::{parse_db_timestamp, EventType, PredictedOutcome, PredictionValue};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        parse_db_timestamp("2026-06-01T00:00:00Z").unwrap()
    }

    async fn engine() -> ScoringEngine<MemoryCache> {
        let db = AsyncDb::open(":memory:").await.unwrap();
        ScoringEngine::new(
            db,
            Arc::new(MemoryCache::new(64)),
            ResultBus::new(8),
            EngineSettings::default(),
        )
    }

    async fn place<C: LeaderboardCache>(engine: &ScoringEngine<C>, user_id: i64, expires_in: Duration) -> i64 {
        engine
            .create_forecast(NewForecast {
                user_id,
                event_type: EventType::Housing,
                predicted_outcome: PredictedOutcome::Yes,
                prediction_value: PredictionValue::default(),
                confidence: 75,
                created_at: t0(),
                expires_at: t0() + expires_in,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_sweep_expires_only_past_deadline() {
        let engine = engine().await;
        let user = engine.create_user("ana", t0()).await.unwrap();
        let due = place(&engine, user.id, Duration::days(1)).await;
        let later = place(&engine, user.id, Duration::days(10)).await;

        let report = engine.run_expiry_sweep_at(t0() + Duration::days(2)).await;
        assert_eq!(report.resolved_count, 1);
        assert!(report.errors.is_empty());

        let f = engine.get_forecast(due).await.unwrap();
        assert!(f.is_resolved);
        assert_eq!(f.actual_outcome.as_deref(), Some(EXPIRED_OUTCOME));
        assert_eq!(f.is_correct, Some(false));
        assert_eq!(f.points_awarded, 0);
        assert!(!engine.get_forecast(later).await.unwrap().is_resolved);
    }

    #[tokio::test]
    async fn test_sweep_resets_streak() {
        let engine = engine().await;
        let user = engine.create_user("ana", t0()).await.unwrap();
        let win = place(&engine, user.id, Duration::days(5)).await;
        let stale = place(&engine, user.id, Duration::days(1)).await;
        engine
            .resolve_forecast_at(win, "yes", &ResolutionData::default(), t0() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(engine.get_user(user.id).await.unwrap().win_streak, 1);

        engine.run_expiry_sweep_at(t0() + Duration::days(2)).await;
        let user = engine.get_user(user.id).await.unwrap();
        assert_eq!(user.win_streak, 0);
        assert!(engine.get_forecast(stale).await.unwrap().is_resolved);
    }

    #[tokio::test]
    async fn test_deadline_equal_to_now_is_not_expired() {
        let engine = engine().await;
        let user = engine.create_user("ana", t0()).await.unwrap();
        place(&engine, user.id, Duration::days(1)).await;

        let report = engine.run_expiry_sweep_at(t0() + Duration::days(1)).await;
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_sweep_records_job_status() {
        let engine = engine().await;
        engine.run_expiry_sweep_at(t0()).await;

        let status: String = engine
            .db()
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT status FROM job_status WHERE job_name = ?1",
                    [SWEEP_JOB_NAME],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(status, "idle");
    }

    #[tokio::test]
    async fn test_one_bad_row_does_not_abort_batch() {
        let engine = engine().await;
        let user = engine.create_user("ana", t0()).await.unwrap();
        let bad = place(&engine, user.id, Duration::days(1)).await;
        let good = place(&engine, user.id, Duration::days(1)).await;

        // Corrupt one stored payload so loading it fails.
        engine
            .db()
            .call(move |conn| {
                conn.execute(
                    "UPDATE forecasts SET prediction_value = 'not json' WHERE id = ?1",
                    [bad],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let report = engine.run_expiry_sweep_at(t0() + Duration::days(3)).await;
        assert_eq!(report.resolved_count, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].forecast_id, Some(bad));
        assert!(engine.get_forecast(good).await.unwrap().is_resolved);
    }

    /// Resolves a pending forecast behind the sweep's back on the first
    /// cache delete, i.e. right after the sweep's first commit.
    struct ConcurrentResolver {
        db: AsyncDb,
        target: Mutex<Option<i64>>,
    }

    impl LeaderboardCache for ConcurrentResolver {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Ok(None)
        }

        async fn set(&self, _key: &str, _value: String, _ttl: std::time::Duration) -> Result<(), CacheError> {
            Ok(())
        }

        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            let target = self.target.lock().take();
            if let Some(id) = target {
                self.db
                    .call(move |conn| {
                        conn.execute(
                            "UPDATE forecasts
                             SET is_resolved = 1, actual_outcome = 'no', is_correct = 0, resolved_at = ?2
                             WHERE id = ?1",
                            rusqlite::params![id, to_db_timestamp(t0())],
                        )?;
                        Ok(())
                    })
                    .await
                    .map_err(|e| CacheError::Unavailable(e.to_string()))?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_forecast_resolved_elsewhere_mid_sweep_is_skipped() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let resolver = ConcurrentResolver {
            db: db.clone(),
            target: Mutex::new(None),
        };
        let engine = ScoringEngine::new(db, Arc::new(resolver), ResultBus::new(8), EngineSettings::default());
        let user = engine.create_user("ana", t0()).await.unwrap();
        let first = place(&engine, user.id, Duration::days(1)).await;
        let second = place(&engine, user.id, Duration::days(1)).await;
        *engine.cache.target.lock() = Some(second);

        let report = engine.run_expiry_sweep_at(t0() + Duration::days(2)).await;
        assert_eq!(report.resolved_count, 1);
        assert_eq!(report.skipped_count, 1);
        assert!(report.errors.is_empty());

        assert_eq!(
            engine.get_forecast(first).await.unwrap().actual_outcome.as_deref(),
            Some(EXPIRED_OUTCOME)
        );
        // The other resolver's outcome stands.
        assert_eq!(
            engine.get_forecast(second).await.unwrap().actual_outcome.as_deref(),
            Some("no")
        );
    }
}
