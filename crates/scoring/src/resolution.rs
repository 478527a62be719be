//! Resolution transaction: scores one forecast exactly once.
//!
//! Everything up to commit runs in a single `BEGIN IMMEDIATE` transaction on
//! the store thread. The Open to Resolved transition is a guarded update, so a
//! concurrent second resolution sees zero affected rows and fails with
//! `AlreadyResolved`. Cache invalidation and publishing happen after commit and
//! never fail the call.

use crate::cache::LeaderboardCache;
use crate::engine::ScoringEngine;
use crate::error::{EngineError, EngineResult};
use crate::events::ResolutionEvent;
use crate::leaderboard;
use crate::outcome::{self, Prediction};
use crate::points::{self, PointsBreakdown, PointsInput};
use crate::store::{load_forecast, load_user};
use chrono::{DateTime, Utc};
use common::config::Scoring;
use common::types::{to_db_timestamp, EventType, LeaderboardCategory, ResolutionData};
use rusqlite::{params, Connection, TransactionBehavior};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Longest accepted declared outcome label.
const MAX_OUTCOME_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub forecast_id: i64,
    pub user_id: i64,
    pub event_type: EventType,
    pub actual_outcome: String,
    pub is_correct: bool,
    pub points_awarded: i64,
    pub breakdown: PointsBreakdown,
    pub new_streak: i64,
    pub resolved_at: DateTime<Utc>,
}

fn validate_request(actual_outcome: &str, data: &ResolutionData) -> EngineResult<String> {
    let actual = actual_outcome.trim();
    if actual.is_empty() {
        return Err(EngineError::validation("actual outcome is empty"));
    }
    if actual.len() > MAX_OUTCOME_LEN {
        return Err(EngineError::validation(format!(
            "actual outcome longer than {MAX_OUTCOME_LEN} bytes"
        )));
    }
    if data.actual_rate.is_some_and(|r| r < Decimal::ZERO) {
        return Err(EngineError::validation("actual rate is negative"));
    }
    Ok(actual.to_string())
}

/// Steps 1 to 6 of a resolution. Dropping the transaction on any early
/// return rolls everything back.
fn resolve_in_tx(
    conn: &mut Connection,
    scoring: &Scoring,
    forecast_id: i64,
    actual_outcome: String,
    data: &ResolutionData,
    resolved_at: DateTime<Utc>,
) -> anyhow::Result<ResolutionResult> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let forecast = load_forecast(&tx, forecast_id)?
        .ok_or_else(|| EngineError::forecast_not_found(forecast_id))?;
    if forecast.is_resolved {
        return Err(EngineError::AlreadyResolved(forecast_id).into());
    }
    let user = load_user(&tx, forecast.user_id)?
        .ok_or_else(|| EngineError::user_not_found(forecast.user_id))?;
    if forecast.confidence > 100 {
        return Err(EngineError::validation(format!(
            "forecast {forecast_id} has confidence {} outside 0..=100",
            forecast.confidence
        ))
        .into());
    }

    let is_correct = outcome::is_correct(
        Prediction {
            event_type: forecast.event_type,
            outcome: &forecast.predicted_outcome,
            value: &forecast.prediction_value,
        },
        &actual_outcome,
        data,
        scoring.fed_rate_tolerance,
    );
    let award = points::calculate(
        scoring,
        &PointsInput {
            event_type: forecast.event_type,
            confidence: forecast.confidence,
            created_at: forecast.created_at,
            expires_at: forecast.expires_at,
            old_streak: user.win_streak,
            is_correct,
        },
    );
    let total = award.breakdown.total;

    let claimed = tx.execute(
        "UPDATE forecasts
         SET actual_outcome = ?1, is_correct = ?2, points_awarded = ?3, is_resolved = 1, resolved_at = ?4
         WHERE id = ?5 AND is_resolved = 0",
        params![
            actual_outcome,
            is_correct,
            total,
            to_db_timestamp(resolved_at),
            forecast_id
        ],
    )?;
    if claimed == 0 {
        return Err(EngineError::AlreadyResolved(forecast_id).into());
    }

    tx.execute(
        "UPDATE users
         SET total_points = total_points + ?1,
             win_streak = ?2,
             correct_predictions = correct_predictions + ?3
         WHERE id = ?4",
        params![total, award.new_streak, i64::from(is_correct), user.id],
    )?;

    leaderboard::refresh_overall(&tx, resolved_at)?;
    tx.commit()?;

    Ok(ResolutionResult {
        forecast_id,
        user_id: user.id,
        event_type: forecast.event_type,
        actual_outcome,
        is_correct,
        points_awarded: total,
        breakdown: award.breakdown,
        new_streak: award.new_streak,
        resolved_at,
    })
}

impl<C: LeaderboardCache> ScoringEngine<C> {
    /// Score a forecast against a declared outcome.
    ///
    /// Fails with `NotFound`, `AlreadyResolved`, `Validation`, or
    /// `StoreUnavailable` (nothing committed; retry is safe).
    pub async fn resolve_forecast(
        &self,
        forecast_id: i64,
        actual_outcome: &str,
        data: &ResolutionData,
    ) -> EngineResult<ResolutionResult> {
        self.resolve_forecast_at(forecast_id, actual_outcome, data, Utc::now())
            .await
    }

    #[tracing::instrument(skip(self, data))]
    pub async fn resolve_forecast_at(
        &self,
        forecast_id: i64,
        actual_outcome: &str,
        data: &ResolutionData,
        resolved_at: DateTime<Utc>,
    ) -> EngineResult<ResolutionResult> {
        let actual = validate_request(actual_outcome, data)?;
        let settings = self.settings.clone();
        let data = data.clone();

        let res = self
            .db
            .call_named("resolution.resolve", move |conn| {
                resolve_in_tx(conn, &settings.scoring, forecast_id, actual, &data, resolved_at)
            })
            .await
            .map_err(EngineError::from_store);

        let result = match res {
            Ok(result) => result,
            Err(e) => {
                metrics::counter!("scoring_resolutions_failed_total", "reason" => e.kind()).increment(1);
                if matches!(e, EngineError::StoreUnavailable(_) | EngineError::Internal(_)) {
                    tracing::error!(forecast_id, error = %e, "resolution failed");
                } else {
                    tracing::debug!(forecast_id, error = %e, "resolution rejected");
                }
                return Err(e);
            }
        };

        let outcome_label = if result.is_correct { "correct" } else { "incorrect" };
        metrics::counter!(
            "scoring_resolutions_total",
            "event_type" => result.event_type.as_str(),
            "result" => outcome_label
        )
        .increment(1);
        metrics::counter!("scoring_points_awarded_total").increment(result.points_awarded.max(0) as u64);
        tracing::info!(
            forecast_id,
            user_id = result.user_id,
            event_type = %result.event_type,
            is_correct = result.is_correct,
            points = result.points_awarded,
            new_streak = result.new_streak,
            "forecast resolved"
        );

        self.after_commit(&result).await;
        Ok(result)
    }

    /// Best-effort follow-up; failures are logged inside each step.
    async fn after_commit(&self, result: &ResolutionResult) {
        self.invalidate_categories(&[
            LeaderboardCategory::Overall,
            LeaderboardCategory::Event(result.event_type),
            LeaderboardCategory::Weekly,
            LeaderboardCategory::Monthly,
        ])
        .await;
        self.invalidate_user_snapshot(result.user_id).await;
        if result.points_awarded > 0 {
            self.invalidate_stats().await;
        }
        self.bus
            .publish(ResolutionEvent::ForecastResolved(result.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{page_key, MemoryCache};
    use crate::engine::EngineSettings;
    use crate::events::ResultBus;
    use crate::store::NewForecast;
    use chrono::Duration;
    use common::db::AsyncDb;
    use common::types::{parse_db_timestamp, PredictedOutcome, PredictionValue};
    use std::sync::Arc;

    async fn engine() -> ScoringEngine<MemoryCache> {
        let db = AsyncDb::open(":memory:").await.unwrap();
        ScoringEngine::new(
            db,
            Arc::new(MemoryCache::new(256)),
            ResultBus::new(16),
            EngineSettings::default(),
        )
    }

    fn t0() -> DateTime<Utc> {
        parse_db_timestamp("2026-05-04T08:30:00Z").unwrap()
    }

    async fn place(
        engine: &ScoringEngine<MemoryCache>,
        user_id: i64,
        event_type: EventType,
        outcome: PredictedOutcome,
        confidence: u8,
        lead: Duration,
    ) -> i64 {
        engine
            .create_forecast(NewForecast {
                user_id,
                event_type,
                predicted_outcome: outcome,
                prediction_value: PredictionValue::default(),
                confidence,
                created_at: t0(),
                expires_at: t0() + lead,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_correct_resolution_updates_user_and_forecast() {
        let engine = engine().await;
        let user = engine.create_user("ana", t0()).await.unwrap();
        let id = place(&engine, user.id, EventType::Cpi, PredictedOutcome::Higher, 80, Duration::days(8)).await;

        let r = engine
            .resolve_forecast(id, "Higher", &ResolutionData::default())
            .await
            .unwrap();
        assert!(r.is_correct);
        assert_eq!(r.breakdown.base_points, 270);
        assert_eq!(r.breakdown.time_bonus, 54);
        assert_eq!(r.breakdown.streak_bonus, 0);
        assert_eq!(r.points_awarded, 324);
        assert_eq!(r.new_streak, 1);

        let user = engine.get_user(user.id).await.unwrap();
        assert_eq!(user.total_points, 324);
        assert_eq!(user.win_streak, 1);
        assert_eq!(user.correct_predictions, 1);

        let f = engine.get_forecast(id).await.unwrap();
        assert!(f.is_resolved);
        assert_eq!(f.is_correct, Some(true));
        assert_eq!(f.actual_outcome.as_deref(), Some("Higher"));
        assert_eq!(f.points_awarded, 324);
        assert!(f.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_streak_builds_then_resets() {
        let engine = engine().await;
        let user = engine.create_user("ana", t0()).await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(place(&engine, user.id, EventType::Custom, PredictedOutcome::Yes, 0, Duration::hours(2)).await);
        }

        let mut totals = Vec::new();
        for id in &ids[..3] {
            totals.push(
                engine
                    .resolve_forecast(*id, "yes", &ResolutionData::default())
                    .await
                    .unwrap()
                    .points_awarded,
            );
        }
        // 100, then 100 + 10, then 100 + round(10 × log2 3).
        assert_eq!(totals, vec![100, 110, 116]);

        let miss = engine
            .resolve_forecast(ids[3], "no", &ResolutionData::default())
            .await
            .unwrap();
        assert!(!miss.is_correct);
        assert_eq!(miss.points_awarded, 0);
        assert_eq!(miss.new_streak, 0);

        let user = engine.get_user(user.id).await.unwrap();
        assert_eq!(user.total_points, 326);
        assert_eq!(user.win_streak, 0);
        assert_eq!(user.correct_predictions, 3);
    }

    #[tokio::test]
    async fn test_second_resolution_is_rejected_without_double_award() {
        let engine = engine().await;
        let user = engine.create_user("ana", t0()).await.unwrap();
        let id = place(&engine, user.id, EventType::Payrolls, PredictedOutcome::Yes, 50, Duration::days(1)).await;

        let first = engine
            .resolve_forecast(id, "yes", &ResolutionData::default())
            .await
            .unwrap();
        let err = engine
            .resolve_forecast(id, "yes", &ResolutionData::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyResolved(x) if x == id));

        let user = engine.get_user(user.id).await.unwrap();
        assert_eq!(user.total_points, first.points_awarded);
    }

    #[tokio::test]
    async fn test_missing_forecast_is_not_found() {
        let engine = engine().await;
        let err = engine
            .resolve_forecast(42, "yes", &ResolutionData::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { entity: "forecast", id: 42 }));
    }

    #[tokio::test]
    async fn test_malformed_request_is_validation_error() {
        let engine = engine().await;
        let err = engine
            .resolve_forecast(1, "   ", &ResolutionData::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let data = ResolutionData {
            actual_rate: Some(Decimal::new(-1, 0)),
            ..Default::default()
        };
        let err = engine.resolve_forecast(1, "cut", &data).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_resolution_publishes_and_invalidates() {
        let engine = engine().await;
        let mut rx = engine.bus().subscribe();
        let user = engine.create_user("ana", t0()).await.unwrap();
        let id = place(&engine, user.id, EventType::Gdp, PredictedOutcome::Lower, 20, Duration::days(3)).await;

        // Warm the overall page cache, then resolve.
        let before = engine
            .get_leaderboard_page(LeaderboardCategory::Overall, 1, 50, None)
            .await
            .unwrap();
        assert_eq!(before.rows[0].points, 0);
        assert!(engine
            .cache
            .get(&page_key(LeaderboardCategory::Overall, 1, 50))
            .await
            .unwrap()
            .is_some());

        let r = engine
            .resolve_forecast(id, "lower", &ResolutionData::default())
            .await
            .unwrap();

        assert!(engine
            .cache
            .get(&page_key(LeaderboardCategory::Overall, 1, 50))
            .await
            .unwrap()
            .is_none());
        let after = engine
            .get_leaderboard_page(LeaderboardCategory::Overall, 1, 50, None)
            .await
            .unwrap();
        assert_eq!(after.rows[0].points, r.points_awarded);

        match rx.recv().await.unwrap() {
            ResolutionEvent::ForecastResolved(published) => assert_eq!(published, r),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expired_outcome_scores_zero() {
        let engine = engine().await;
        let user = engine.create_user("ana", t0()).await.unwrap();
        let id = place(&engine, user.id, EventType::FedRate, PredictedOutcome::Custom("hold".into()), 90, Duration::days(10)).await;

        let r = engine
            .resolve_forecast(id, "expired", &ResolutionData::default())
            .await
            .unwrap();
        assert!(!r.is_correct);
        assert_eq!(r.breakdown, PointsBreakdown::default());
    }

    #[tokio::test]
    async fn test_failure_before_commit_rolls_back_everything() {
        let engine = engine().await;
        let user = engine.create_user("ana", t0()).await.unwrap();
        let won = place(&engine, user.id, EventType::Housing, PredictedOutcome::Yes, 60, Duration::days(2)).await;
        let pending = place(&engine, user.id, EventType::Housing, PredictedOutcome::Yes, 60, Duration::days(2)).await;
        let first = engine
            .resolve_forecast(won, "yes", &ResolutionData::default())
            .await
            .unwrap();

        // Make the user update, the last write before commit, fail.
        engine
            .db()
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER fail_user_points BEFORE UPDATE OF total_points ON users
                     BEGIN SELECT RAISE(ABORT, 'user row locked for audit'); END;",
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let err = engine
            .resolve_forecast(pending, "yes", &ResolutionData::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)), "got {err:?}");

        let f = engine.get_forecast(pending).await.unwrap();
        assert!(!f.is_resolved);
        assert_eq!(f.points_awarded, 0);
        assert_eq!(f.actual_outcome, None);
        assert_eq!(f.resolved_at, None);

        let user = engine.get_user(user.id).await.unwrap();
        assert_eq!(user.total_points, first.points_awarded);
        assert_eq!(user.win_streak, 1);
        assert_eq!(user.correct_predictions, 1);
    }
}
