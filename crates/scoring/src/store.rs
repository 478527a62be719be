//! Row mapping and the forecast/user lifecycle.

use crate::cache::{user_snapshot_key, LeaderboardCache, STATS_KEY};
use crate::engine::ScoringEngine;
use crate::error::{EngineError, EngineResult};
use crate::leaderboard;
use crate::outcome;
use chrono::{DateTime, Utc};
use common::types::{
    parse_db_timestamp, to_db_timestamp, EventType, Forecast, PredictedOutcome, PredictionValue,
    User,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;

pub(crate) const FORECAST_COLUMNS: &str = "id, user_id, event_type, predicted_outcome, prediction_value, confidence, created_at, expires_at, is_resolved, actual_outcome, is_correct, points_awarded, resolved_at";

pub(crate) const USER_COLUMNS: &str =
    "id, username, total_points, win_streak, total_predictions, correct_predictions, created_at";

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_timestamp(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        parse_db_timestamp(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

pub(crate) fn forecast_from_row(row: &Row<'_>) -> rusqlite::Result<Forecast> {
    let event_type: String = row.get(2)?;
    let predicted: String = row.get(3)?;
    let value_json: String = row.get(4)?;
    let prediction_value: PredictionValue = serde_json::from_str(&value_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    Ok(Forecast {
        id: row.get(0)?,
        user_id: row.get(1)?,
        event_type: EventType::from_str_loose(&event_type),
        predicted_outcome: PredictedOutcome::from_str_loose(&predicted),
        prediction_value,
        confidence: row.get(5)?,
        created_at: timestamp_at(row, 6)?,
        expires_at: timestamp_at(row, 7)?,
        is_resolved: row.get(8)?,
        actual_outcome: row.get(9)?,
        is_correct: row.get(10)?,
        points_awarded: row.get(11)?,
        resolved_at: opt_timestamp_at(row, 12)?,
    })
}

pub(crate) fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        total_points: row.get(2)?,
        win_streak: row.get(3)?,
        total_predictions: row.get(4)?,
        correct_predictions: row.get(5)?,
        created_at: timestamp_at(row, 6)?,
    })
}

pub(crate) fn load_forecast(conn: &Connection, id: i64) -> rusqlite::Result<Option<Forecast>> {
    conn.query_row(
        &format!("SELECT {FORECAST_COLUMNS} FROM forecasts WHERE id = ?1"),
        [id],
        forecast_from_row,
    )
    .optional()
}

pub(crate) fn load_user(conn: &Connection, id: i64) -> rusqlite::Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        [id],
        user_from_row,
    )
    .optional()
}

/// A forecast to be placed. Stored Open.
#[derive(Debug, Clone, Deserialize)]
pub struct NewForecast {
    pub user_id: i64,
    pub event_type: EventType,
    pub predicted_outcome: PredictedOutcome,
    #[serde(default)]
    pub prediction_value: PredictionValue,
    pub confidence: u8,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Edits allowed while a forecast is Open.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForecastUpdate {
    pub confidence: Option<u8>,
    pub prediction_value: Option<PredictionValue>,
}

fn validate_confidence(confidence: u8) -> EngineResult<()> {
    if confidence > 100 {
        return Err(EngineError::validation(format!(
            "confidence {confidence} outside 0..=100"
        )));
    }
    Ok(())
}

fn validate_value(event_type: EventType, value: &PredictionValue) -> EngineResult<()> {
    if !value.fits(event_type) {
        return Err(EngineError::validation(format!(
            "prediction value {value:?} does not apply to {event_type}"
        )));
    }
    Ok(())
}

fn validate_new_forecast(f: &NewForecast) -> EngineResult<()> {
    validate_confidence(f.confidence)?;
    validate_value(f.event_type, &f.prediction_value)?;
    if f.expires_at <= f.created_at {
        return Err(EngineError::validation("expires_at must be after created_at"));
    }
    if outcome::is_expired(f.predicted_outcome.as_str()) {
        return Err(EngineError::validation(
            "predicted outcome may not be the reserved label `expired`",
        ));
    }
    if f.predicted_outcome.as_str().trim().is_empty() {
        return Err(EngineError::validation("predicted outcome is empty"));
    }
    Ok(())
}

impl<C: LeaderboardCache> ScoringEngine<C> {
    /// Register a user with a zero `overall` standing.
    pub async fn create_user(&self, username: &str, created_at: DateTime<Utc>) -> EngineResult<User> {
        let username = username.trim().to_string();
        if username.is_empty() {
            return Err(EngineError::validation("username is empty"));
        }

        let user = self
            .db
            .call_named("users.create", move |conn| {
                let tx = conn.transaction()?;
                let taken: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
                    [&username],
                    |row| row.get(0),
                )?;
                if taken {
                    return Err(EngineError::validation(format!("username {username} is taken")).into());
                }
                tx.execute(
                    "INSERT INTO users (username, created_at) VALUES (?1, ?2)",
                    params![username, to_db_timestamp(created_at)],
                )?;
                let id = tx.last_insert_rowid();
                leaderboard::refresh_overall(&tx, created_at)?;
                let user = load_user(&tx, id)?.ok_or_else(|| EngineError::user_not_found(id))?;
                tx.commit()?;
                Ok(user)
            })
            .await
            .map_err(EngineError::from_store)?;

        tracing::info!(user_id = user.id, username = %user.username, "user created");
        self.invalidate_overall_and_stats().await;
        Ok(user)
    }

    pub async fn create_forecast(&self, new: NewForecast) -> EngineResult<Forecast> {
        validate_new_forecast(&new)?;

        let forecast = self
            .db
            .call_named("forecasts.create", move |conn| {
                let tx = conn.transaction()?;
                if load_user(&tx, new.user_id)?.is_none() {
                    return Err(EngineError::user_not_found(new.user_id).into());
                }
                tx.execute(
                    "INSERT INTO forecasts (user_id, event_type, predicted_outcome, prediction_value, confidence, created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        new.user_id,
                        new.event_type.as_str(),
                        new.predicted_outcome.as_str(),
                        serde_json::to_string(&new.prediction_value)?,
                        new.confidence,
                        to_db_timestamp(new.created_at),
                        to_db_timestamp(new.expires_at),
                    ],
                )?;
                let id = tx.last_insert_rowid();
                adjust_total_predictions(&tx, new.user_id, 1)?;
                let forecast = load_forecast(&tx, id)?.ok_or_else(|| EngineError::forecast_not_found(id))?;
                tx.commit()?;
                Ok(forecast)
            })
            .await
            .map_err(EngineError::from_store)?;

        tracing::info!(
            forecast_id = forecast.id,
            user_id = forecast.user_id,
            event_type = %forecast.event_type,
            "forecast created"
        );
        self.invalidate_overall_pages().await;
        Ok(forecast)
    }

    /// Edit an Open forecast. Resolved forecasts fail with `AlreadyResolved`.
    pub async fn update_open_forecast(&self, id: i64, update: ForecastUpdate) -> EngineResult<Forecast> {
        if let Some(confidence) = update.confidence {
            validate_confidence(confidence)?;
        }

        self.db
            .call_named("forecasts.update_open", move |conn| {
                let tx = conn.transaction()?;
                let current = load_forecast(&tx, id)?.ok_or_else(|| EngineError::forecast_not_found(id))?;
                if current.is_resolved {
                    return Err(EngineError::AlreadyResolved(id).into());
                }
                let value = update.prediction_value.unwrap_or(current.prediction_value);
                validate_value(current.event_type, &value)?;
                let confidence = update.confidence.unwrap_or(current.confidence);

                let changed = tx.execute(
                    "UPDATE forecasts SET confidence = ?1, prediction_value = ?2
                     WHERE id = ?3 AND is_resolved = 0",
                    params![confidence, serde_json::to_string(&value)?, id],
                )?;
                if changed == 0 {
                    return Err(EngineError::AlreadyResolved(id).into());
                }
                let forecast = load_forecast(&tx, id)?.ok_or_else(|| EngineError::forecast_not_found(id))?;
                tx.commit()?;
                Ok(forecast)
            })
            .await
            .map_err(EngineError::from_store)
    }

    /// Withdraw an Open forecast. Resolved forecasts fail with `AlreadyResolved`.
    pub async fn delete_open_forecast(&self, id: i64) -> EngineResult<()> {
        let user_id = self
            .db
            .call_named("forecasts.delete_open", move |conn| {
                let tx = conn.transaction()?;
                let current = load_forecast(&tx, id)?.ok_or_else(|| EngineError::forecast_not_found(id))?;
                if current.is_resolved {
                    return Err(EngineError::AlreadyResolved(id).into());
                }
                let removed = tx.execute("DELETE FROM forecasts WHERE id = ?1 AND is_resolved = 0", [id])?;
                if removed == 0 {
                    return Err(EngineError::AlreadyResolved(id).into());
                }
                adjust_total_predictions(&tx, current.user_id, -1)?;
                tx.commit()?;
                Ok(current.user_id)
            })
            .await
            .map_err(EngineError::from_store)?;

        tracing::info!(forecast_id = id, user_id, "open forecast withdrawn");
        self.invalidate_overall_pages().await;
        Ok(())
    }

    pub async fn get_forecast(&self, id: i64) -> EngineResult<Forecast> {
        self.db
            .call_bounded("forecasts.get", self.settings.query_timeout, move |conn| {
                load_forecast(conn, id)?.ok_or_else(|| EngineError::forecast_not_found(id).into())
            })
            .await
            .map_err(EngineError::from_store)
    }

    pub async fn get_user(&self, id: i64) -> EngineResult<User> {
        self.db
            .call_bounded("users.get", self.settings.query_timeout, move |conn| {
                load_user(conn, id)?.ok_or_else(|| EngineError::user_not_found(id).into())
            })
            .await
            .map_err(EngineError::from_store)
    }

    async fn invalidate_overall_and_stats(&self) {
        self.invalidate_overall_pages().await;
        self.cache_delete(STATS_KEY).await;
    }

    async fn invalidate_overall_pages(&self) {
        self.invalidate_categories(&[common::types::LeaderboardCategory::Overall])
            .await;
    }

    pub(crate) async fn invalidate_user_snapshot(&self, user_id: i64) {
        self.cache_delete(&user_snapshot_key(user_id)).await;
    }
}

/// Keep the user's prediction count and its `overall` mirror in step.
fn adjust_total_predictions(conn: &Connection, user_id: i64, delta: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE users SET total_predictions = MAX(total_predictions + ?1, 0) WHERE id = ?2",
        params![delta, user_id],
    )?;
    conn.execute(
        "UPDATE leaderboard_entries
         SET total_predictions = (SELECT total_predictions FROM users WHERE id = ?1),
             updated_at = ?2
         WHERE user_id = ?1 AND category = 'overall'",
        params![user_id, to_db_timestamp(Utc::now())],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::engine::EngineSettings;
    use crate::events::ResultBus;
    use chrono::Duration;
    use common::db::AsyncDb;
    use std::sync::Arc;

    async fn engine() -> ScoringEngine<MemoryCache> {
        let db = AsyncDb::open(":memory:").await.unwrap();
        ScoringEngine::new(
            db,
            Arc::new(MemoryCache::new(64)),
            ResultBus::new(8),
            EngineSettings::default(),
        )
    }

    fn t0() -> DateTime<Utc> {
        parse_db_timestamp("2026-04-01T09:00:00Z").unwrap()
    }

    fn cpi_forecast(user_id: i64) -> NewForecast {
        NewForecast {
            user_id,
            event_type: EventType::Cpi,
            predicted_outcome: PredictedOutcome::Higher,
            prediction_value: PredictionValue::Threshold {
                threshold: rust_decimal::Decimal::new(1, 1),
            },
            confidence: 70,
            created_at: t0(),
            expires_at: t0() + Duration::days(4),
        }
    }

    #[tokio::test]
    async fn test_create_user_gets_overall_row() {
        let engine = engine().await;
        let user = engine.create_user("ana", t0()).await.unwrap();
        assert_eq!(user.total_points, 0);
        assert_eq!(user.created_at, t0());

        let rank = engine
            .get_user_rank(common::types::LeaderboardCategory::Overall, user.id)
            .await
            .unwrap();
        assert_eq!(rank, Some(1));
    }

    #[tokio::test]
    async fn test_duplicate_username_is_validation_error() {
        let engine = engine().await;
        engine.create_user("ana", t0()).await.unwrap();
        let err = engine.create_user("ana", t0()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_create_forecast_counts_prediction() {
        let engine = engine().await;
        let user = engine.create_user("ana", t0()).await.unwrap();
        let f = engine.create_forecast(cpi_forecast(user.id)).await.unwrap();

        assert!(!f.is_resolved);
        assert_eq!(f.confidence, 70);
        assert_eq!(f.prediction_value.threshold(), rust_decimal::Decimal::new(1, 1));
        assert_eq!(engine.get_user(user.id).await.unwrap().total_predictions, 1);
        assert_eq!(engine.get_forecast(f.id).await.unwrap(), f);
    }

    #[tokio::test]
    async fn test_create_forecast_rejects_bad_input() {
        let engine = engine().await;
        let user = engine.create_user("ana", t0()).await.unwrap();

        let mut bad = cpi_forecast(user.id);
        bad.confidence = 101;
        assert!(matches!(
            engine.create_forecast(bad).await,
            Err(EngineError::Validation(_))
        ));

        let mut bad = cpi_forecast(user.id);
        bad.expires_at = bad.created_at;
        assert!(matches!(
            engine.create_forecast(bad).await,
            Err(EngineError::Validation(_))
        ));

        let mut bad = cpi_forecast(user.id);
        bad.prediction_value = PredictionValue::Rate {
            rate: rust_decimal::Decimal::new(525, 2),
        };
        assert!(matches!(
            engine.create_forecast(bad).await,
            Err(EngineError::Validation(_))
        ));

        let mut bad = cpi_forecast(user.id);
        bad.predicted_outcome = PredictedOutcome::Custom("Expired".into());
        assert!(matches!(
            engine.create_forecast(bad).await,
            Err(EngineError::Validation(_))
        ));

        assert!(matches!(
            engine.create_forecast(cpi_forecast(999)).await,
            Err(EngineError::NotFound { entity: "user", id: 999 })
        ));
    }

    #[tokio::test]
    async fn test_update_and_delete_open_forecast() {
        let engine = engine().await;
        let user = engine.create_user("ana", t0()).await.unwrap();
        let f = engine.create_forecast(cpi_forecast(user.id)).await.unwrap();

        let updated = engine
            .update_open_forecast(
                f.id,
                ForecastUpdate {
                    confidence: Some(90),
                    prediction_value: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.confidence, 90);
        assert_eq!(updated.prediction_value, f.prediction_value);

        engine.delete_open_forecast(f.id).await.unwrap();
        assert!(matches!(
            engine.get_forecast(f.id).await,
            Err(EngineError::NotFound { entity: "forecast", .. })
        ));
        assert_eq!(engine.get_user(user.id).await.unwrap().total_predictions, 0);
    }

    #[tokio::test]
    async fn test_resolved_forecast_is_frozen() {
        let engine = engine().await;
        let user = engine.create_user("ana", t0()).await.unwrap();
        let f = engine.create_forecast(cpi_forecast(user.id)).await.unwrap();
        engine
            .resolve_forecast(f.id, "higher", &Default::default())
            .await
            .unwrap();

        let err = engine
            .update_open_forecast(
                f.id,
                ForecastUpdate {
                    confidence: Some(10),
                    prediction_value: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyResolved(id) if id == f.id));

        let err = engine.delete_open_forecast(f.id).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyResolved(_)));
        assert_eq!(engine.get_user(user.id).await.unwrap().total_predictions, 1);
    }

    #[tokio::test]
    async fn test_missing_rows_are_not_found() {
        let engine = engine().await;
        assert!(matches!(
            engine.get_user(5).await,
            Err(EngineError::NotFound { entity: "user", id: 5 })
        ));
        assert!(matches!(
            engine.delete_open_forecast(5).await,
            Err(EngineError::NotFound { entity: "forecast", id: 5 })
        ));
    }
}
