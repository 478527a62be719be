use crate::cache::{user_snapshot_key, LeaderboardCache};
use crate::engine::ScoringEngine;
use crate::error::{EngineError, EngineResult};
use crate::leaderboard::accuracy_percentage;
use common::types::EventType;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Track record over resolved forecasts. Expired forecasts count as incorrect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccuracy {
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,
    pub total: i64,
    pub correct: i64,
    pub accuracy_percentage: f64,
    pub avg_confidence: f64,
    pub total_points: i64,
}

impl<C: LeaderboardCache> ScoringEngine<C> {
    /// Unfiltered results are cached as the user's snapshot until their next resolution.
    pub async fn get_user_accuracy(
        &self,
        user_id: i64,
        event_type: Option<EventType>,
    ) -> EngineResult<UserAccuracy> {
        let key = user_snapshot_key(user_id);
        if event_type.is_none() {
            if let Some(snapshot) = self
                .cache_get(&key)
                .await
                .and_then(|json| serde_json::from_str::<UserAccuracy>(&json).ok())
            {
                return Ok(snapshot);
            }
        }

        let filter = event_type.map(|t| t.as_str());
        let accuracy = self
            .db
            .call_bounded("accuracy.user", self.settings.query_timeout, move |conn| {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
                    [user_id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Err(EngineError::user_not_found(user_id).into());
                }

                let (total, correct, avg_confidence, total_points) = conn.query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(is_correct), 0),
                            COALESCE(AVG(confidence), 0.0),
                            COALESCE(SUM(points_awarded), 0)
                     FROM forecasts
                     WHERE user_id = ?1 AND is_resolved = 1
                       AND (?2 IS NULL OR event_type = ?2)",
                    params![user_id, filter],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )?;

                Ok(UserAccuracy {
                    user_id,
                    event_type,
                    total,
                    correct,
                    accuracy_percentage: accuracy_percentage(correct, total),
                    avg_confidence: (avg_confidence * 100.0).round() / 100.0,
                    total_points,
                })
            })
            .await
            .map_err(EngineError::from_store)?;

        if event_type.is_none() {
            if let Ok(json) = serde_json::to_string(&accuracy) {
                let ttl = Duration::from_secs(self.settings.leaderboard.cache_ttl_secs);
                self.cache_set(&key, json, ttl).await;
            }
        }
        Ok(accuracy)
    }
}
