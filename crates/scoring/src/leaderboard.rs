//! Leaderboard ranking.
//!
//! `overall` is persisted in `leaderboard_entries` and re-ranked inside every
//! transaction that changes a user's totals. Per-indicator and rolling-window
//! categories are aggregated from resolved forecasts on read.
//!
//! Order is points descending, then account `created_at` ascending, then user
//! id ascending. Ranks are 1..N with no shared values.

use crate::cache::{category_keys, page_key, LeaderboardCache, STATS_KEY};
use crate::engine::{EngineSettings, ScoringEngine};
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Duration, Utc};
use common::types::{to_db_timestamp, LeaderboardCategory};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::time::Duration as StdDuration;

/// Consecutive failed deletes after which a category's invalidation gives up.
const INVALIDATION_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardRow {
    pub rank: i64,
    pub user_id: i64,
    pub username: String,
    pub points: i64,
    pub total_predictions: i64,
    pub correct_predictions: i64,
    pub accuracy_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardPage {
    pub category: LeaderboardCategory,
    pub page: u32,
    pub page_size: u32,
    pub rows: Vec<LeaderboardRow>,
    pub total_count: i64,
    /// Filled per request; never cached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_rank: Option<i64>,
}

/// One user's unranked totals within a category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Standing {
    pub user_id: i64,
    pub username: String,
    pub points: i64,
    /// Stored timestamp text; fixed width, so it sorts chronologically.
    pub created_at: String,
    pub total_predictions: i64,
    pub correct_predictions: i64,
    pub resolved: i64,
}

pub fn sort_standings(standings: &mut [Standing]) {
    standings.sort_by(|a, b| {
        b.points
            .cmp(&a.points)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
}

pub fn rank_standings(mut standings: Vec<Standing>) -> Vec<LeaderboardRow> {
    sort_standings(&mut standings);
    standings
        .into_iter()
        .zip(1_i64..)
        .map(|(s, rank)| LeaderboardRow {
            rank,
            accuracy_percentage: accuracy_percentage(s.correct_predictions, s.resolved),
            user_id: s.user_id,
            username: s.username,
            points: s.points,
            total_predictions: s.total_predictions,
            correct_predictions: s.correct_predictions,
        })
        .collect()
}

/// Percentage with two decimals; zero when nothing is resolved.
pub fn accuracy_percentage(correct: i64, resolved: i64) -> f64 {
    if resolved <= 0 {
        return 0.0;
    }
    (correct as f64 * 10_000.0 / resolved as f64).round() / 100.0
}

const OVERALL_STANDINGS: &str =
    "SELECT u.id, u.username, u.total_points, u.created_at, u.total_predictions, u.correct_predictions,
            (SELECT COUNT(*) FROM forecasts f WHERE f.user_id = u.id AND f.is_resolved = 1)
     FROM users u";

fn standing_from_row(row: &Row<'_>) -> rusqlite::Result<Standing> {
    Ok(Standing {
        user_id: row.get(0)?,
        username: row.get(1)?,
        points: row.get(2)?,
        created_at: row.get(3)?,
        total_predictions: row.get(4)?,
        correct_predictions: row.get(5)?,
        resolved: row.get(6)?,
    })
}

/// Recompute and persist every `overall` rank from current user totals.
/// Unchanged rows are left untouched. Returns the number of ranked users.
pub fn refresh_overall(conn: &Connection, now: DateTime<Utc>) -> rusqlite::Result<usize> {
    let standings = {
        let mut stmt = conn.prepare_cached(OVERALL_STANDINGS)?;
        let rows = stmt
            .query_map([], standing_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };
    let ranked = rank_standings(standings);

    let updated_at = to_db_timestamp(now);
    let mut upsert = conn.prepare_cached(
        "INSERT INTO leaderboard_entries (user_id, category, points, rank, total_predictions, accuracy_percentage, updated_at)
         VALUES (?1, 'overall', ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(user_id, category) DO UPDATE SET
            points = excluded.points,
            rank = excluded.rank,
            total_predictions = excluded.total_predictions,
            accuracy_percentage = excluded.accuracy_percentage,
            updated_at = excluded.updated_at
         WHERE leaderboard_entries.points != excluded.points
            OR leaderboard_entries.rank != excluded.rank
            OR leaderboard_entries.total_predictions != excluded.total_predictions
            OR leaderboard_entries.accuracy_percentage != excluded.accuracy_percentage",
    )?;
    for row in &ranked {
        upsert.execute(params![
            row.user_id,
            row.points,
            row.rank,
            row.total_predictions,
            row.accuracy_percentage,
            updated_at,
        ])?;
    }
    Ok(ranked.len())
}

/// Aggregate standings for a category that is not persisted.
pub fn computed_standings(
    conn: &Connection,
    category: LeaderboardCategory,
    settings: &EngineSettings,
    now: DateTime<Utc>,
) -> rusqlite::Result<Vec<Standing>> {
    const SELECT: &str = "SELECT u.id, u.username, COALESCE(SUM(f.points_awarded), 0), u.created_at,
                COUNT(*), COALESCE(SUM(f.is_correct), 0), COUNT(*)
         FROM forecasts f JOIN users u ON u.id = f.user_id";

    let lb = &settings.leaderboard;
    match category {
        LeaderboardCategory::Overall => {
            let mut stmt = conn.prepare_cached(OVERALL_STANDINGS)?;
            let rows = stmt.query_map([], standing_from_row)?.collect();
            rows
        }
        LeaderboardCategory::Event(event_type) => {
            let mut stmt = conn.prepare_cached(&format!(
                "{SELECT}
                 WHERE f.is_resolved = 1 AND f.event_type = ?1
                 GROUP BY u.id, u.username, u.created_at
                 HAVING COUNT(*) >= ?2"
            ))?;
            let rows = stmt
                .query_map(
                    params![event_type.as_str(), lb.event_type_min_resolved],
                    standing_from_row,
                )?
                .collect();
            rows
        }
        LeaderboardCategory::Weekly | LeaderboardCategory::Monthly => {
            let days = if category == LeaderboardCategory::Weekly {
                lb.weekly_window_days
            } else {
                lb.monthly_window_days
            };
            let cutoff = to_db_timestamp(now - Duration::days(days));
            let mut stmt = conn.prepare_cached(&format!(
                "{SELECT}
                 WHERE f.is_resolved = 1 AND f.resolved_at >= ?1
                 GROUP BY u.id, u.username, u.created_at
                 HAVING SUM(CASE WHEN f.points_awarded > 0 THEN 1 ELSE 0 END) >= 1"
            ))?;
            let rows = stmt.query_map([cutoff], standing_from_row)?.collect();
            rows
        }
    }
}

fn overall_page(conn: &Connection, page: u32, page_size: u32) -> rusqlite::Result<(Vec<LeaderboardRow>, i64)> {
    let offset = i64::from(page - 1) * i64::from(page_size);
    let mut stmt = conn.prepare_cached(
        "SELECT le.rank, le.user_id, u.username, le.points, le.total_predictions, u.correct_predictions, le.accuracy_percentage
         FROM leaderboard_entries le JOIN users u ON u.id = le.user_id
         WHERE le.category = 'overall'
         ORDER BY le.rank ASC
         LIMIT ?1 OFFSET ?2",
    )?;
    let rows = stmt
        .query_map(params![page_size, offset], |row| {
            Ok(LeaderboardRow {
                rank: row.get(0)?,
                user_id: row.get(1)?,
                username: row.get(2)?,
                points: row.get(3)?,
                total_predictions: row.get(4)?,
                correct_predictions: row.get(5)?,
                accuracy_percentage: row.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM leaderboard_entries WHERE category = 'overall'",
        [],
        |row| row.get(0),
    )?;
    Ok((rows, total))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Novice,
    Analyst,
    Strategist,
    Oracle,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Self::Novice, Self::Analyst, Self::Strategist, Self::Oracle];

    pub fn min_points(self) -> i64 {
        match self {
            Self::Novice => 0,
            Self::Analyst => 500,
            Self::Strategist => 2000,
            Self::Oracle => 5000,
        }
    }

    pub fn for_points(points: i64) -> Self {
        Self::ALL
            .into_iter()
            .rev()
            .find(|t| points >= t.min_points())
            .unwrap_or(Self::Novice)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCount {
    pub tier: Tier,
    pub min_points: i64,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardStats {
    pub total_users: i64,
    pub tiers: Vec<TierCount>,
}

fn tier_counts(conn: &Connection) -> rusqlite::Result<LeaderboardStats> {
    let mut stmt = conn.prepare_cached(
        "SELECT CASE
                    WHEN total_points >= ?3 THEN 3
                    WHEN total_points >= ?2 THEN 2
                    WHEN total_points >= ?1 THEN 1
                    ELSE 0
                END AS tier_idx,
                COUNT(*)
         FROM users
         GROUP BY tier_idx",
    )?;
    let mut counts = [0_i64; 4];
    let rows = stmt.query_map(
        params![
            Tier::Analyst.min_points(),
            Tier::Strategist.min_points(),
            Tier::Oracle.min_points()
        ],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
    )?;
    for row in rows {
        let (idx, count) = row?;
        if let Some(slot) = usize::try_from(idx).ok().and_then(|i| counts.get_mut(i)) {
            *slot = count;
        }
    }

    Ok(LeaderboardStats {
        total_users: counts.iter().sum(),
        tiers: Tier::ALL
            .into_iter()
            .zip(counts)
            .map(|(tier, count)| TierCount {
                tier,
                min_points: tier.min_points(),
                count,
            })
            .collect(),
    })
}

impl<C: LeaderboardCache> ScoringEngine<C> {
    pub fn clamp_paging(&self, page: u32, page_size: u32) -> (u32, u32) {
        let lb = &self.settings.leaderboard;
        let page_size = match page_size {
            0 => lb.default_page_size,
            n => n.min(lb.max_page_size),
        };
        (page.max(1), page_size)
    }

    pub async fn get_leaderboard_page(
        &self,
        category: LeaderboardCategory,
        page: u32,
        page_size: u32,
        requester: Option<i64>,
    ) -> EngineResult<LeaderboardPage> {
        self.leaderboard_page(category, page, page_size, requester, Utc::now(), true)
            .await
    }

    /// Like [`Self::get_leaderboard_page`], with rolling windows measured back
    /// from `now`. Weekly and monthly pages are computed from the store, since
    /// a cached page belongs to the instant it was built at.
    pub async fn get_leaderboard_page_at(
        &self,
        category: LeaderboardCategory,
        page: u32,
        page_size: u32,
        requester: Option<i64>,
        now: DateTime<Utc>,
    ) -> EngineResult<LeaderboardPage> {
        let cacheable = !matches!(
            category,
            LeaderboardCategory::Weekly | LeaderboardCategory::Monthly
        );
        self.leaderboard_page(category, page, page_size, requester, now, cacheable)
            .await
    }

    async fn leaderboard_page(
        &self,
        category: LeaderboardCategory,
        page: u32,
        page_size: u32,
        requester: Option<i64>,
        now: DateTime<Utc>,
        cacheable: bool,
    ) -> EngineResult<LeaderboardPage> {
        let (page, page_size) = self.clamp_paging(page, page_size);
        let key = page_key(category, page, page_size);

        let cached = if cacheable {
            self.cache_get(&key)
                .await
                .and_then(|json| match serde_json::from_str::<LeaderboardPage>(&json) {
                    Ok(p) => Some(p),
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "discarding undecodable cached page");
                        None
                    }
                })
        } else {
            None
        };

        let mut result = match cached {
            Some(p) => p,
            None => {
                let p = self.load_page(category, page, page_size, now).await?;
                if cacheable {
                    match serde_json::to_string(&p) {
                        Ok(json) => {
                            let ttl = StdDuration::from_secs(self.settings.leaderboard.cache_ttl_secs);
                            self.cache_set(&key, json, ttl).await;
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to encode leaderboard page for cache"),
                    }
                }
                p
            }
        };

        result.requester_rank = match requester {
            Some(user_id) => self.get_user_rank_at(category, user_id, now).await?,
            None => None,
        };
        Ok(result)
    }

    async fn load_page(
        &self,
        category: LeaderboardCategory,
        page: u32,
        page_size: u32,
        now: DateTime<Utc>,
    ) -> EngineResult<LeaderboardPage> {
        let timeout = self.settings.query_timeout;
        let loaded = if category == LeaderboardCategory::Overall {
            self.db
                .call_bounded("leaderboard.overall_page", timeout, move |conn| {
                    Ok(overall_page(conn, page, page_size)?)
                })
                .await
        } else {
            let settings = self.settings.clone();
            self.db
                .call_bounded("leaderboard.category_page", timeout, move |conn| {
                    let ranked = rank_standings(computed_standings(conn, category, &settings, now)?);
                    let total = ranked.len() as i64;
                    let start = (page as usize - 1).saturating_mul(page_size as usize);
                    let rows = ranked.into_iter().skip(start).take(page_size as usize).collect();
                    Ok((rows, total))
                })
                .await
        };
        let (rows, total_count) = loaded.map_err(EngineError::from_store)?;

        metrics::counter!("scoring_leaderboard_pages_computed_total", "category" => category.key())
            .increment(1);
        Ok(LeaderboardPage {
            category,
            page,
            page_size,
            rows,
            total_count,
            requester_rank: None,
        })
    }

    pub async fn get_user_rank(&self, category: LeaderboardCategory, user_id: i64) -> EngineResult<Option<i64>> {
        self.get_user_rank_at(category, user_id, Utc::now()).await
    }

    pub async fn get_user_rank_at(
        &self,
        category: LeaderboardCategory,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<i64>> {
        let timeout = self.settings.query_timeout;
        if category == LeaderboardCategory::Overall {
            return self
                .db
                .call_bounded("leaderboard.overall_rank", timeout, move |conn| {
                    Ok(conn
                        .query_row(
                            "SELECT rank FROM leaderboard_entries WHERE user_id = ?1 AND category = 'overall'",
                            [user_id],
                            |row| row.get(0),
                        )
                        .optional()?)
                })
                .await
                .map_err(EngineError::from_store);
        }

        let settings = self.settings.clone();
        self.db
            .call_bounded("leaderboard.category_rank", timeout, move |conn| {
                let ranked = rank_standings(computed_standings(conn, category, &settings, now)?);
                Ok(ranked.iter().find(|r| r.user_id == user_id).map(|r| r.rank))
            })
            .await
            .map_err(EngineError::from_store)
    }

    /// Population per points tier, cached under the longer stats TTL.
    pub async fn get_leaderboard_stats(&self) -> EngineResult<LeaderboardStats> {
        if let Some(stats) = self
            .cache_get(STATS_KEY)
            .await
            .and_then(|json| serde_json::from_str::<LeaderboardStats>(&json).ok())
        {
            return Ok(stats);
        }

        let stats = self
            .db
            .call_bounded("leaderboard.stats", self.settings.query_timeout, |conn| {
                Ok(tier_counts(conn)?)
            })
            .await
            .map_err(EngineError::from_store)?;

        if let Ok(json) = serde_json::to_string(&stats) {
            let ttl = StdDuration::from_secs(self.settings.leaderboard.stats_cache_ttl_secs);
            self.cache_set(STATS_KEY, json, ttl).await;
        }
        Ok(stats)
    }

    /// Re-rank a category now. `overall` is rewritten in the store; other
    /// categories rank on read, so only their cached pages are dropped.
    /// Returns the number of ranked users.
    pub async fn refresh_leaderboard(&self, category: LeaderboardCategory) -> EngineResult<usize> {
        let now = Utc::now();
        let ranked = if category == LeaderboardCategory::Overall {
            self.db
                .call_named("leaderboard.refresh_overall", move |conn| {
                    let tx = conn.transaction()?;
                    let n = refresh_overall(&tx, now)?;
                    tx.commit()?;
                    Ok(n)
                })
                .await
                .map_err(EngineError::from_store)?
        } else {
            let settings = self.settings.clone();
            self.db
                .call_bounded("leaderboard.count", self.settings.query_timeout, move |conn| {
                    Ok(computed_standings(conn, category, &settings, now)?.len())
                })
                .await
                .map_err(EngineError::from_store)?
        };

        self.invalidate_categories(&[category]).await;
        tracing::debug!(category = %category, ranked, "leaderboard refreshed");
        Ok(ranked)
    }

    /// Drop the known page keys for each category. A failed delete moves on
    /// to the next key; after `INVALIDATION_FAILURE_LIMIT` consecutive
    /// failures the rest of that category is left to its TTL.
    pub(crate) async fn invalidate_categories(&self, categories: &[LeaderboardCategory]) {
        let lb = &self.settings.leaderboard;
        let mut sizes = lb.invalidate_page_sizes.clone();
        if !sizes.contains(&lb.default_page_size) {
            sizes.push(lb.default_page_size);
        }

        for &category in categories {
            let mut consecutive_failures = 0;
            for key in category_keys(category, lb.invalidate_pages, &sizes) {
                if self.cache_delete(&key).await {
                    consecutive_failures = 0;
                    continue;
                }
                consecutive_failures += 1;
                if consecutive_failures >= INVALIDATION_FAILURE_LIMIT {
                    tracing::warn!(
                        category = %category,
                        "leaderboard invalidation abandoned for category; cached pages expire with their ttl"
                    );
                    break;
                }
            }
        }
    }

    pub(crate) async fn invalidate_stats(&self) {
        self.cache_delete(STATS_KEY).await;
    }
}
