use crate::cache::LeaderboardCache;
use crate::events::ResultBus;
use common::config::{self, Config};
use common::db::AsyncDb;
use std::sync::Arc;
use std::time::Duration;

/// Tunables the engine reads on every call.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub scoring: config::Scoring,
    pub leaderboard: config::Leaderboard,
    pub cache_timeout: Duration,
    pub query_timeout: Duration,
}

impl EngineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            scoring: cfg.scoring.clone(),
            leaderboard: cfg.leaderboard.clone(),
            cache_timeout: Duration::from_millis(cfg.cache.timeout_ms),
            query_timeout: Duration::from_millis(cfg.database.query_timeout_ms),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            scoring: config::Scoring::default(),
            leaderboard: config::Leaderboard::default(),
            cache_timeout: Duration::from_millis(250),
            query_timeout: Duration::from_secs(5),
        }
    }
}

/// Scoring and ranking over one store, one cache and one result bus.
///
/// Cheap to clone; clones share all three.
pub struct ScoringEngine<C> {
    pub(crate) db: AsyncDb,
    pub(crate) cache: Arc<C>,
    pub(crate) bus: ResultBus,
    pub(crate) settings: Arc<EngineSettings>,
}

impl<C> Clone for ScoringEngine<C> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            cache: Arc::clone(&self.cache),
            bus: self.bus.clone(),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<C: LeaderboardCache> ScoringEngine<C> {
    pub fn new(db: AsyncDb, cache: Arc<C>, bus: ResultBus, settings: EngineSettings) -> Self {
        Self {
            db,
            cache,
            bus,
            settings: Arc::new(settings),
        }
    }

    pub fn db(&self) -> &AsyncDb {
        &self.db
    }

    pub fn bus(&self) -> &ResultBus {
        &self.bus
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Cache read that treats errors and slow responses as a miss.
    pub(crate) async fn cache_get(&self, key: &str) -> Option<String> {
        match tokio::time::timeout(self.settings.cache_timeout, self.cache.get(key)).await {
            Ok(Ok(Some(value))) => {
                metrics::counter!("scoring_cache_requests_total", "result" => "hit").increment(1);
                Some(value)
            }
            Ok(Ok(None)) => {
                metrics::counter!("scoring_cache_requests_total", "result" => "miss").increment(1);
                None
            }
            Ok(Err(e)) => {
                cache_degraded("get", key, &e.to_string());
                None
            }
            Err(_elapsed) => {
                cache_degraded("get", key, "timed out");
                None
            }
        }
    }

    pub(crate) async fn cache_set(&self, key: &str, value: String, ttl: Duration) -> bool {
        match tokio::time::timeout(self.settings.cache_timeout, self.cache.set(key, value, ttl)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                cache_degraded("set", key, &e.to_string());
                false
            }
            Err(_elapsed) => {
                cache_degraded("set", key, "timed out");
                false
            }
        }
    }

    /// Returns false when the cache could not be reached.
    pub(crate) async fn cache_delete(&self, key: &str) -> bool {
        match tokio::time::timeout(self.settings.cache_timeout, self.cache.delete(key)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                cache_degraded("delete", key, &e.to_string());
                false
            }
            Err(_elapsed) => {
                cache_degraded("delete", key, "timed out");
                false
            }
        }
    }
}

fn cache_degraded(op: &'static str, key: &str, reason: &str) {
    metrics::counter!("scoring_cache_errors_total", "op" => op).increment(1);
    tracing::warn!(op, key, reason, "cache unavailable; falling back to store");
}
