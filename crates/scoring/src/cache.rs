//! Leaderboard cache seam and the in-process TTL implementation.
//!
//! Values are JSON strings. Callers treat every error as a miss; see
//! `ScoringEngine::cache_get` and friends for the timeout and fail-open wrapper.

use common::types::LeaderboardCategory;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

pub const STATS_KEY: &str = "leaderboard:stats";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

pub trait LeaderboardCache: Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, CacheError>> + Send;
    fn set(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), CacheError>> + Send;
}

pub fn page_key(category: LeaderboardCategory, page: u32, page_size: u32) -> String {
    format!("leaderboard:{}:{page}:{page_size}", category.key())
}

pub fn user_snapshot_key(user_id: i64) -> String {
    format!("user_snapshot:{user_id}")
}

/// Every page key for `category` across the leading `pages` pages and each size.
pub fn category_keys(category: LeaderboardCategory, pages: u32, page_sizes: &[u32]) -> Vec<String> {
    (1..=pages)
        .flat_map(|page| page_sizes.iter().map(move |&size| page_key(category, page, size)))
        .collect()
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// Bounded in-process cache with lazy expiry.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LeaderboardCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            entries.retain(|_, e| e.expires_at > now);
        }
        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            // Still full: evict whatever expires soonest.
            let victim = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                entries.remove(&victim);
            }
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
