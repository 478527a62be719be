use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

use crate::types::EventType;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Upper bounds that keep every point product far inside `Decimal` and `i64`.
const MAX_BASE_POINTS: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);
const MAX_MULTIPLIER: Decimal = Decimal::from_parts(100, 0, 0, false, 0);
const MAX_STREAK_BONUS_SCALE: f64 = 1_000.0;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub scoring: Scoring,
    pub leaderboard: Leaderboard,
    pub cache: Cache,
    pub sweeper: Sweeper,
    pub events: Events,
    pub observability: Observability,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub path: String,
    /// Upper bound for read-path store calls. The resolution write path is
    /// bounded by SQLite's busy_timeout instead.
    pub query_timeout_ms: u64,
}

/// Product policy for point awards. All values are tunable.
#[derive(Debug, Clone, Deserialize)]
pub struct Scoring {
    pub base_points: Decimal,
    pub confidence_factor: Decimal,
    pub streak_bonus_scale: f64,
    pub fed_rate_tolerance: Decimal,
    pub difficulty: DifficultyMultipliers,
    pub time_bonus: Vec<TimeBonusTier>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DifficultyMultipliers {
    pub cpi: Decimal,
    pub unemployment: Decimal,
    pub fed_rate: Decimal,
    pub gdp: Decimal,
    pub payrolls: Decimal,
    pub housing: Decimal,
    pub retail_sales: Decimal,
    pub ppi: Decimal,
    pub custom: Decimal,
}

impl DifficultyMultipliers {
    pub fn for_event(&self, event_type: EventType) -> Decimal {
        match event_type {
            EventType::Cpi => self.cpi,
            EventType::Unemployment => self.unemployment,
            EventType::FedRate => self.fed_rate,
            EventType::Gdp => self.gdp,
            EventType::Payrolls => self.payrolls,
            EventType::Housing => self.housing,
            EventType::RetailSales => self.retail_sales,
            EventType::Ppi => self.ppi,
            EventType::Custom => self.custom,
        }
    }

    fn all(&self) -> [Decimal; 9] {
        [
            self.cpi,
            self.unemployment,
            self.fed_rate,
            self.gdp,
            self.payrolls,
            self.housing,
            self.retail_sales,
            self.ppi,
            self.custom,
        ]
    }
}

impl Default for DifficultyMultipliers {
    fn default() -> Self {
        Self {
            cpi: Decimal::new(15, 1),
            unemployment: Decimal::new(13, 1),
            fed_rate: Decimal::new(20, 1),
            gdp: Decimal::new(18, 1),
            payrolls: Decimal::new(14, 1),
            housing: Decimal::new(12, 1),
            retail_sales: Decimal::new(11, 1),
            ppi: Decimal::new(13, 1),
            custom: Decimal::ONE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeBonusTier {
    pub min_days: i64,
    /// Fraction of base points, e.g. 0.20 for 20%.
    pub pct: Decimal,
}

impl Default for Scoring {
    fn default() -> Self {
        Self {
            base_points: Decimal::ONE_HUNDRED,
            confidence_factor: Decimal::new(1, 2),
            streak_bonus_scale: 10.0,
            fed_rate_tolerance: Decimal::new(125, 3),
            difficulty: DifficultyMultipliers::default(),
            time_bonus: vec![
                TimeBonusTier {
                    min_days: 7,
                    pct: Decimal::new(20, 2),
                },
                TimeBonusTier {
                    min_days: 3,
                    pct: Decimal::new(10, 2),
                },
                TimeBonusTier {
                    min_days: 1,
                    pct: Decimal::new(5, 2),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Leaderboard {
    pub default_page_size: u32,
    pub max_page_size: u32,
    /// Anti-gaming floor for per-indicator leaderboards.
    pub event_type_min_resolved: u32,
    pub weekly_window_days: i64,
    pub monthly_window_days: i64,
    pub cache_ttl_secs: u64,
    pub stats_cache_ttl_secs: u64,
    /// Number of leading pages whose cache keys are deleted on invalidation.
    pub invalidate_pages: u32,
    pub invalidate_page_sizes: Vec<u32>,
}

impl Default for Leaderboard {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 100,
            event_type_min_resolved: 3,
            weekly_window_days: 7,
            monthly_window_days: 30,
            cache_ttl_secs: 300,
            stats_cache_ttl_secs: 3600,
            invalidate_pages: 5,
            invalidate_page_sizes: vec![10, 20, 25, 50, 100],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Cache {
    pub timeout_ms: u64,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sweeper {
    pub interval_secs: u64,
    pub run_immediately: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Events {
    pub bus_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = std::env::var("SCORING_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let s = &self.scoring;
        anyhow::ensure!(
            s.base_points > Decimal::ZERO && s.base_points <= MAX_BASE_POINTS,
            "scoring.base_points must be in (0, {MAX_BASE_POINTS}]"
        );
        anyhow::ensure!(
            s.confidence_factor >= Decimal::ZERO && s.confidence_factor <= Decimal::ONE,
            "scoring.confidence_factor must be in [0, 1]"
        );
        anyhow::ensure!(
            s.fed_rate_tolerance >= Decimal::ZERO,
            "scoring.fed_rate_tolerance must be >= 0"
        );
        anyhow::ensure!(
            s.streak_bonus_scale.is_finite()
                && s.streak_bonus_scale >= 0.0
                && s.streak_bonus_scale <= MAX_STREAK_BONUS_SCALE,
            "scoring.streak_bonus_scale must be in [0, {MAX_STREAK_BONUS_SCALE}]"
        );
        anyhow::ensure!(
            s.difficulty
                .all()
                .iter()
                .all(|m| *m > Decimal::ZERO && *m <= MAX_MULTIPLIER),
            "scoring.difficulty multipliers must all be in (0, {MAX_MULTIPLIER}]"
        );
        anyhow::ensure!(
            s.time_bonus
                .windows(2)
                .all(|w| w[0].min_days > w[1].min_days),
            "scoring.time_bonus tiers must be sorted by descending min_days"
        );
        anyhow::ensure!(
            s.time_bonus
                .iter()
                .all(|t| t.pct >= Decimal::ZERO && t.pct <= MAX_MULTIPLIER && t.min_days >= 0),
            "scoring.time_bonus tiers must have non-negative min_days and pct in [0, {MAX_MULTIPLIER}]"
        );

        let lb = &self.leaderboard;
        anyhow::ensure!(
            lb.max_page_size > 0,
            "leaderboard.max_page_size must be > 0"
        );
        anyhow::ensure!(
            lb.default_page_size > 0 && lb.default_page_size <= lb.max_page_size,
            "leaderboard.default_page_size must be in [1, max_page_size]"
        );
        anyhow::ensure!(
            lb.weekly_window_days > 0 && lb.monthly_window_days > 0,
            "leaderboard window days must be > 0"
        );
        anyhow::ensure!(
            lb.cache_ttl_secs > 0 && lb.stats_cache_ttl_secs > 0,
            "leaderboard cache TTLs must be > 0"
        );
        anyhow::ensure!(self.cache.timeout_ms > 0, "cache.timeout_ms must be > 0");
        anyhow::ensure!(
            self.database.query_timeout_ms > 0,
            "database.query_timeout_ms must be > 0"
        );
        anyhow::ensure!(
            self.sweeper.interval_secs > 0,
            "sweeper.interval_secs must be > 0"
        );
        anyhow::ensure!(self.events.bus_capacity > 0, "events.bus_capacity must be > 0");
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_toml() -> &'static str {
        include_str!("../../../config/default.toml")
    }

    #[test]
    fn test_load_default_config() {
        let config = Config::from_toml_str(default_toml()).unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.database.path, "data/scoring.db");
        assert_eq!(config.leaderboard.event_type_min_resolved, 3);
        assert_eq!(config.leaderboard.invalidate_page_sizes, vec![10, 20, 25, 50, 100]);
        assert_eq!(config.sweeper.interval_secs, 3600);
    }

    #[test]
    fn test_default_toml_matches_builtin_scoring_defaults() {
        let config = Config::from_toml_str(default_toml()).unwrap();
        let builtin = Scoring::default();
        assert_eq!(config.scoring.base_points, builtin.base_points);
        assert_eq!(config.scoring.confidence_factor, builtin.confidence_factor);
        assert_eq!(config.scoring.fed_rate_tolerance, builtin.fed_rate_tolerance);
        assert_eq!(config.scoring.difficulty.all(), builtin.difficulty.all());
        assert_eq!(config.scoring.time_bonus.len(), 3);
        for (a, b) in config.scoring.time_bonus.iter().zip(&builtin.time_bonus) {
            assert_eq!(a.min_days, b.min_days);
            assert_eq!(a.pct, b.pct);
        }
    }

    #[test]
    fn test_difficulty_lookup() {
        let d = DifficultyMultipliers::default();
        assert_eq!(d.for_event(EventType::FedRate), Decimal::new(2, 0));
        assert_eq!(d.for_event(EventType::RetailSales), Decimal::new(11, 1));
        assert_eq!(d.for_event(EventType::Custom), Decimal::ONE);
    }

    #[test]
    fn test_parse_invalid_config_missing_section() {
        let bad = "
[general]
log_level = \"info\"
";
        assert!(Config::from_toml_str(bad).is_err());
    }

    #[test]
    fn test_validate_unsorted_time_bonus() {
        let content = default_toml().replacen("min_days = 7", "min_days = 2", 1);
        let err = Config::from_toml_str(&content).unwrap_err();
        assert!(err
            .to_string()
            .contains("tiers must be sorted by descending min_days"));
    }

    #[test]
    fn test_validate_rejects_oversized_scoring_policy() {
        let content = default_toml().replace("base_points = \"100\"", "base_points = \"5000000\"");
        let err = Config::from_toml_str(&content).unwrap_err();
        assert!(err.to_string().contains("scoring.base_points"));

        let content = default_toml().replace("cpi = \"1.5\"", "cpi = \"1e30\"");
        assert!(Config::from_toml_str(&content).is_err());

        let content = default_toml().replacen("pct = \"0.20\"", "pct = \"250\"", 1);
        let err = Config::from_toml_str(&content).unwrap_err();
        assert!(err.to_string().contains("scoring.time_bonus"));
    }

    #[test]
    fn test_validate_default_page_size_above_max() {
        let content = default_toml().replace("default_page_size = 50", "default_page_size = 500");
        let err = Config::from_toml_str(&content).unwrap_err();
        assert!(err.to_string().contains("default_page_size"));
    }

    #[test]
    fn test_from_str_trait() {
        let config: Config = default_toml().parse().unwrap();
        assert_eq!(config.observability.prometheus_port, 9094);
    }
}
