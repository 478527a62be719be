//! Point calculation for resolved forecasts.
//!
//! Points are computed in `Decimal` and rounded half away from zero, so the
//! same inputs always produce the same award regardless of platform.

use chrono::{DateTime, Utc};
use common::config::Scoring;
use common::types::EventType;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

const SECS_PER_DAY: i64 = 86_400;

/// Inputs for one award.
#[derive(Debug, Clone, Copy)]
pub struct PointsInput {
    pub event_type: EventType,
    pub confidence: u8,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub old_streak: i64,
    pub is_correct: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsBreakdown {
    pub base_points: i64,
    pub time_bonus: i64,
    pub streak_bonus: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Award {
    pub breakdown: PointsBreakdown,
    pub new_streak: i64,
}

pub fn calculate(cfg: &Scoring, input: &PointsInput) -> Award {
    let base_points = base_points(cfg, input.event_type, input.confidence, input.is_correct);
    let time_bonus = time_bonus(cfg, base_points, days_early(input.created_at, input.expires_at));
    let new_streak = next_streak(input.old_streak, input.is_correct);
    let streak_bonus = if input.is_correct {
        streak_bonus(cfg.streak_bonus_scale, new_streak)
    } else {
        0
    };

    Award {
        breakdown: PointsBreakdown {
            base_points,
            time_bonus,
            streak_bonus,
            total: base_points.saturating_add(time_bonus).saturating_add(streak_bonus),
        },
        new_streak,
    }
}

/// `round(base × difficulty × (1 + confidence × factor))`, zero when incorrect.
pub fn base_points(cfg: &Scoring, event_type: EventType, confidence: u8, is_correct: bool) -> i64 {
    if !is_correct {
        return 0;
    }
    let multiplier = cfg.difficulty.for_event(event_type);
    let raw = Decimal::from(confidence)
        .checked_mul(cfg.confidence_factor)
        .and_then(|c| c.checked_add(Decimal::ONE))
        .and_then(|boost| cfg.base_points.checked_mul(multiplier)?.checked_mul(boost));
    round_points(raw.unwrap_or(Decimal::MAX))
}

/// Fractional days between creation and deadline.
pub fn days_early(created_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Decimal {
    let secs = (expires_at - created_at).num_seconds();
    Decimal::from(secs) / Decimal::from(SECS_PER_DAY)
}

/// Percentage of base points from the first tier the lead time reaches.
/// Tiers are sorted by descending `min_days` when the config is loaded.
pub fn time_bonus(cfg: &Scoring, base_points: i64, days_early: Decimal) -> i64 {
    cfg.time_bonus
        .iter()
        .find(|tier| days_early >= Decimal::from(tier.min_days))
        .map_or(0, |tier| {
            let raw = Decimal::from(base_points).checked_mul(tier.pct);
            round_points(raw.unwrap_or(Decimal::MAX))
        })
}

pub fn next_streak(old_streak: i64, is_correct: bool) -> i64 {
    if is_correct {
        old_streak.max(0) + 1
    } else {
        0
    }
}

/// `round(scale × log2(streak))` once the streak reaches two.
pub fn streak_bonus(scale: f64, new_streak: i64) -> i64 {
    if new_streak < 2 {
        return 0;
    }
    // round() on f64 is half away from zero, matching round_points.
    (scale * (new_streak as f64).log2()).round() as i64
}

fn round_points(value: Decimal) -> i64 {
    let rounded = value.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    rounded.to_i64().unwrap_or(if rounded.is_sign_negative() {
        i64::MIN
    } else {
        i64::MAX
    })
}
