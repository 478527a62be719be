use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Synthetic outcome recorded for forecasts that passed their deadline unresolved.
pub const EXPIRED_OUTCOME: &str = "expired";

/// Fixed-width RFC 3339 UTC timestamp, so lexical order in SQLite equals
/// chronological order.
pub fn to_db_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_db_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Cpi,
    Unemployment,
    FedRate,
    Gdp,
    Payrolls,
    Housing,
    RetailSales,
    Ppi,
    Custom,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        Self::Cpi,
        Self::Unemployment,
        Self::FedRate,
        Self::Gdp,
        Self::Payrolls,
        Self::Housing,
        Self::RetailSales,
        Self::Ppi,
        Self::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpi => "cpi",
            Self::Unemployment => "unemployment",
            Self::FedRate => "fed_rate",
            Self::Gdp => "gdp",
            Self::Payrolls => "payrolls",
            Self::Housing => "housing",
            Self::RetailSales => "retail_sales",
            Self::Ppi => "ppi",
            Self::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Lenient parse for stored rows: unknown types score as `custom`.
    pub fn from_str_loose(s: &str) -> Self {
        Self::parse(s).unwrap_or(Self::Custom)
    }

    /// Indicators resolved by comparing the new release against the previous one.
    pub fn is_numeric_change(&self) -> bool {
        matches!(self, Self::Cpi | Self::Unemployment | Self::Gdp)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictedOutcome {
    Yes,
    No,
    Higher,
    Lower,
    Same,
    /// Free-form outcome label, matched case-insensitively against the actual outcome.
    Custom(String),
}

impl PredictedOutcome {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
            Self::Higher => "higher",
            Self::Lower => "lower",
            Self::Same => "same",
            Self::Custom(label) => label.as_str(),
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "yes" => Self::Yes,
            "no" => Self::No,
            "higher" => Self::Higher,
            "lower" => Self::Lower,
            "same" => Self::Same,
            _ => Self::Custom(s.trim().to_string()),
        }
    }
}

impl fmt::Display for PredictedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured prediction payload, stored as JSON in `forecasts.prediction_value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PredictionValue {
    /// Direction call on a numeric release: how far the change must move to count.
    Threshold {
        #[serde(default)]
        threshold: Decimal,
    },
    /// Level call on the policy rate, in percent.
    Rate { rate: Decimal },
    FreeForm {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<serde_json::Value>,
    },
}

impl Default for PredictionValue {
    fn default() -> Self {
        Self::FreeForm { detail: None }
    }
}

impl PredictionValue {
    /// Whether this payload shape is meaningful for the given indicator.
    pub fn fits(&self, event_type: EventType) -> bool {
        match self {
            Self::Threshold { .. } => event_type.is_numeric_change(),
            Self::Rate { .. } => event_type == EventType::FedRate,
            Self::FreeForm { .. } => true,
        }
    }

    pub fn threshold(&self) -> Decimal {
        match self {
            Self::Threshold { threshold } => *threshold,
            _ => Decimal::ZERO,
        }
    }

    pub fn rate(&self) -> Option<Decimal> {
        match self {
            Self::Rate { rate } => Some(*rate),
            _ => None,
        }
    }
}

/// Published figures supplied alongside an actual outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionData {
    #[serde(default, alias = "actualValue")]
    pub actual_value: Option<Decimal>,
    #[serde(default, alias = "previousValue")]
    pub previous_value: Option<Decimal>,
    #[serde(default, alias = "actualRate")]
    pub actual_rate: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub total_points: i64,
    pub win_streak: i64,
    pub total_predictions: i64,
    pub correct_predictions: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Forecast {
    pub id: i64,
    pub user_id: i64,
    pub event_type: EventType,
    pub predicted_outcome: PredictedOutcome,
    pub prediction_value: PredictionValue,
    pub confidence: u8,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_resolved: bool,
    pub actual_outcome: Option<String>,
    pub is_correct: Option<bool>,
    pub points_awarded: i64,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A named partition over which users are ranked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderboardCategory {
    Overall,
    Weekly,
    Monthly,
    Event(EventType),
}

impl LeaderboardCategory {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Overall => "overall",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Event(t) => t.as_str(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overall" => Some(Self::Overall),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            other => EventType::parse(other).map(Self::Event),
        }
    }
}

impl fmt::Display for LeaderboardCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
