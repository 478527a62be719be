//! Outcome evaluation: decides whether a resolved forecast was right.
//!
//! Pure functions over the forecast's prediction and the declared outcome.
//! Numeric indicators compare the published change against the forecaster's
//! threshold; the policy rate is compared within a tolerance band; every
//! other type falls back to case-insensitive label equality.

use common::types::{EventType, PredictedOutcome, PredictionValue, ResolutionData, EXPIRED_OUTCOME};
use rust_decimal::Decimal;

/// What was predicted, as stored on the forecast.
#[derive(Debug, Clone, Copy)]
pub struct Prediction<'a> {
    pub event_type: EventType,
    pub outcome: &'a PredictedOutcome,
    pub value: &'a PredictionValue,
}

/// True when the forecast should be scored as correct.
///
/// The synthetic `expired` outcome is incorrect under every rule.
pub fn is_correct(
    prediction: Prediction<'_>,
    actual_outcome: &str,
    data: &ResolutionData,
    fed_rate_tolerance: Decimal,
) -> bool {
    if is_expired(actual_outcome) {
        return false;
    }

    let by_figures = match prediction.event_type {
        t if t.is_numeric_change() => directional_change(prediction, data),
        EventType::FedRate => rate_within_band(prediction, data, fed_rate_tolerance),
        _ => None,
    };

    by_figures.unwrap_or_else(|| labels_match(prediction.outcome.as_str(), actual_outcome))
}

pub fn is_expired(actual_outcome: &str) -> bool {
    actual_outcome.trim().eq_ignore_ascii_case(EXPIRED_OUTCOME)
}

/// `None` when the figures needed for a numeric decision are missing, or the
/// prediction is not a direction call.
fn directional_change(prediction: Prediction<'_>, data: &ResolutionData) -> Option<bool> {
    let change = data.actual_value? - data.previous_value?;
    let threshold = prediction.value.threshold();
    match prediction.outcome {
        PredictedOutcome::Higher => Some(change > threshold),
        PredictedOutcome::Lower => Some(change < -threshold),
        PredictedOutcome::Same => Some(change.abs() <= threshold),
        _ => None,
    }
}

fn rate_within_band(
    prediction: Prediction<'_>,
    data: &ResolutionData,
    tolerance: Decimal,
) -> Option<bool> {
    let predicted = prediction.value.rate()?;
    let actual = data.actual_rate?;
    Some((predicted - actual).abs() <= tolerance)
}

fn labels_match(predicted: &str, actual: &str) -> bool {
    predicted.trim().to_lowercase() == actual.trim().to_lowercase()
}
