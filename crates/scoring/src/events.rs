//! In-process result bus.
//!
//! Resolutions and sweep summaries are broadcast to every subscriber. Publishing
//! never waits for delivery, and having no subscribers is not an error.

use crate::resolution::ResolutionResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolutionEvent {
    ForecastResolved(ResolutionResult),
    SweepCompleted {
        resolved: u64,
        skipped: u64,
        failed: u64,
        completed_at: DateTime<Utc>,
    },
}

impl ResolutionEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::ForecastResolved(_) => "forecast_resolved",
            Self::SweepCompleted { .. } => "sweep_completed",
        }
    }
}

#[derive(Clone)]
pub struct ResultBus {
    tx: broadcast::Sender<ResolutionEvent>,
}

impl ResultBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResolutionEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget. Returns how many subscribers were handed the event.
    pub fn publish(&self, event: ResolutionEvent) -> usize {
        let kind = event.kind();
        match self.tx.send(event) {
            Ok(receivers) => {
                metrics::counter!("scoring_events_published_total", "kind" => kind).increment(1);
                receivers
            }
            Err(_) => {
                tracing::debug!(kind, "no result bus subscribers; event dropped");
                0
            }
        }
    }
}

/// Logs every event on the bus until it closes.
pub async fn spawn_logging_subscriber(bus: ResultBus) {
    let mut rx = bus.subscribe();
    drop(bus);

    loop {
        match rx.recv().await {
            Ok(ResolutionEvent::ForecastResolved(r)) => {
                tracing::info!(
                    event_type = "forecast_resolved",
                    forecast_id = r.forecast_id,
                    user_id = r.user_id,
                    is_correct = r.is_correct,
                    points_awarded = r.points_awarded,
                    new_streak = r.new_streak,
                    resolved_at = %r.resolved_at,
                    "Result event: ForecastResolved"
                );
            }
            Ok(ResolutionEvent::SweepCompleted {
                resolved,
                skipped,
                failed,
                completed_at,
            }) => {
                tracing::info!(
                    event_type = "sweep_completed",
                    resolved,
                    skipped,
                    failed,
                    %completed_at,
                    "Result event: SweepCompleted"
                );
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "logging subscriber lagged; events skipped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::info!("Logging subscriber shutting down (result bus closed)");
                break;
            }
        }
    }
}
