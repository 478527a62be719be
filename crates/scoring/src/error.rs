use thiserror::Error;

/// Failures surfaced to callers of the engine.
///
/// Cache problems never appear here: the cache fails open.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("forecast {0} is already resolved")]
    AlreadyResolved(i64),
    #[error("validation failed: {0}")]
    Validation(String),
    /// Nothing was committed; safe to retry.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn forecast_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: "forecast",
            id,
        }
    }

    pub fn user_not_found(id: i64) -> Self {
        Self::NotFound { entity: "user", id }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyResolved(_) => "already_resolved",
            Self::Validation(_) => "validation",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Internal(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Classify an error returned from a store closure. Engine errors raised
    /// inside the closure pass through unchanged.
    pub fn from_store(err: anyhow::Error) -> Self {
        match err.downcast::<EngineError>() {
            Ok(engine_err) => engine_err,
            Err(err) if common::db::is_unavailable(&err) => Self::StoreUnavailable(format!("{err:#}")),
            Err(err) => Self::Internal(format!("{err:#}")),
        }
    }
}
