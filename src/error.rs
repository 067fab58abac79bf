use thiserror::Error;
use uuid::Uuid;

/// Malformed input rejected before any evaluation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("symbol must not be empty")]
    EmptySymbol,

    #[error("unknown timeframe: {0}")]
    UnknownTimeframe(String),

    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(f64),

    #[error("entry price must be positive, got {0}")]
    NonPositiveEntryPrice(f64),

    #[error("price must be positive, got {0}")]
    NonPositivePrice(f64),
}

/// Feature input could not be turned into a prediction.
#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("feature vector is empty")]
    Empty,

    #[error("missing indicator: {0}")]
    MissingIndicator(String),

    #[error("indicator {0} is not a finite number")]
    NonFinite(String),

    #[error("ensemble has no models")]
    NoModels,

    #[error("feature provider failed: {0}")]
    Provider(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum TradeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("position {0} not found")]
    NotFound(Uuid),

    #[error("position {0} is not open")]
    NotOpen(Uuid),

    #[error("open position limit reached ({0})")]
    TooManyOpen(usize),
}
