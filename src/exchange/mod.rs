pub mod coinbase;
pub mod historical;
pub mod indicators;
pub mod storage;

pub use coinbase::CoinbaseClient;
pub use historical::HistoricalExchange;
pub use storage::{JsonFileStore, NullStore, PositionStore};

use anyhow::Result;
use async_trait::async_trait;

use crate::error::FeatureError;
use crate::models::{FeatureVector, Timeframe};

/// Latest traded price for a symbol. Unavailability is an `Err`, never a default.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn get_price(&self, symbol: &str) -> Result<f64>;
}

/// Pre-computed indicator values for a symbol/timeframe.
#[async_trait]
pub trait FeatureProvider: Send + Sync {
    async fn get_features(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        lookback: usize,
    ) -> Result<FeatureVector, FeatureError>;
}
