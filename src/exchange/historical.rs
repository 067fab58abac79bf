use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::FeatureError;
use crate::exchange::{indicators, FeatureProvider, PriceSource};
use crate::models::{Candle, CandleSeries, FeatureVector, Timeframe};

/// Replays pre-loaded candles. A movable clock (`now`) controls which
/// candles are visible: only candles with timestamp <= now are returned.
pub struct HistoricalExchange {
    data: RwLock<HashMap<(String, Timeframe), Vec<Candle>>>,
    now: RwLock<DateTime<Utc>>,
}

impl Default for HistoricalExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoricalExchange {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            now: RwLock::new(Utc::now()),
        }
    }

    /// Load candles for a symbol/timeframe, sorted oldest-first.
    pub async fn load(&self, symbol: &str, tf: Timeframe, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.timestamp);
        self.data
            .write()
            .await
            .insert((symbol.to_string(), tf), candles);
    }

    pub async fn set_time(&self, t: DateTime<Utc>) {
        *self.now.write().await = t;
    }

    pub async fn current_time(&self) -> DateTime<Utc> {
        *self.now.read().await
    }

    pub async fn latest_time(&self) -> Option<DateTime<Utc>> {
        self.data
            .read()
            .await
            .values()
            .filter_map(|v| v.last().map(|c| c.timestamp))
            .max()
    }

    /// Candles up to the clock, capped at `limit`.
    pub async fn visible_candles(&self, symbol: &str, tf: Timeframe, limit: usize) -> CandleSeries {
        let now = *self.now.read().await;
        let data = self.data.read().await;
        let Some(all) = data.get(&(symbol.to_string(), tf)) else {
            return CandleSeries::default();
        };

        let end = match all.partition_point(|c| c.timestamp <= now) {
            0 => return CandleSeries::default(),
            n => n,
        };

        let start = end.saturating_sub(limit);
        CandleSeries::new(all[start..end].to_vec())
    }
}

#[async_trait]
impl PriceSource for HistoricalExchange {
    /// Close of the most recent visible candle on the finest loaded timeframe.
    async fn get_price(&self, symbol: &str) -> Result<f64> {
        for tf in Timeframe::ALL {
            if let Some(c) = self.visible_candles(symbol, tf, 1).await.last() {
                return Ok(c.close);
            }
        }
        anyhow::bail!("No price data for {symbol} at current time")
    }
}

#[async_trait]
impl FeatureProvider for HistoricalExchange {
    async fn get_features(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        lookback: usize,
    ) -> Result<FeatureVector, FeatureError> {
        let series = self.visible_candles(symbol, timeframe, lookback).await;
        indicators::compute_features(symbol, timeframe, &series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::make_bullish_trend;

    #[tokio::test]
    async fn clock_hides_future_candles() {
        let series = make_bullish_trend(10, 100.0);
        let first = series[0].timestamp;
        let fifth = series[4].clone();

        let ex = HistoricalExchange::new();
        ex.load("BTC-USD", Timeframe::M1, series.as_slice().to_vec()).await;

        ex.set_time(first - chrono::Duration::minutes(1)).await;
        assert!(ex.get_price("BTC-USD").await.is_err());

        ex.set_time(fifth.timestamp).await;
        assert_eq!(ex.get_price("BTC-USD").await.unwrap(), fifth.close);
        assert_eq!(ex.visible_candles("BTC-USD", Timeframe::M1, 100).await.len(), 5);
        assert!(ex.get_price("ETH-USD").await.is_err());
    }

    #[tokio::test]
    async fn features_follow_the_clock() {
        let series = make_bullish_trend(60, 100.0);
        let ex = HistoricalExchange::new();
        ex.load("BTC-USD", Timeframe::M1, series.as_slice().to_vec()).await;
        ex.set_time(series[59].timestamp).await;

        let fv = ex.get_features("BTC-USD", Timeframe::M1, 200).await.unwrap();
        assert_eq!(fv.price(), Some(series[59].close));
        assert_eq!(fv.as_of, series[59].timestamp);

        let missing = ex.get_features("BTC-USD", Timeframe::H1, 200).await;
        assert!(matches!(missing, Err(FeatureError::Empty)));
    }
}
