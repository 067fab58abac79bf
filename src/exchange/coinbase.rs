use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::FeatureError;
use crate::exchange::{indicators, FeatureProvider, PriceSource};
use crate::models::{Candle, CandleSeries, FeatureVector, Timeframe};

const BASE_URL: &str = "https://api.coinbase.com";
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(100);
/// Coinbase rejects candle requests above 350 bars.
const MAX_CANDLES: usize = 300;

#[derive(Debug, Deserialize)]
struct CandleResponse {
    candles: Vec<RawCandle>,
}

#[derive(Debug, Deserialize)]
struct RawCandle {
    start: String,
    low: String,
    high: String,
    open: String,
    close: String,
    volume: String,
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    trades: Vec<TickerTrade>,
}

#[derive(Debug, Deserialize)]
struct TickerTrade {
    price: String,
}

/// Coinbase Advanced Trade public market data. No credentials needed.
pub struct CoinbaseClient {
    client: Client,
    last_request: Mutex<Option<Instant>>,
    cache: Mutex<HashMap<String, (Instant, CandleSeries)>>,
    cache_ttl: Duration,
}

impl Default for CoinbaseClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CoinbaseClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            last_request: Mutex::new(None),
            cache: Mutex::new(HashMap::new()),
            cache_ttl: Duration::from_secs(5),
        }
    }

    async fn rate_limit(&self) {
        let mut last_request = self.last_request.lock().await;
        if let Some(last) = *last_request {
            let elapsed = last.elapsed();
            if elapsed < MIN_REQUEST_INTERVAL {
                tokio::time::sleep(MIN_REQUEST_INTERVAL - elapsed).await;
            }
        }
        *last_request = Some(Instant::now());
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        self.rate_limit().await;

        let resp = self
            .client
            .get(format!("{}{}", BASE_URL, path))
            .query(query)
            .send()
            .await
            .with_context(|| format!("request to {path} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Coinbase API error {}: {}", status, body);
        }

        resp.json().await.context("Failed to parse Coinbase response")
    }

    pub async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<CandleSeries> {
        if timeframe == Timeframe::H4 {
            let h1 = self.fetch_raw(symbol, Timeframe::H1, limit * 4).await?;
            return Ok(h1.resample(Timeframe::H4.as_duration()).tail(limit));
        }
        self.fetch_raw(symbol, timeframe, limit).await
    }

    async fn fetch_raw(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<CandleSeries> {
        let limit = limit.clamp(1, MAX_CANDLES);
        let cache_key = format!("{}_{}_{}", symbol, timeframe, limit);
        if let Some((cached_at, series)) = self.cache.lock().await.get(&cache_key) {
            if cached_at.elapsed() < self.cache_ttl {
                return Ok(series.clone());
            }
        }

        let path = format!("/api/v3/brokerage/market/products/{}/candles", symbol);
        let now = Utc::now().timestamp();
        let start = now - (timeframe.as_seconds() * limit as u64) as i64;

        let data: CandleResponse = self
            .get_json(
                &path,
                &[
                    ("start", start.to_string()),
                    ("end", now.to_string()),
                    ("granularity", timeframe.coinbase_granularity().to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let mut candles: Vec<Candle> = data
            .candles
            .into_iter()
            .filter_map(|rc| {
                let ts = rc.start.parse::<i64>().ok()?;
                let timestamp = DateTime::from_timestamp(ts, 0)?;
                Some(Candle {
                    timestamp,
                    open: rc.open.parse().ok()?,
                    high: rc.high.parse().ok()?,
                    low: rc.low.parse().ok()?,
                    close: rc.close.parse().ok()?,
                    volume: rc.volume.parse().ok()?,
                })
            })
            .collect();

        // Coinbase returns newest first, we want oldest first
        candles.sort_by_key(|c| c.timestamp);
        debug!("Fetched {} {} candles for {}", candles.len(), timeframe, symbol);

        let series = CandleSeries::new(candles);
        self.cache
            .lock()
            .await
            .insert(cache_key, (Instant::now(), series.clone()));

        Ok(series)
    }

    pub async fn get_current_price(&self, symbol: &str) -> Result<f64> {
        let path = format!("/api/v3/brokerage/market/products/{}/ticker", symbol);
        let data: TickerResponse = self.get_json(&path, &[("limit", "1".to_string())]).await?;

        data.trades
            .first()
            .and_then(|t| t.price.parse::<f64>().ok())
            .filter(|p| *p > 0.0)
            .with_context(|| format!("No price in ticker response for {symbol}"))
    }
}

#[async_trait]
impl PriceSource for CoinbaseClient {
    async fn get_price(&self, symbol: &str) -> Result<f64> {
        self.get_current_price(symbol).await
    }
}

#[async_trait]
impl FeatureProvider for CoinbaseClient {
    async fn get_features(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        lookback: usize,
    ) -> Result<FeatureVector, FeatureError> {
        let series = self.fetch_ohlcv(symbol, timeframe, lookback).await?;
        indicators::compute_features(symbol, timeframe, &series)
    }
}
