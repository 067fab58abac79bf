#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use paper_signal_bot::config::Config;
use paper_signal_bot::error::FeatureError;
use paper_signal_bot::exchange::{FeatureProvider, PriceSource};
use paper_signal_bot::models::features as f;
use paper_signal_bot::models::{Candle, FeatureVector, Side, Timeframe};
use paper_signal_bot::strategies::Signal;

pub fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-17T07:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Indicators on which the built-in models and the market scorer all lean
/// bullish. Close 100, ATR 1.
pub fn bullish_features() -> FeatureVector {
    FeatureVector::new("BTC-USD", Timeframe::H1, base_time())
        .with(f::CLOSE, 100.0)
        .with(f::RSI, 55.0)
        .with(f::EMA_FAST, 101.0)
        .with(f::EMA_SLOW, 100.0)
        .with(f::MACD, 1.0)
        .with(f::MACD_SIGNAL, 0.5)
        .with(f::MACD_HIST, 0.5)
        .with(f::BB_UPPER, 110.0)
        .with(f::BB_LOWER, 90.0)
        .with(f::STOCH_K, 20.0)
        .with(f::STOCH_D, 15.0)
        .with(f::ATR, 1.0)
        .with(f::VOLUME_RATIO, 1.6)
        .with(f::RETURN_5, 0.01)
}

/// A market whose features are fixed and whose prices the test moves.
pub struct MockMarket {
    features: FeatureVector,
    prices: Mutex<HashMap<String, f64>>,
}

impl MockMarket {
    pub fn new(features: FeatureVector) -> Self {
        Self {
            features,
            prices: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().unwrap().insert(symbol.to_string(), price);
    }
}

#[async_trait]
impl PriceSource for MockMarket {
    async fn get_price(&self, symbol: &str) -> Result<f64> {
        self.prices
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("{symbol} unavailable"))
    }
}

#[async_trait]
impl FeatureProvider for MockMarket {
    async fn get_features(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        _lookback: usize,
    ) -> Result<FeatureVector, FeatureError> {
        let mut fv = self.features.clone();
        fv.symbol = symbol.to_string();
        fv.timeframe = timeframe;
        Ok(fv)
    }
}

pub fn signal(symbol: &str, side: Side, entry: f64, sl: f64, tp: f64) -> Signal {
    Signal {
        id: format!("{symbol}_1h_20240117_070000"),
        symbol: symbol.to_string(),
        timeframe: Timeframe::H1,
        signal_type: side,
        confidence: 0.7,
        entry_price: entry,
        stop_loss: sl,
        take_profit: tp,
        timestamp: base_time(),
        reasons: Vec::new(),
        derived_from_neutral: false,
    }
}

/// Config writing into a fresh temp dir.
pub fn test_config(name: &str) -> Config {
    let dir = std::env::temp_dir().join(format!(
        "paper_signal_bot_it_{}_{}",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    let mut cfg = Config::default();
    cfg.log_dir = dir.to_string_lossy().to_string();
    cfg.log_level = "ERROR".to_string();
    cfg.monitor.interval_secs = 1;
    cfg.monitor.fetch_timeout_secs = 1;
    cfg
}

/// Rising 1m candles with a pullback every few bars.
pub fn rising_candles(n: usize, start: f64) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let drift = i as f64 * 2.0;
            let wobble = if i % 5 == 4 { -3.0 } else { 1.5 };
            let open = start + drift;
            let close = open + wobble;
            Candle {
                timestamp: base_time() + Duration::minutes(i as i64),
                open,
                high: open.max(close) + 1.0,
                low: open.min(close) - 1.0,
                close,
                volume: 100.0 + (i % 7) as f64 * 20.0,
            }
        })
        .collect()
}
