use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::Config;
use crate::error::FeatureError;
use crate::exchange::{FeatureProvider, PriceSource};
use crate::models::features as f;
use crate::models::{Candle, CandleSeries, FeatureVector, PositionStatus, Side, Timeframe, Vote};
use crate::strategies::ensemble::{EnsemblePredictor, VoteModel};
use crate::strategies::signals::Signal;
use crate::trading::Position;

fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-15T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Create candles from (open, high, low, close) tuples with auto-incrementing 1m timestamps.
pub fn make_candles(data: &[(f64, f64, f64, f64)]) -> CandleSeries {
    let base = base_time();
    let candles: Vec<Candle> = data
        .iter()
        .enumerate()
        .map(|(i, &(o, h, l, c))| Candle {
            timestamp: base + Duration::minutes(i as i64),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 100.0,
        })
        .collect();

    CandleSeries::new(candles)
}

/// Create n rising candles starting from `start` price.
pub fn make_bullish_trend(n: usize, start: f64) -> CandleSeries {
    let base = base_time();
    let candles: Vec<Candle> = (0..n)
        .map(|i| {
            let open = start + i as f64 * 10.0;
            let close = open + 8.0;
            Candle {
                timestamp: base + Duration::minutes(i as i64),
                open,
                high: close + 2.0,
                low: open - 1.0,
                close,
                volume: 100.0 + i as f64,
            }
        })
        .collect();

    CandleSeries::new(candles)
}

/// Create n falling candles starting from `start` price.
pub fn make_bearish_trend(n: usize, start: f64) -> CandleSeries {
    let base = base_time();
    let candles: Vec<Candle> = (0..n)
        .map(|i| {
            let open = start - i as f64 * 10.0;
            let close = open - 8.0;
            Candle {
                timestamp: base + Duration::minutes(i as i64),
                open,
                high: open + 1.0,
                low: close - 2.0,
                close,
                volume: 100.0 + i as f64,
            }
        })
        .collect();

    CandleSeries::new(candles)
}

/// Features on which every built-in model votes neutral and every market
/// factor reads zero. Close 100, ATR 1.
pub fn neutral_features(symbol: &str) -> FeatureVector {
    FeatureVector::new(symbol, Timeframe::H1, base_time())
        .with(f::CLOSE, 100.0)
        .with(f::RSI, 50.0)
        .with(f::EMA_FAST, 100.0)
        .with(f::EMA_SLOW, 100.0)
        .with(f::MACD, 0.0)
        .with(f::MACD_SIGNAL, 0.0)
        .with(f::MACD_HIST, 0.0)
        .with(f::BB_UPPER, 110.0)
        .with(f::BB_LOWER, 90.0)
        .with(f::STOCH_K, 50.0)
        .with(f::STOCH_D, 50.0)
        .with(f::ATR, 1.0)
        .with(f::VOLUME_RATIO, 1.0)
        .with(f::RETURN_5, 0.0)
}

struct FixedModel {
    id: String,
    vote: Vote,
}

impl VoteModel for FixedModel {
    fn id(&self) -> &str {
        &self.id
    }

    fn predict_vote(&self, _features: &FeatureVector) -> Result<Vote, FeatureError> {
        Ok(self.vote)
    }
}

/// An ensemble whose models always cast the given votes, in order.
pub fn fixed_votes(votes: &[Vote]) -> EnsemblePredictor {
    EnsemblePredictor::new(
        votes
            .iter()
            .enumerate()
            .map(|(i, v)| {
                Arc::new(FixedModel {
                    id: format!("fixed_{i}"),
                    vote: *v,
                }) as Arc<dyn VoteModel>
            })
            .collect(),
    )
}

/// A BTC-USD 1h signal with the given side and levels.
pub fn make_signal(side: Side, entry: f64, sl: f64, tp: f64) -> Signal {
    Signal {
        id: "BTC-USD_1h_20240115_120000".to_string(),
        symbol: "BTC-USD".to_string(),
        timeframe: Timeframe::H1,
        signal_type: side,
        confidence: 0.8,
        entry_price: entry,
        stop_loss: sl,
        take_profit: tp,
        timestamp: base_time(),
        reasons: vec!["test".to_string()],
        derived_from_neutral: false,
    }
}

/// An open BTC-USD position with stops 5% and targets 10% from entry.
pub fn make_position(side: Side, entry: f64, quantity: f64) -> Position {
    let (stop_loss, take_profit) = match side {
        Side::Buy => (entry * 0.95, entry * 1.10),
        Side::Sell => (entry * 1.05, entry * 0.90),
    };
    Position {
        id: Uuid::new_v4(),
        symbol: "BTC-USD".to_string(),
        side,
        timeframe: Timeframe::H1,
        signal_id: "BTC-USD_1h_20240115_120000".to_string(),
        confidence: 0.8,
        entry_price: entry,
        quantity,
        amount: entry * quantity,
        stop_loss,
        take_profit,
        opened_at: base_time(),
        status: PositionStatus::Open,
        current_price: None,
        unrealized_pnl: None,
        exit_price: None,
        exit_reason: None,
        closed_at: None,
        realized_pnl: None,
        pnl_percent: None,
    }
}

/// A fresh, empty directory under the system temp dir.
pub fn temp_log_dir(name: &str) -> String {
    let dir = std::env::temp_dir().join(format!(
        "paper_signal_bot_{}_{}_{}",
        name,
        std::process::id(),
        Uuid::new_v4().simple()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir.to_string_lossy().to_string()
}

/// Default configuration with a temp log dir and quiet logging.
pub fn default_test_config() -> Config {
    Config {
        log_dir: std::env::temp_dir()
            .join(format!("paper_signal_bot_test_{}", std::process::id()))
            .to_string_lossy()
            .to_string(),
        log_level: "ERROR".to_string(),
        ..Config::default()
    }
}

/// Serves one feature vector for every request, re-tagged with the
/// requested symbol and timeframe.
pub struct StaticFeatures {
    features: Option<FeatureVector>,
}

impl StaticFeatures {
    pub fn new(features: FeatureVector) -> Self {
        Self {
            features: Some(features),
        }
    }

    /// Every request fails as a provider error.
    pub fn failing() -> Self {
        Self { features: None }
    }
}

#[async_trait]
impl FeatureProvider for StaticFeatures {
    async fn get_features(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        _lookback: usize,
    ) -> Result<FeatureVector, FeatureError> {
        let mut fv = self
            .features
            .clone()
            .ok_or_else(|| FeatureError::Provider(anyhow!("feed offline")))?;
        fv.symbol = symbol.to_string();
        fv.timeframe = timeframe;
        Ok(fv)
    }
}

/// Prices set by the test; unknown symbols are unavailable.
#[derive(Default)]
pub struct ScriptedPrices {
    prices: Mutex<HashMap<String, f64>>,
    delay: Mutex<Option<std::time::Duration>>,
}

impl ScriptedPrices {
    pub fn set(&self, symbol: &str, price: f64) {
        self.prices.lock().unwrap().insert(symbol.to_string(), price);
    }

    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl PriceSource for ScriptedPrices {
    async fn get_price(&self, symbol: &str) -> anyhow::Result<f64> {
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.prices
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("no price for {symbol}"))
    }
}
