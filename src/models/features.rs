use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Timeframe;
use crate::error::FeatureError;

pub const CLOSE: &str = "close";
pub const RSI: &str = "rsi";
pub const EMA_FAST: &str = "ema_12";
pub const EMA_SLOW: &str = "ema_26";
pub const MACD: &str = "macd";
pub const MACD_SIGNAL: &str = "macd_signal";
pub const MACD_HIST: &str = "macd_hist";
pub const BB_UPPER: &str = "bb_upper";
pub const BB_LOWER: &str = "bb_lower";
pub const STOCH_K: &str = "stoch_k";
pub const STOCH_D: &str = "stoch_d";
pub const ATR: &str = "atr";
pub const VOLUME_RATIO: &str = "volume_ratio";
pub const RETURN_5: &str = "return_5";

/// Named indicator values for one (symbol, timeframe) as of a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureVector {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub as_of: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

impl FeatureVector {
    pub fn new(symbol: &str, timeframe: Timeframe, as_of: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            as_of,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: f64) {
        self.values.insert(name.to_string(), value);
    }

    /// Finite value or None.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied().filter(|v| v.is_finite())
    }

    pub fn require(&self, name: &str) -> Result<f64, FeatureError> {
        match self.values.get(name) {
            None => Err(FeatureError::MissingIndicator(name.to_string())),
            Some(v) if !v.is_finite() => Err(FeatureError::NonFinite(name.to_string())),
            Some(v) => Ok(*v),
        }
    }

    /// Last close, if present and positive.
    pub fn price(&self) -> Option<f64> {
        self.get(CLOSE).filter(|p| *p > 0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn validate(&self) -> Result<(), FeatureError> {
        if self.values.is_empty() {
            return Err(FeatureError::Empty);
        }
        if let Some((name, _)) = self.values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(FeatureError::NonFinite(name.clone()));
        }
        Ok(())
    }

    /// Position of price inside the Bollinger band, 0 at lower and 1 at upper.
    pub fn bollinger_position(&self) -> Option<f64> {
        let close = self.get(CLOSE)?;
        let upper = self.get(BB_UPPER)?;
        let lower = self.get(BB_LOWER)?;
        let width = upper - lower;
        if width <= 0.0 {
            return None;
        }
        Some((close - lower) / width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_distinguishes_missing_and_non_finite() {
        let fv = FeatureVector::new("BTC-USD", Timeframe::H1, Utc::now())
            .with(RSI, 40.0)
            .with(MACD, f64::NAN);
        assert_eq!(fv.require(RSI).unwrap(), 40.0);
        assert!(matches!(fv.require(ATR), Err(FeatureError::MissingIndicator(_))));
        assert!(matches!(fv.require(MACD), Err(FeatureError::NonFinite(_))));
        assert!(fv.get(MACD).is_none());
        assert!(matches!(fv.validate(), Err(FeatureError::NonFinite(_))));
    }

    #[test]
    fn empty_vector_fails_validation() {
        let fv = FeatureVector::new("BTC-USD", Timeframe::H1, Utc::now());
        assert!(matches!(fv.validate(), Err(FeatureError::Empty)));
        assert!(fv.price().is_none());
    }

    #[test]
    fn bollinger_position_spans_band() {
        let fv = FeatureVector::new("ETH-USD", Timeframe::M5, Utc::now())
            .with(CLOSE, 105.0)
            .with(BB_UPPER, 110.0)
            .with(BB_LOWER, 90.0);
        assert!((fv.bollinger_position().unwrap() - 0.75).abs() < 1e-9);
    }
}
