use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::config::{Config, RiskConfig, SignalConfig};
use crate::error::ValidationError;
use crate::exchange::FeatureProvider;
use crate::models::features as f;
use crate::models::{FeatureVector, Side, Timeframe, Vote};
use crate::strategies::cooldown::CooldownState;
use crate::strategies::ensemble::EnsemblePredictor;
use crate::strategies::market_scorer::MarketScorer;
use crate::strategies::signals::{EnsemblePrediction, MarketScore, Signal, SignalOutcome, SuppressedReason};

pub const DERIVED_FROM_NEUTRAL: &str = "derived-from-neutral";

const HISTORY_MAX: usize = 1000;
const HISTORY_KEEP: usize = 500;

/// Merges the ensemble and the market scorer into one buy/sell signal.
pub struct SignalEngine {
    features: Arc<dyn FeatureProvider>,
    ensemble: EnsemblePredictor,
    scorer: MarketScorer,
    cooldown: CooldownState,
    signal_cfg: SignalConfig,
    risk: RiskConfig,
    lookback: usize,
    history: Mutex<Vec<Signal>>,
}

impl SignalEngine {
    pub fn new(cfg: &Config, features: Arc<dyn FeatureProvider>) -> Self {
        Self::with_ensemble(cfg, features, EnsemblePredictor::with_default_models())
    }

    pub fn with_ensemble(
        cfg: &Config,
        features: Arc<dyn FeatureProvider>,
        ensemble: EnsemblePredictor,
    ) -> Self {
        Self {
            features,
            ensemble,
            scorer: MarketScorer::new(cfg.scorer.clone()),
            cooldown: CooldownState::new(cfg.signal.cooldown(), cfg.signal.max_signals_per_hour),
            signal_cfg: cfg.signal.clone(),
            risk: cfg.risk.clone(),
            lookback: cfg.feature_lookback,
            history: Mutex::new(Vec::new()),
        }
    }

    pub async fn generate_signal(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<SignalOutcome, ValidationError> {
        self.generate_signal_at(symbol, timeframe, Utc::now()).await
    }

    /// Evaluate one request as of `now`. Expected "no signal" outcomes are
    /// `SignalOutcome::Suppressed`; only malformed input is an error.
    pub async fn generate_signal_at(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> Result<SignalOutcome, ValidationError> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(ValidationError::EmptySymbol);
        }

        let reservation = match self.cooldown.try_reserve(&symbol, timeframe, now) {
            Ok(r) => r,
            Err(reason) => {
                let detail = match reason {
                    SuppressedReason::RateLimit => {
                        format!("{} signals/hour reached", self.signal_cfg.max_signals_per_hour)
                    }
                    _ => format!("within {}s of last signal", self.signal_cfg.cooldown_secs),
                };
                return Ok(suppress(&symbol, timeframe, reason, detail));
            }
        };

        let features = match self.features.get_features(&symbol, timeframe, self.lookback).await {
            Ok(fv) => fv,
            Err(e) => {
                return Ok(suppress(
                    &symbol,
                    timeframe,
                    SuppressedReason::LowConfidence,
                    format!("features unavailable: {e}"),
                ))
            }
        };
        let Some(price) = features.price() else {
            return Ok(suppress(
                &symbol,
                timeframe,
                SuppressedReason::LowConfidence,
                "no entry price in features".to_string(),
            ));
        };

        // an unavailable prediction is not a neutral opinion
        let prediction = match self.ensemble.predict(&features) {
            Ok(p) => p,
            Err(e) => {
                warn!("{} {} ensemble unavailable: {}", symbol, timeframe, e);
                return Ok(suppress(
                    &symbol,
                    timeframe,
                    SuppressedReason::LowConfidence,
                    format!("prediction unavailable: {e}"),
                ));
            }
        };
        let market = self.scorer.score(&features);
        let both_neutral = prediction.signal == Vote::Neutral && market.recommendation.to_side().is_none();

        if !both_neutral {
            if market.score < self.signal_cfg.min_market_score {
                return Ok(suppress(
                    &symbol,
                    timeframe,
                    SuppressedReason::LowMarketScore,
                    format!("market score {:.2} < {:.2}", market.score, self.signal_cfg.min_market_score),
                ));
            }
            if prediction.confidence < self.signal_cfg.min_ai_confidence {
                return Ok(suppress(
                    &symbol,
                    timeframe,
                    SuppressedReason::LowConfidence,
                    format!(
                        "ensemble confidence {:.2} < {:.2}",
                        prediction.confidence, self.signal_cfg.min_ai_confidence
                    ),
                ));
            }
        }

        let (side, confidence, derived) = self.resolve_direction(&symbol, timeframe, now, &prediction, &market);

        let confirmations = confirmations(side, &prediction, &market, &features, self.volume_confirmation());
        if self.signal_cfg.enable_confluence && confirmations.len() < self.signal_cfg.min_confluence {
            return Ok(suppress(
                &symbol,
                timeframe,
                SuppressedReason::LowConfidence,
                format!(
                    "confluence {}/{} for {} [{}]",
                    confirmations.len(),
                    self.signal_cfg.min_confluence,
                    side,
                    confirmations.join(", ")
                ),
            ));
        }

        let (stop_loss, take_profit) = self.levels(side, price, timeframe, features.get(f::ATR));

        let mut reasons = Vec::new();
        if derived {
            reasons.push(DERIVED_FROM_NEUTRAL.to_string());
        }
        reasons.push(format!(
            "ensemble {} ({:.0}% of {} models)",
            prediction.signal,
            prediction.confidence * 100.0,
            prediction.votes.len()
        ));
        reasons.push(format!(
            "market {} score {:.2} net {:+.2}",
            market.recommendation, market.score, market.net
        ));
        reasons.extend(market.reasons.iter().cloned());
        reasons.extend(confirmations.iter().map(|c| format!("confirmed: {c}")));

        let signal = Signal {
            id: format!("{}_{}_{}", symbol, timeframe, now.format("%Y%m%d_%H%M%S")),
            symbol: symbol.clone(),
            timeframe,
            signal_type: side,
            confidence: confidence.clamp(0.0, 1.0),
            entry_price: price,
            stop_loss,
            take_profit,
            timestamp: now,
            reasons,
            derived_from_neutral: derived,
        };

        reservation.commit(now);
        self.remember(signal.clone());

        info!(
            "SIGNAL {} {} {} | conf {:.2}{} | entry {:.2} SL {:.2} TP {:.2}",
            signal.signal_type.as_str().to_uppercase(),
            signal.symbol,
            signal.timeframe,
            signal.confidence,
            if derived { " (derived-from-neutral)" } else { "" },
            signal.entry_price,
            signal.stop_loss,
            signal.take_profit
        );

        Ok(SignalOutcome::Emitted(signal))
    }

    fn resolve_direction(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        now: DateTime<Utc>,
        prediction: &EnsemblePrediction,
        market: &MarketScore,
    ) -> (Side, f64, bool) {
        match (prediction.signal.to_side(), market.recommendation.to_side()) {
            (Some(a), Some(b)) if a == b => (a, (prediction.confidence + market.score) / 2.0, false),
            (Some(a), None) => (a, prediction.confidence, false),
            (None, Some(b)) => (b, market.score, false),
            (Some(a), Some(b)) => {
                let market_strength = market.net.abs();
                debug!(
                    "{} {} opinions disagree: ensemble {} {:.2} vs market {} {:.2}",
                    symbol, timeframe, a, prediction.confidence, b, market_strength
                );
                if prediction.confidence >= market_strength {
                    (a, prediction.confidence, false)
                } else {
                    (b, market_strength, false)
                }
            }
            (None, None) => {
                let side = neutral_side(symbol, timeframe, now);
                let confidence = prediction.confidence.max(market.score) * self.signal_cfg.neutral_confidence_factor;
                (side, confidence, true)
            }
        }
    }

    /// Stop distance from the timeframe, narrowed by ATR when available
    /// but never below half the base distance.
    fn levels(&self, side: Side, price: f64, timeframe: Timeframe, atr: Option<f64>) -> (f64, f64) {
        let base = price * timeframe.stop_distance_pct();
        let distance = match atr.filter(|a| *a > 0.0) {
            Some(atr) => (atr * self.risk.atr_multiplier).clamp(base * 0.5, base),
            None => base,
        };
        let reward = distance * self.risk.risk_reward;
        match side {
            Side::Buy => (price - distance, price + reward),
            Side::Sell => (price + distance, price - reward),
        }
    }

    fn volume_confirmation(&self) -> f64 {
        self.scorer.weights().volume_confirmation
    }

    fn remember(&self, signal: Signal) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push(signal);
        if history.len() > HISTORY_MAX {
            let excess = history.len() - HISTORY_KEEP;
            history.drain(..excess);
        }
    }

    /// Most recent emitted signals, newest last.
    pub fn recent_signals(&self, limit: usize) -> Vec<Signal> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let start = history.len().saturating_sub(limit);
        history[start..].to_vec()
    }

    pub fn cooldown(&self) -> &CooldownState {
        &self.cooldown
    }
}

fn suppress(symbol: &str, timeframe: Timeframe, reason: SuppressedReason, detail: String) -> SignalOutcome {
    info!("Suppressed {} {}: {} ({})", symbol, timeframe, reason, detail);
    SignalOutcome::suppressed(reason, detail)
}

/// Independent confirmations of `side`.
fn confirmations(
    side: Side,
    prediction: &EnsemblePrediction,
    market: &MarketScore,
    fv: &FeatureVector,
    volume_confirmation: f64,
) -> Vec<String> {
    let mut out = Vec::new();
    if prediction.signal.to_side() == Some(side) {
        out.push("ensemble majority".to_string());
    }
    if market.recommendation.to_side() == Some(side) {
        out.push("market recommendation".to_string());
    }
    if let (Some(fast), Some(slow)) = (fv.get(f::EMA_FAST), fv.get(f::EMA_SLOW)) {
        if (fast - slow) * side.sign() > 0.0 {
            out.push("EMA trend".to_string());
        }
    }
    if let Some(hist) = fv.get(f::MACD_HIST) {
        if hist * side.sign() > 0.0 {
            out.push("MACD histogram".to_string());
        }
    }
    if fv.get(f::VOLUME_RATIO).is_some_and(|r| r >= volume_confirmation) {
        out.push("volume".to_string());
    }
    out
}

/// Deterministic buy/sell pick for a (symbol, timeframe, time-bucket).
///
/// The bucket is the bar index of `at` on `timeframe`, so the pick is stable
/// within a bar. FNV-1a followed by a splitmix64 finalizer keeps the low bit
/// evenly distributed across symbols.
pub fn neutral_side(symbol: &str, timeframe: Timeframe, at: DateTime<Utc>) -> Side {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let bucket = at.timestamp().div_euclid(timeframe.as_seconds() as i64).to_le_bytes();
    let mut h = FNV_OFFSET;
    let bytes = symbol
        .as_bytes()
        .iter()
        .chain(&[0xff])
        .chain(timeframe.as_str().as_bytes())
        .chain(&[0xff])
        .chain(&bucket);
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }

    h ^= h >> 30;
    h = h.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    h ^= h >> 27;
    h = h.wrapping_mul(0x94d0_49bb_1331_11eb);
    h ^= h >> 31;

    if h & 1 == 0 {
        Side::Buy
    } else {
        Side::Sell
    }
}
