use tracing::debug;

use crate::config::ScorerWeights;
use crate::models::features as f;
use crate::models::{FeatureVector, Recommendation};
use crate::strategies::signals::MarketScore;

/// Trend spread (EMA12 vs EMA26) at which the trend factor saturates.
const TREND_FULL_SPREAD: f64 = 0.01;

/// Rule-based market opinion, independent of the ensemble.
#[derive(Debug, Clone)]
pub struct MarketScorer {
    weights: ScorerWeights,
}

struct Factor {
    name: &'static str,
    weight: f64,
    value: f64,
    note: String,
}

impl MarketScorer {
    pub fn new(weights: ScorerWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScorerWeights {
        &self.weights
    }

    pub fn score(&self, features: &FeatureVector) -> MarketScore {
        let w = &self.weights;
        let factors: Vec<Factor> = [
            momentum(features).map(|(v, n)| ("momentum", w.momentum, v, n)),
            trend(features).map(|(v, n)| ("trend", w.trend, v, n)),
            volatility(features).map(|(v, n)| ("volatility", w.volatility, v, n)),
            volume(features).map(|(v, n)| ("volume", w.volume, v, n)),
        ]
        .into_iter()
        .flatten()
        .map(|(name, weight, value, note)| Factor {
            name,
            weight,
            value: value.clamp(-1.0, 1.0),
            note,
        })
        .collect();

        let total = w.total();
        let (score, net) = if total > 0.0 {
            (
                factors.iter().map(|x| x.weight * x.value.abs()).sum::<f64>() / total,
                factors.iter().map(|x| x.weight * x.value).sum::<f64>() / total,
            )
        } else {
            (0.0, 0.0)
        };

        let recommendation = if net >= w.recommendation_margin {
            Recommendation::Buy
        } else if net <= -w.recommendation_margin {
            Recommendation::Sell
        } else {
            Recommendation::Hold
        };

        let reasons = factors
            .iter()
            .map(|x| format!("{} {:+.2}: {}", x.name, x.value, x.note))
            .collect();

        debug!(
            "{} market score {:.2} net {:+.2} -> {}",
            features.symbol, score, net, recommendation
        );

        MarketScore {
            symbol: features.symbol.clone(),
            score: score.clamp(0.0, 1.0),
            net: net.clamp(-1.0, 1.0),
            recommendation,
            reasons,
        }
    }
}

/// RSI is read as mean-reversion at the extremes and trend-following in between.
fn momentum(fv: &FeatureVector) -> Option<(f64, String)> {
    let rsi_part = fv.get(f::RSI).map(|rsi| {
        if rsi > 70.0 {
            -0.6
        } else if rsi < 30.0 {
            0.6
        } else {
            (rsi - 50.0) / 20.0
        }
    });
    let macd_part = fv.get(f::MACD_HIST).map(sign);

    let parts: Vec<f64> = [rsi_part, macd_part].into_iter().flatten().collect();
    if parts.is_empty() {
        return None;
    }
    let value = parts.iter().sum::<f64>() / parts.len() as f64;
    let note = match (fv.get(f::RSI), fv.get(f::MACD_HIST)) {
        (Some(rsi), Some(h)) => format!("RSI {:.1}, MACD hist {:+.4}", rsi, h),
        (Some(rsi), None) => format!("RSI {:.1}", rsi),
        (None, Some(h)) => format!("MACD hist {:+.4}", h),
        (None, None) => String::new(),
    };
    Some((value, note))
}

fn trend(fv: &FeatureVector) -> Option<(f64, String)> {
    let fast = fv.get(f::EMA_FAST)?;
    let slow = fv.get(f::EMA_SLOW).filter(|s| *s > 0.0)?;
    let spread = (fast - slow) / slow;
    Some((
        spread / TREND_FULL_SPREAD,
        format!("EMA12/EMA26 spread {:+.3}%", spread * 100.0),
    ))
}

/// Bollinger position: near the lower band is bullish, near the upper band bearish.
fn volatility(fv: &FeatureVector) -> Option<(f64, String)> {
    let pos = fv.bollinger_position()?;
    Some(((0.5 - pos) * 2.0, format!("Bollinger position {:.2}", pos)))
}

/// Above-average volume amplifies the direction of the recent return.
fn volume(fv: &FeatureVector) -> Option<(f64, String)> {
    let ratio = fv.get(f::VOLUME_RATIO)?;
    let ret = fv.get(f::RETURN_5)?;
    Some((
        (ratio - 1.0).clamp(0.0, 1.0) * sign(ret),
        format!("volume {:.2}x avg, 5-bar return {:+.2}%", ratio, ret * 100.0),
    ))
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}
