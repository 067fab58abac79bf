use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{Recommendation, Side, Timeframe, Vote};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVote {
    pub model_id: String,
    pub vote: Vote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsemblePrediction {
    pub symbol: String,
    pub signal: Vote,
    pub confidence: f64,
    pub votes: Vec<ModelVote>,
}

impl EnsemblePrediction {
    /// Stand-in when no prediction is available.
    pub fn unavailable(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            signal: Vote::Neutral,
            confidence: 0.0,
            votes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketScore {
    pub symbol: String,
    pub score: f64,
    /// Signed weighted factor sum in [-1, 1].
    pub net: f64,
    pub recommendation: Recommendation,
    pub reasons: Vec<String>,
}

/// A finalized buy/sell recommendation. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub signal_type: Side,
    pub confidence: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub timestamp: DateTime<Utc>,
    pub reasons: Vec<String>,
    #[serde(default)]
    pub derived_from_neutral: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressedReason {
    Cooldown,
    RateLimit,
    LowConfidence,
    LowMarketScore,
}

impl SuppressedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressedReason::Cooldown => "cooldown",
            SuppressedReason::RateLimit => "rate_limit",
            SuppressedReason::LowConfidence => "low_confidence",
            SuppressedReason::LowMarketScore => "low_market_score",
        }
    }
}

impl fmt::Display for SuppressedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suppression {
    pub reason: SuppressedReason,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SignalOutcome {
    Emitted(Signal),
    Suppressed(Suppression),
}

impl SignalOutcome {
    pub fn suppressed(reason: SuppressedReason, detail: impl Into<String>) -> Self {
        SignalOutcome::Suppressed(Suppression {
            reason,
            detail: detail.into(),
        })
    }

    pub fn signal(&self) -> Option<&Signal> {
        match self {
            SignalOutcome::Emitted(s) => Some(s),
            SignalOutcome::Suppressed(_) => None,
        }
    }

    pub fn into_signal(self) -> Option<Signal> {
        match self {
            SignalOutcome::Emitted(s) => Some(s),
            SignalOutcome::Suppressed(_) => None,
        }
    }

    pub fn reason(&self) -> Option<SuppressedReason> {
        match self {
            SignalOutcome::Emitted(_) => None,
            SignalOutcome::Suppressed(s) => Some(s.reason),
        }
    }
}
