use std::sync::Arc;
use tracing::debug;

use crate::error::FeatureError;
use crate::models::features as f;
use crate::models::{FeatureVector, Vote};
use crate::strategies::signals::{EnsemblePrediction, ModelVote};

/// A single predictive model: one vote from a feature vector.
pub trait VoteModel: Send + Sync {
    fn id(&self) -> &str;
    fn predict_vote(&self, features: &FeatureVector) -> Result<Vote, FeatureError>;
}

/// Combine votes: signal is the sign of the vote sum (ties give neutral),
/// confidence is the share of votes equal to that signal.
pub fn aggregate(symbol: &str, votes: Vec<ModelVote>) -> EnsemblePrediction {
    if votes.is_empty() {
        return EnsemblePrediction::unavailable(symbol);
    }
    let sum: i64 = votes.iter().map(|v| v.vote.value() as i64).sum();
    let signal = Vote::from_value(sum);
    let agreeing = votes.iter().filter(|v| v.vote == signal).count();

    EnsemblePrediction {
        symbol: symbol.to_string(),
        signal,
        confidence: agreeing as f64 / votes.len() as f64,
        votes,
    }
}

/// Fixed, ordered collection of vote models.
#[derive(Clone)]
pub struct EnsemblePredictor {
    models: Vec<Arc<dyn VoteModel>>,
}

impl EnsemblePredictor {
    pub fn new(models: Vec<Arc<dyn VoteModel>>) -> Self {
        Self { models }
    }

    /// RSI zones, MACD cross, EMA cross, Bollinger position and Stochastic.
    pub fn with_default_models() -> Self {
        Self::new(vec![
            Arc::new(RsiZoneModel::default()),
            Arc::new(MacdModel),
            Arc::new(EmaCrossModel::default()),
            Arc::new(BollingerModel::default()),
            Arc::new(StochasticModel::default()),
        ])
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn predict(&self, features: &FeatureVector) -> Result<EnsemblePrediction, FeatureError> {
        if self.models.is_empty() {
            return Err(FeatureError::NoModels);
        }
        features.validate()?;

        let votes = self
            .models
            .iter()
            .map(|m| {
                m.predict_vote(features).map(|vote| ModelVote {
                    model_id: m.id().to_string(),
                    vote,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let prediction = aggregate(&features.symbol, votes);
        debug!(
            "{} ensemble: signal {} confidence {:.2} ({} models)",
            features.symbol,
            prediction.signal,
            prediction.confidence,
            prediction.votes.len()
        );
        Ok(prediction)
    }
}

pub struct RsiZoneModel {
    pub oversold: f64,
    pub overbought: f64,
}

impl Default for RsiZoneModel {
    fn default() -> Self {
        Self {
            oversold: 35.0,
            overbought: 65.0,
        }
    }
}

impl VoteModel for RsiZoneModel {
    fn id(&self) -> &str {
        "rsi_zone"
    }

    fn predict_vote(&self, features: &FeatureVector) -> Result<Vote, FeatureError> {
        let rsi = features.require(f::RSI)?;
        Ok(if rsi < self.oversold {
            Vote::Buy
        } else if rsi > self.overbought {
            Vote::Sell
        } else {
            Vote::Neutral
        })
    }
}

pub struct MacdModel;

impl VoteModel for MacdModel {
    fn id(&self) -> &str {
        "macd"
    }

    fn predict_vote(&self, features: &FeatureVector) -> Result<Vote, FeatureError> {
        let line = features.require(f::MACD)?;
        let signal = features.require(f::MACD_SIGNAL)?;
        Ok(if line > signal {
            Vote::Buy
        } else if line < signal {
            Vote::Sell
        } else {
            Vote::Neutral
        })
    }
}

pub struct EmaCrossModel {
    /// Relative spread below which the averages count as flat.
    pub dead_band: f64,
}

impl Default for EmaCrossModel {
    fn default() -> Self {
        Self { dead_band: 0.0005 }
    }
}

impl VoteModel for EmaCrossModel {
    fn id(&self) -> &str {
        "ema_cross"
    }

    fn predict_vote(&self, features: &FeatureVector) -> Result<Vote, FeatureError> {
        let fast = features.require(f::EMA_FAST)?;
        let slow = features.require(f::EMA_SLOW)?;
        if slow <= 0.0 {
            return Err(FeatureError::NonFinite(f::EMA_SLOW.to_string()));
        }
        let spread = (fast - slow) / slow;
        Ok(if spread > self.dead_band {
            Vote::Buy
        } else if spread < -self.dead_band {
            Vote::Sell
        } else {
            Vote::Neutral
        })
    }
}

pub struct BollingerModel {
    pub lower_zone: f64,
    pub upper_zone: f64,
}

impl Default for BollingerModel {
    fn default() -> Self {
        Self {
            lower_zone: 0.2,
            upper_zone: 0.8,
        }
    }
}

impl VoteModel for BollingerModel {
    fn id(&self) -> &str {
        "bollinger"
    }

    fn predict_vote(&self, features: &FeatureVector) -> Result<Vote, FeatureError> {
        features.require(f::CLOSE)?;
        features.require(f::BB_UPPER)?;
        features.require(f::BB_LOWER)?;
        // zero-width band: no opinion
        let Some(pos) = features.bollinger_position() else {
            return Ok(Vote::Neutral);
        };
        Ok(if pos <= self.lower_zone {
            Vote::Buy
        } else if pos >= self.upper_zone {
            Vote::Sell
        } else {
            Vote::Neutral
        })
    }
}

pub struct StochasticModel {
    pub oversold: f64,
    pub overbought: f64,
}

impl Default for StochasticModel {
    fn default() -> Self {
        Self {
            oversold: 25.0,
            overbought: 75.0,
        }
    }
}

impl VoteModel for StochasticModel {
    fn id(&self) -> &str {
        "stochastic"
    }

    fn predict_vote(&self, features: &FeatureVector) -> Result<Vote, FeatureError> {
        let k = features.require(f::STOCH_K)?;
        let d = features.require(f::STOCH_D)?;
        Ok(if k < self.oversold && k > d {
            Vote::Buy
        } else if k > self.overbought && k < d {
            Vote::Sell
        } else {
            Vote::Neutral
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{fixed_votes, neutral_features};

    fn votes(values: &[i8]) -> Vec<ModelVote> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| ModelVote {
                model_id: format!("m{i}"),
                vote: Vote::from_value(*v as i64),
            })
            .collect()
    }

    #[test]
    fn unanimous_buy_has_full_confidence() {
        let p = aggregate("BTC-USD", votes(&[1, 1, 1, 1, 1]));
        assert_eq!(p.signal, Vote::Buy);
        assert_eq!(p.confidence, 1.0);
    }

    #[test]
    fn tie_resolves_to_neutral() {
        let p = aggregate("BTC-USD", votes(&[1, -1, 1, -1]));
        assert_eq!(p.signal, Vote::Neutral);
        assert_eq!(p.confidence, 0.0);

        let p = aggregate("BTC-USD", votes(&[1, -1, 0]));
        assert_eq!(p.signal, Vote::Neutral);
        assert!((p.confidence - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn all_neutral_confidence_is_neutral_share() {
        let p = aggregate("BTC-USD", votes(&[0, 0, 0]));
        assert_eq!(p.signal, Vote::Neutral);
        assert_eq!(p.confidence, 1.0);
    }

    #[test]
    fn signal_is_sign_of_sum_for_every_multiset() {
        // every multiset of 5 votes over {-1, 0, +1}
        for buys in 0..=5usize {
            for sells in 0..=(5 - buys) {
                let neutrals = 5 - buys - sells;
                let mut v = vec![1i8; buys];
                v.extend(std::iter::repeat(-1).take(sells));
                v.extend(std::iter::repeat(0).take(neutrals));
                let p = aggregate("X", votes(&v));

                let expected = (buys as i64 - sells as i64).signum();
                assert_eq!(p.signal.value() as i64, expected);
                assert!((0.0..=1.0).contains(&p.confidence));
                let agreeing = match expected {
                    1 => buys,
                    -1 => sells,
                    _ => neutrals,
                };
                assert!((p.confidence - agreeing as f64 / 5.0).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn majority_confidence_counts_only_agreeing_votes() {
        let p = aggregate("BTC-USD", votes(&[1, 1, -1, 0, 0]));
        assert_eq!(p.signal, Vote::Buy);
        assert!((p.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn missing_indicator_is_unavailable_not_a_crash() {
        let ensemble = EnsemblePredictor::with_default_models();
        let fv = neutral_features("BTC-USD").with(f::RSI, 20.0);
        let mut partial = fv.clone();
        partial.values.remove(f::STOCH_K);

        assert!(matches!(
            ensemble.predict(&partial),
            Err(FeatureError::MissingIndicator(_))
        ));
        assert!(ensemble.predict(&fv).is_ok());
    }

    #[test]
    fn empty_ensemble_reports_no_models() {
        let ensemble = EnsemblePredictor::new(Vec::new());
        let fv = neutral_features("BTC-USD");
        assert!(matches!(ensemble.predict(&fv), Err(FeatureError::NoModels)));
    }

    #[test]
    fn votes_keep_model_order() {
        let ensemble = fixed_votes(&[Vote::Buy, Vote::Sell, Vote::Buy]);
        let p = ensemble.predict(&neutral_features("ETH-USD")).unwrap();
        let ids: Vec<&str> = p.votes.iter().map(|v| v.model_id.as_str()).collect();
        assert_eq!(ids, vec!["fixed_0", "fixed_1", "fixed_2"]);
        assert_eq!(p.signal, Vote::Buy);
    }

    #[test]
    fn default_models_read_neutral_features_as_neutral() {
        let ensemble = EnsemblePredictor::with_default_models();
        let p = ensemble.predict(&neutral_features("BTC-USD")).unwrap();
        assert_eq!(p.votes.len(), 5);
        assert_eq!(p.signal, Vote::Neutral);
        assert_eq!(p.confidence, 1.0);
    }

    #[test]
    fn rule_models_follow_zones() {
        let fv = neutral_features("BTC-USD")
            .with(f::RSI, 70.0)
            .with(f::STOCH_K, 20.0)
            .with(f::STOCH_D, 15.0);
        assert_eq!(RsiZoneModel::default().predict_vote(&fv).unwrap(), Vote::Sell);
        assert_eq!(StochasticModel::default().predict_vote(&fv).unwrap(), Vote::Buy);

        let fv = fv.with(f::CLOSE, 91.0).with(f::BB_UPPER, 110.0).with(f::BB_LOWER, 90.0);
        assert_eq!(BollingerModel::default().predict_vote(&fv).unwrap(), Vote::Buy);
    }
}
