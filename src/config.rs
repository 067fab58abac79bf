use crate::models::Timeframe;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    pub min_ai_confidence: f64,
    pub min_market_score: f64,
    pub cooldown_secs: u64,
    pub max_signals_per_hour: usize,
    pub enable_confluence: bool,
    pub min_confluence: usize,
    /// Multiplier applied to confidence when direction is derived from two neutral opinions.
    pub neutral_confidence_factor: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            min_ai_confidence: 0.4,
            min_market_score: 0.25,
            cooldown_secs: 60,
            max_signals_per_hour: 50,
            enable_confluence: true,
            min_confluence: 2,
            neutral_confidence_factor: 0.5,
        }
    }
}

impl SignalConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerWeights {
    pub momentum: f64,
    pub trend: f64,
    pub volatility: f64,
    pub volume: f64,
    /// Net directional strength needed for buy/sell instead of hold.
    pub recommendation_margin: f64,
    pub volume_confirmation: f64,
}

impl Default for ScorerWeights {
    fn default() -> Self {
        Self {
            momentum: 0.35,
            trend: 0.30,
            volatility: 0.15,
            volume: 0.20,
            recommendation_margin: 0.15,
            volume_confirmation: 1.5,
        }
    }
}

impl ScorerWeights {
    pub fn total(&self) -> f64 {
        self.momentum + self.trend + self.volatility + self.volume
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub risk_reward: f64,
    pub atr_multiplier: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_reward: 2.0,
            atr_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub fetch_timeout_secs: u64,
    /// Consecutive fetch failures before a symbol is flagged degraded.
    pub degraded_after: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            fetch_timeout_secs: 5,
            degraded_after: 3,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Market
    pub symbols: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    pub feature_lookback: usize,

    pub signal: SignalConfig,
    pub scorer: ScorerWeights,
    pub risk: RiskConfig,
    pub monitor: MonitorConfig,

    // Paper Trading
    pub initial_balance: f64,
    pub default_trade_amount: f64,
    pub max_open_positions: usize,
    pub auto_confirm: bool,
    pub scan_interval: u64,

    // Logging
    pub log_dir: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec!["BTC-USD".to_string(), "ETH-USD".to_string()],
            timeframes: vec![Timeframe::H1],
            feature_lookback: 200,
            signal: SignalConfig::default(),
            scorer: ScorerWeights::default(),
            risk: RiskConfig::default(),
            monitor: MonitorConfig::default(),
            initial_balance: 10_000.0,
            default_trade_amount: 1_000.0,
            max_open_positions: 5,
            auto_confirm: false,
            scan_interval: 60,
            log_dir: "logs".to_string(),
            log_level: "INFO".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let env = |key: &str, default: &str| -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };
        let flag = |key: &str, default: bool| -> bool {
            match std::env::var(key) {
                Ok(v) => matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
                Err(_) => default,
            }
        };

        let d = Config::default();

        let symbols: Vec<String> = env("SYMBOLS", "BTC-USD,ETH-USD")
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        let timeframes: Vec<Timeframe> = env("TIMEFRAMES", "1h")
            .split(',')
            .filter_map(Timeframe::from_str_loose)
            .collect();

        Config {
            symbols: if symbols.is_empty() { d.symbols } else { symbols },
            timeframes: if timeframes.is_empty() { d.timeframes } else { timeframes },
            feature_lookback: env("FEATURE_LOOKBACK", "200").parse().unwrap_or(200),
            signal: SignalConfig {
                min_ai_confidence: env("MIN_AI_CONFIDENCE", "0.4").parse().unwrap_or(0.4),
                min_market_score: env("MIN_MARKET_SCORE", "0.25").parse().unwrap_or(0.25),
                cooldown_secs: env("SIGNAL_COOLDOWN_SECS", "60").parse().unwrap_or(60),
                max_signals_per_hour: env("MAX_SIGNALS_PER_HOUR", "50").parse().unwrap_or(50),
                enable_confluence: flag("ENABLE_CONFLUENCE", true),
                min_confluence: env("MIN_CONFLUENCE", "2").parse().unwrap_or(2),
                neutral_confidence_factor: env("NEUTRAL_CONFIDENCE_FACTOR", "0.5")
                    .parse()
                    .unwrap_or(0.5),
            },
            scorer: ScorerWeights {
                momentum: env("WEIGHT_MOMENTUM", "0.35").parse().unwrap_or(0.35),
                trend: env("WEIGHT_TREND", "0.30").parse().unwrap_or(0.30),
                volatility: env("WEIGHT_VOLATILITY", "0.15").parse().unwrap_or(0.15),
                volume: env("WEIGHT_VOLUME", "0.20").parse().unwrap_or(0.20),
                recommendation_margin: env("RECOMMENDATION_MARGIN", "0.15")
                    .parse()
                    .unwrap_or(0.15),
                volume_confirmation: env("VOLUME_CONFIRMATION", "1.5").parse().unwrap_or(1.5),
            },
            risk: RiskConfig {
                risk_reward: env("RISK_REWARD", "2.0").parse().unwrap_or(2.0),
                atr_multiplier: env("ATR_MULTIPLIER", "2.0").parse().unwrap_or(2.0),
            },
            monitor: MonitorConfig {
                interval_secs: env("MONITOR_INTERVAL_SECS", "30").parse().unwrap_or(30),
                fetch_timeout_secs: env("PRICE_TIMEOUT_SECS", "5").parse().unwrap_or(5),
                degraded_after: env("DEGRADED_AFTER", "3").parse().unwrap_or(3),
            },
            initial_balance: env("INITIAL_BALANCE", "10000").parse().unwrap_or(10_000.0),
            default_trade_amount: env("TRADE_AMOUNT", "1000").parse().unwrap_or(1_000.0),
            max_open_positions: env("MAX_OPEN_POSITIONS", "5").parse().unwrap_or(5),
            auto_confirm: flag("AUTO_CONFIRM", false),
            scan_interval: env("SCAN_INTERVAL_SECS", "60").parse().unwrap_or(60),
            log_dir: env("LOG_DIR", "logs"),
            log_level: env("LOG_LEVEL", "INFO"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| -> Result<()> {
            if !(0.0..=1.0).contains(&v) {
                bail!("{name} must be within [0, 1], got {v}");
            }
            Ok(())
        };
        unit("min_ai_confidence", self.signal.min_ai_confidence)?;
        unit("min_market_score", self.signal.min_market_score)?;
        unit("neutral_confidence_factor", self.signal.neutral_confidence_factor)?;

        if self.signal.enable_confluence && self.signal.min_confluence == 0 {
            bail!("min_confluence must be at least 1 when confluence is enabled");
        }
        if self.scorer.total() <= 0.0 {
            bail!("scorer weights must sum to a positive value");
        }
        if self.risk.risk_reward <= 0.0 {
            bail!("risk_reward must be positive");
        }
        if self.monitor.interval_secs == 0 || self.monitor.fetch_timeout_secs == 0 {
            bail!("monitor interval and fetch timeout must be positive");
        }
        if self.scan_interval == 0 {
            bail!("scan interval must be positive");
        }
        if self.initial_balance <= 0.0 || self.default_trade_amount <= 0.0 {
            bail!("balance and trade amount must be positive");
        }
        if self.symbols.is_empty() {
            bail!("at least one symbol is required");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.signal.min_confluence, 2);
        assert_eq!(cfg.monitor.interval(), Duration::from_secs(30));
    }

    #[test]
    fn validate_rejects_out_of_range_thresholds() {
        let mut cfg = Config::default();
        cfg.signal.min_ai_confidence = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.signal.min_confluence = 0;
        assert!(cfg.validate().is_err());
        cfg.signal.enable_confluence = false;
        assert!(cfg.validate().is_ok());

        let mut cfg = Config::default();
        cfg.monitor.interval_secs = 0;
        assert!(cfg.validate().is_err());
    }
}
