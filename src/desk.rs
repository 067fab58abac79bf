use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{TradeError, ValidationError};
use crate::exchange::{FeatureProvider, PositionStore, PriceSource};
use crate::models::{ExitReason, Timeframe};
use crate::strategies::signals::{Signal, SignalOutcome};
use crate::strategies::SignalEngine;
use crate::trading::{
    AutoMonitor, BucketStats, CloseOutcome, DetailedStats, MonitorHandle, PortfolioSnapshot, Position,
    PositionManager, TradeAnalyzer, TradeNotification,
};

/// Buckets with fewer closed trades than this are not judged for edge.
const MIN_BUCKET_SAMPLE: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub open_positions: usize,
    pub degraded_symbols: Vec<String>,
}

/// Owns the shared state (cooldowns, positions, portfolio) and the monitor
/// task. Everything the outside world can ask of the bot goes through here.
pub struct TradingDesk {
    config: Config,
    engine: SignalEngine,
    manager: Arc<PositionManager>,
    monitor: Arc<AutoMonitor>,
    prices: Arc<dyn PriceSource>,
    analyzer: TradeAnalyzer,
    handle: Mutex<Option<MonitorHandle>>,
}

impl TradingDesk {
    pub fn new(
        config: Config,
        features: Arc<dyn FeatureProvider>,
        prices: Arc<dyn PriceSource>,
        store: Arc<dyn PositionStore>,
    ) -> Self {
        let engine = SignalEngine::new(&config, features);
        let manager = Arc::new(PositionManager::new(
            config.initial_balance,
            config.max_open_positions,
            store,
        ));
        let monitor = Arc::new(AutoMonitor::new(
            manager.clone(),
            prices.clone(),
            config.monitor.clone(),
        ));
        Self {
            config,
            engine,
            manager,
            monitor,
            prices,
            analyzer: TradeAnalyzer::new(MIN_BUCKET_SAMPLE),
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &SignalEngine {
        &self.engine
    }

    pub fn positions(&self) -> &Arc<PositionManager> {
        &self.manager
    }

    pub fn monitor(&self) -> &Arc<AutoMonitor> {
        &self.monitor
    }

    /// Load persisted positions. Call once, before the monitor starts.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        self.manager.restore().await
    }

    pub async fn generate_signal(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<SignalOutcome, ValidationError> {
        let tf = Timeframe::from_str_loose(timeframe)
            .ok_or_else(|| ValidationError::UnknownTimeframe(timeframe.to_string()))?;
        self.engine.generate_signal(symbol, tf).await
    }

    /// Open a paper position from an emitted signal.
    pub async fn confirm_signal(&self, signal: &Signal, amount: f64) -> Result<Uuid, TradeError> {
        let id = self.manager.open(signal, amount).await?;
        info!("Signal {} confirmed as position {}", signal.id, id);
        Ok(id)
    }

    /// Manual close at the best available price.
    pub async fn close_trade(&self, id: Uuid) -> Result<CloseOutcome, TradeError> {
        let pos = self.manager.get(id).await.ok_or(TradeError::NotFound(id))?;
        if !pos.is_open() {
            let price = pos.exit_price.unwrap_or(pos.entry_price);
            return self.manager.close(id, price, ExitReason::Manual).await;
        }

        let price = self.manual_close_price(&pos).await;
        self.manager.close(id, price, ExitReason::Manual).await
    }

    async fn manual_close_price(&self, pos: &Position) -> f64 {
        let timeout = self.monitor.config().fetch_timeout();
        let err = match tokio::time::timeout(timeout, self.prices.get_price(&pos.symbol)).await {
            Ok(Ok(p)) if p.is_finite() && p > 0.0 => return p,
            Ok(Ok(p)) => format!("invalid price {p}"),
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => format!("timed out after {}s", timeout.as_secs()),
        };

        let (price, source) = match self.monitor.last_price(&pos.symbol) {
            Some(p) => (p, "last monitored price"),
            None => match pos.current_price {
                Some(p) => (p, "last position price"),
                None => (pos.entry_price, "entry price"),
            },
        };
        warn!(
            "No live price for {} ({}); closing {} at {} {:.2}",
            pos.symbol, err, pos.id, source, price
        );
        price
    }

    pub async fn get_portfolio(&self) -> PortfolioSnapshot {
        self.manager.get_portfolio().await
    }

    pub async fn get_history(&self) -> Vec<Position> {
        self.manager.history().await
    }

    pub async fn get_detailed_stats(&self) -> DetailedStats {
        self.analyzer.detailed_stats(&self.manager.history().await)
    }

    /// Sufficiently sampled buckets that lose money on average, worst first.
    pub async fn losing_buckets(&self) -> Vec<BucketStats> {
        let analysis = self.analyzer.analyze(&self.manager.history().await);
        self.analyzer.get_negative_edge_buckets(&analysis)
    }

    pub async fn get_trade_notifications(&self, limit: usize) -> Vec<TradeNotification> {
        self.manager.notifications(limit).await
    }

    /// Start the auto-monitor. A second call while running does nothing.
    pub async fn start_monitor(&self) {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| h.is_running()) {
            return;
        }
        *handle = Some(self.monitor.clone().start());
    }

    /// Stop the monitor, letting an in-flight tick finish.
    pub async fn shutdown(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(h) = handle {
            h.stop().await;
        }
        info!("Trading desk shut down");
    }

    pub async fn monitor_status(&self) -> MonitorStatus {
        let running = self
            .handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| h.is_running());
        MonitorStatus {
            running,
            interval_secs: self.monitor.config().interval_secs,
            open_positions: self.manager.open_ids().await.len(),
            degraded_symbols: self.monitor.degraded_symbols(),
        }
    }
}
