use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::TradeError;
use crate::exchange::PriceSource;
use crate::models::{ExitReason, Side};
use crate::trading::position_manager::{CloseOutcome, Position, PositionManager};

/// Price-triggered exit for `position` at `price`. Stop-loss wins when both apply.
pub fn evaluate_exit(position: &Position, price: f64) -> Option<ExitReason> {
    match position.side {
        Side::Buy => {
            if price <= position.stop_loss {
                Some(ExitReason::StopLoss)
            } else if price >= position.take_profit {
                Some(ExitReason::TakeProfit)
            } else {
                None
            }
        }
        Side::Sell => {
            if price >= position.stop_loss {
                Some(ExitReason::StopLoss)
            } else if price <= position.take_profit {
                Some(ExitReason::TakeProfit)
            } else {
                None
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SymbolHealth {
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub last_error: Option<String>,
    pub last_price: Option<f64>,
    pub last_success: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub priced: usize,
    pub closed: Vec<Position>,
    pub skipped_symbols: Vec<String>,
}

/// Periodically prices open positions and closes those that hit SL or TP.
pub struct AutoMonitor {
    manager: Arc<PositionManager>,
    prices: Arc<dyn PriceSource>,
    cfg: MonitorConfig,
    health: Mutex<HashMap<String, SymbolHealth>>,
}

impl AutoMonitor {
    pub fn new(manager: Arc<PositionManager>, prices: Arc<dyn PriceSource>, cfg: MonitorConfig) -> Self {
        Self {
            manager,
            prices,
            cfg,
            health: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.cfg
    }

    fn health_lock(&self) -> MutexGuard<'_, HashMap<String, SymbolHealth>> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One pass over every open position.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let mut by_symbol: BTreeMap<String, Vec<Position>> = BTreeMap::new();
        for pos in self.manager.open_positions().await {
            by_symbol.entry(pos.symbol.clone()).or_default().push(pos);
        }
        if by_symbol.is_empty() {
            return report;
        }

        for (symbol, positions) in by_symbol {
            let Some(price) = self.fetch_price(&symbol).await else {
                report.skipped_symbols.push(symbol);
                continue;
            };

            for pos in positions {
                match self.manager.update_price(pos.id, price).await {
                    Ok(_) => report.priced += 1,
                    // closed since the snapshot was taken
                    Err(TradeError::NotOpen(_)) => continue,
                    Err(e) => {
                        warn!("Could not update {} {}: {}", symbol, pos.id, e);
                        continue;
                    }
                }

                let Some(reason) = evaluate_exit(&pos, price) else {
                    continue;
                };
                match self.manager.close(pos.id, price, reason).await {
                    Ok(CloseOutcome::Closed(closed)) => {
                        info!(
                            "Auto-closed {} {} at {:.2} ({})",
                            closed.symbol, closed.id, price, reason
                        );
                        report.closed.push(closed);
                    }
                    Ok(CloseOutcome::AlreadyClosed(_)) => {}
                    Err(e) => warn!("Auto-close of {} failed: {}", pos.id, e),
                }
            }
        }

        debug!(
            "Monitor tick: {} priced, {} closed, {} skipped",
            report.priced,
            report.closed.len(),
            report.skipped_symbols.len()
        );
        report
    }

    /// Fetch with the per-symbol timeout, recording health either way.
    async fn fetch_price(&self, symbol: &str) -> Option<f64> {
        let result = match tokio::time::timeout(self.cfg.fetch_timeout(), self.prices.get_price(symbol)).await {
            Ok(Ok(p)) if p.is_finite() && p > 0.0 => Ok(p),
            Ok(Ok(p)) => Err(format!("invalid price {p}")),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err(format!("timed out after {}s", self.cfg.fetch_timeout_secs)),
        };

        let mut health = self.health_lock();
        let entry = health.entry(symbol.to_string()).or_default();
        match result {
            Ok(price) => {
                if entry.degraded {
                    info!("{} price feed recovered after {} failures", symbol, entry.consecutive_failures);
                }
                entry.consecutive_failures = 0;
                entry.degraded = false;
                entry.last_error = None;
                entry.last_price = Some(price);
                entry.last_success = Some(Utc::now());
                Some(price)
            }
            Err(err) => {
                entry.consecutive_failures += 1;
                warn!(
                    "Price fetch for {} failed ({} in a row): {}",
                    symbol, entry.consecutive_failures, err
                );
                if !entry.degraded && entry.consecutive_failures >= self.cfg.degraded_after {
                    entry.degraded = true;
                    warn!("{} marked DEGRADED", symbol);
                }
                entry.last_error = Some(err);
                None
            }
        }
    }

    pub fn is_degraded(&self, symbol: &str) -> bool {
        self.health_lock().get(symbol).is_some_and(|h| h.degraded)
    }

    pub fn degraded_symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .health_lock()
            .iter()
            .filter(|(_, h)| h.degraded)
            .map(|(s, _)| s.clone())
            .collect();
        out.sort();
        out
    }

    pub fn health(&self) -> HashMap<String, SymbolHealth> {
        self.health_lock().clone()
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.health_lock().get(symbol).and_then(|h| h.last_price)
    }

    /// Spawn the periodic loop. A stop request lets the current tick finish.
    pub fn start(self: Arc<Self>) -> MonitorHandle {
        let (tx, mut rx) = watch::channel(false);
        let interval_secs = self.cfg.interval_secs;
        let task = tokio::spawn(async move {
            info!("Auto-monitor started (every {}s)", interval_secs);
            let mut interval = tokio::time::interval(self.cfg.interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = interval.tick() => {}
                }
                self.tick().await;
            }
            info!("Auto-monitor stopped");
        });
        MonitorHandle { shutdown: tx, task }
    }
}

pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Auto-monitor task ended abnormally: {}", e);
        }
    }
}
