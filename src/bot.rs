use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use paper_signal_bot::config::Config;
use paper_signal_bot::desk::TradingDesk;
use paper_signal_bot::exchange::{CoinbaseClient, PositionStore};
use paper_signal_bot::strategies::signals::{Signal, SignalOutcome};

const STATUS_INTERVAL: Duration = Duration::from_secs(300);

pub struct PaperSignalBot {
    config: Config,
    desk: TradingDesk,
    last_status: Instant,
}

impl PaperSignalBot {
    pub fn new(config: Config, market: Arc<CoinbaseClient>, store: Arc<dyn PositionStore>) -> Self {
        info!("{}", "=".repeat(60));
        info!("Paper signal bot starting up");
        info!("Symbols: {}", config.symbols.join(", "));
        let tfs: Vec<&str> = config.timeframes.iter().map(|tf| tf.as_str()).collect();
        info!("Timeframes: {}", tfs.join(", "));
        info!(
            "Thresholds: ai >= {:.2}, market >= {:.2}, confluence {} ({})",
            config.signal.min_ai_confidence,
            config.signal.min_market_score,
            config.signal.min_confluence,
            if config.signal.enable_confluence { "on" } else { "off" }
        );
        info!(
            "Cooldown {}s | max {} signals/h per symbol",
            config.signal.cooldown_secs, config.signal.max_signals_per_hour
        );
        info!(
            "Balance ${:.2} | trade ${:.2} | auto-confirm {}",
            config.initial_balance,
            config.default_trade_amount,
            if config.auto_confirm { "ON" } else { "OFF" }
        );
        info!("{}", "=".repeat(60));

        let desk = TradingDesk::new(config.clone(), market.clone(), market, store);

        Self {
            config,
            desk,
            last_status: Instant::now(),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        match self.desk.restore().await {
            Ok(0) => {}
            Ok(n) => info!("Resumed {} persisted positions", n),
            Err(e) => warn!("Could not restore positions: {:#}", e),
        }
        self.desk.start_monitor().await;

        info!("Bot is now running. Press Ctrl+C to stop.");
        self.print_status().await;

        let mut interval = tokio::time::interval(Duration::from_secs(self.config.scan_interval));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    self.shutdown().await;
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            self.scan().await;

            if self.last_status.elapsed() >= STATUS_INTERVAL {
                self.print_status().await;
                self.last_status = Instant::now();
            }
        }
    }

    async fn scan(&self) {
        for symbol in &self.config.symbols {
            for tf in &self.config.timeframes {
                match self.desk.generate_signal(symbol, tf.as_str()).await {
                    Ok(SignalOutcome::Emitted(signal)) => self.on_signal(signal).await,
                    Ok(SignalOutcome::Suppressed(s)) => {
                        debug!("{} {}: suppressed ({}) {}", symbol, tf, s.reason, s.detail);
                    }
                    Err(e) => error!("{} {}: {}", symbol, tf, e),
                }
            }
        }
    }

    async fn on_signal(&self, signal: Signal) {
        info!(
            "SIGNAL {} {} {} @ {:.2} | SL {:.2} TP {:.2} | conf {:.0}%{}",
            signal.signal_type.as_str().to_uppercase(),
            signal.symbol,
            signal.timeframe,
            signal.entry_price,
            signal.stop_loss,
            signal.take_profit,
            signal.confidence * 100.0,
            if signal.derived_from_neutral { " (from neutral)" } else { "" }
        );
        for reason in &signal.reasons {
            debug!("  {}", reason);
        }

        if !self.config.auto_confirm {
            return;
        }
        match self
            .desk
            .confirm_signal(&signal, self.config.default_trade_amount)
            .await
        {
            Ok(id) => info!("Auto-confirmed {} -> position {}", signal.id, id),
            Err(e) => warn!("Auto-confirm of {} failed: {}", signal.id, e),
        }
    }

    async fn print_status(&self) {
        let snap = self.desk.get_portfolio().await;
        let monitor = self.desk.monitor_status().await;

        info!("Balance: ${:.2} (return {:+.2}%)", snap.balance, snap.total_return_pct);
        info!(
            "Trades: {} | Win Rate: {:.1}% | W/L {}/{}",
            snap.total_trades, snap.win_rate, snap.wins, snap.losses
        );
        info!(
            "PnL: ${:+.2} realized, ${:+.2} unrealized",
            snap.total_pnl, snap.unrealized_pnl
        );
        info!(
            "Open: {} | Monitor: {}",
            snap.active_positions,
            if monitor.running { "running" } else { "stopped" }
        );
        for pos in &snap.open_positions {
            info!(
                "  {} {} {} entry {:.2} now {} | SL {:.2} TP {:.2}",
                pos.side.as_str().to_uppercase(),
                pos.symbol,
                pos.timeframe,
                pos.entry_price,
                pos.current_price
                    .map(|p| format!("{:.2}", p))
                    .unwrap_or_else(|| "-".to_string()),
                pos.stop_loss,
                pos.take_profit
            );
        }
        if snap.total_trades > 0 {
            let stats = self.desk.get_detailed_stats().await;
            info!(
                "Avg win ${:.2} / avg loss ${:.2} | best ${:.2} worst ${:.2} | PF {}",
                stats.avg_profit,
                stats.avg_loss,
                stats.largest_profit,
                stats.largest_loss,
                stats
                    .profit_factor
                    .map(|pf| format!("{:.2}", pf))
                    .unwrap_or_else(|| "n/a (no losses)".to_string())
            );
            let mut reasons: Vec<_> = stats.by_exit_reason.values().collect();
            reasons.sort_by(|a, b| a.value.cmp(&b.value));
            for b in reasons {
                info!("  exit {}: {} trades, ${:+.2}", b.value, b.total, b.total_pnl);
            }
            let mut tfs: Vec<_> = stats.by_timeframe.values().collect();
            tfs.sort_by(|a, b| a.value.cmp(&b.value));
            for b in tfs {
                info!(
                    "  tf {}: {} trades, win {:.1}%, ${:+.2}",
                    b.value, b.total, b.win_rate, b.total_pnl
                );
            }
            for b in self.desk.losing_buckets().await {
                warn!(
                    "Negative edge: {}={} ({} trades, edge ${:.2}/trade)",
                    b.dimension, b.value, b.total, b.edge
                );
            }
            for n in self.desk.get_trade_notifications(3).await {
                info!(
                    "  last close {} {} {} {:+.2}% in {}s -> balance ${:.2}",
                    n.symbol, n.exit_reason, if n.is_win() { "WIN" } else { "LOSS" },
                    n.price_change_pct, n.duration_secs, n.new_balance
                );
            }
        }
        if !monitor.degraded_symbols.is_empty() {
            warn!("Degraded price feeds: {}", monitor.degraded_symbols.join(", "));
        }
    }

    async fn shutdown(&self) {
        info!("Shutting down...");
        self.desk.shutdown().await;
        self.print_status().await;
        info!("Bot stopped.");
    }
}
