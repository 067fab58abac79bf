use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{TradeError, ValidationError};
use crate::exchange::PositionStore;
use crate::models::{ExitReason, PositionStatus, Side, Timeframe};
use crate::strategies::signals::Signal;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub timeframe: Timeframe,
    #[serde(default)]
    pub signal_id: String,
    #[serde(default)]
    pub confidence: f64,
    pub entry_price: f64,
    pub quantity: f64,
    pub amount: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    #[serde(default)]
    pub current_price: Option<f64>,
    #[serde(default)]
    pub unrealized_pnl: Option<f64>,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
    #[serde(default)]
    pub pnl_percent: Option<f64>,
}

impl Position {
    /// P&L if the position were valued at `price`.
    pub fn pnl_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.quantity * self.side.sign()
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

/// Result of a close request. A second close is a no-op, not an error.
#[derive(Debug, Clone)]
pub enum CloseOutcome {
    Closed(Position),
    AlreadyClosed(Position),
}

impl CloseOutcome {
    pub fn position(&self) -> &Position {
        match self {
            CloseOutcome::Closed(p) | CloseOutcome::AlreadyClosed(p) => p,
        }
    }

    pub fn is_already_closed(&self) -> bool {
        matches!(self, CloseOutcome::AlreadyClosed(_))
    }
}

const MAX_NOTIFICATIONS: usize = 100;

/// What a close looked like, kept for the most recent closes only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeNotification {
    pub position_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub timeframe: Timeframe,
    pub exit_reason: ExitReason,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub pnl_percent: f64,
    /// Raw move of the exit against the entry, ignoring side.
    pub price_change_pct: f64,
    pub duration_secs: i64,
    pub new_balance: f64,
    pub closed_at: DateTime<Utc>,
}

impl TradeNotification {
    fn from_closed(closed: &Position, new_balance: f64) -> Self {
        let exit_price = closed.exit_price.unwrap_or(closed.entry_price);
        let closed_at = closed.closed_at.unwrap_or_else(Utc::now);
        Self {
            position_id: closed.id,
            symbol: closed.symbol.clone(),
            side: closed.side,
            timeframe: closed.timeframe,
            exit_reason: closed.exit_reason.unwrap_or(ExitReason::Manual),
            entry_price: closed.entry_price,
            exit_price,
            realized_pnl: closed.realized_pnl.unwrap_or(0.0),
            pnl_percent: closed.pnl_percent.unwrap_or(0.0),
            price_change_pct: (exit_price - closed.entry_price) / closed.entry_price * 100.0,
            duration_secs: (closed_at - closed.opened_at).num_seconds(),
            new_balance,
            closed_at,
        }
    }

    pub fn is_win(&self) -> bool {
        self.realized_pnl > 0.0
    }
}

#[derive(Debug, Clone)]
struct Portfolio {
    balance: f64,
    initial_balance: f64,
    open_position_ids: HashSet<Uuid>,
    total_trades: usize,
    wins: usize,
    total_pnl: f64,
    history: Vec<Position>,
    notifications: VecDeque<TradeNotification>,
}

impl Portfolio {
    fn notify(&mut self, notification: TradeNotification) {
        if self.notifications.len() == MAX_NOTIFICATIONS {
            self.notifications.pop_front();
        }
        self.notifications.push_back(notification);
    }

    fn record_close(&mut self, closed: &Position, pnl: f64) {
        self.open_position_ids.remove(&closed.id);
        self.total_trades += 1;
        if pnl > 0.0 {
            self.wins += 1;
        }
        self.total_pnl += pnl;
        self.balance += pnl;
        self.history.push(closed.clone());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub balance: f64,
    pub initial_balance: f64,
    pub active_positions: usize,
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub total_pnl: f64,
    pub unrealized_pnl: f64,
    pub win_rate: f64,
    pub total_return_pct: f64,
    pub open_positions: Vec<Position>,
}

/// Owns every simulated position and the portfolio aggregates.
///
/// Each position sits behind its own mutex; the aggregates sit behind one
/// more. Locks are always taken position first, then portfolio.
pub struct PositionManager {
    positions: RwLock<HashMap<Uuid, Arc<Mutex<Position>>>>,
    portfolio: Mutex<Portfolio>,
    store: Arc<dyn PositionStore>,
    max_open_positions: usize,
}

impl PositionManager {
    pub fn new(initial_balance: f64, max_open_positions: usize, store: Arc<dyn PositionStore>) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            portfolio: Mutex::new(Portfolio {
                balance: initial_balance,
                initial_balance,
                open_position_ids: HashSet::new(),
                total_trades: 0,
                wins: 0,
                total_pnl: 0.0,
                history: Vec::new(),
                notifications: VecDeque::new(),
            }),
            store,
            max_open_positions,
        }
    }

    /// Rebuild state from the store. Returns the number of positions loaded.
    ///
    /// Only valid on an empty manager; restoring over live state would count
    /// the stored closes twice.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let mut loaded = self.store.load_positions().await?;
        loaded.sort_by_key(|p| p.opened_at);

        let mut positions = self.positions.write().await;
        if !positions.is_empty() {
            anyhow::bail!("positions already loaded; restore only runs on an empty manager");
        }
        let mut portfolio = self.portfolio.lock().await;
        for pos in &loaded {
            if pos.is_open() {
                portfolio.open_position_ids.insert(pos.id);
            } else {
                let pnl = pos.realized_pnl.unwrap_or(0.0);
                portfolio.record_close(pos, pnl);
            }
            positions.insert(pos.id, Arc::new(Mutex::new(pos.clone())));
        }
        info!(
            "Restored {} positions ({} open, {} closed)",
            loaded.len(),
            portfolio.open_position_ids.len(),
            portfolio.history.len()
        );
        Ok(loaded.len())
    }

    pub async fn open(&self, signal: &Signal, amount: f64) -> Result<Uuid, TradeError> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(ValidationError::NonPositiveAmount(amount).into());
        }
        if !(signal.entry_price.is_finite() && signal.entry_price > 0.0) {
            return Err(ValidationError::NonPositiveEntryPrice(signal.entry_price).into());
        }

        let position = Position {
            id: Uuid::new_v4(),
            symbol: signal.symbol.clone(),
            side: signal.signal_type,
            timeframe: signal.timeframe,
            signal_id: signal.id.clone(),
            confidence: signal.confidence,
            entry_price: signal.entry_price,
            quantity: amount / signal.entry_price,
            amount,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            opened_at: Utc::now(),
            status: PositionStatus::Open,
            current_price: None,
            unrealized_pnl: None,
            exit_price: None,
            exit_reason: None,
            closed_at: None,
            realized_pnl: None,
            pnl_percent: None,
        };

        let id = position.id;
        {
            // both locks held, so the open set and the map change together
            let mut positions = self.positions.write().await;
            let mut portfolio = self.portfolio.lock().await;
            if self.max_open_positions > 0
                && portfolio.open_position_ids.len() >= self.max_open_positions
            {
                return Err(TradeError::TooManyOpen(self.max_open_positions));
            }
            portfolio.open_position_ids.insert(id);
            positions.insert(id, Arc::new(Mutex::new(position.clone())));
        }

        info!(
            "OPENED {} {} {} | entry {:.2} qty {:.8} | SL {:.2} TP {:.2} | id {}",
            position.side.as_str().to_uppercase(),
            position.symbol,
            position.timeframe,
            position.entry_price,
            position.quantity,
            position.stop_loss,
            position.take_profit,
            id
        );
        self.persist(&position).await;
        Ok(id)
    }

    /// Re-price an open position. Returns the new unrealized P&L.
    pub async fn update_price(&self, id: Uuid, current_price: f64) -> Result<f64, TradeError> {
        if !(current_price.is_finite() && current_price > 0.0) {
            return Err(ValidationError::NonPositivePrice(current_price).into());
        }
        let handle = self.handle(id).await.ok_or(TradeError::NotFound(id))?;
        let mut pos = handle.lock().await;
        if !pos.is_open() {
            return Err(TradeError::NotOpen(id));
        }
        let pnl = pos.pnl_at(current_price);
        pos.current_price = Some(current_price);
        pos.unrealized_pnl = Some(pnl);
        debug!("{} {} @ {:.2} unrealized {:.2}", pos.symbol, id, current_price, pnl);
        Ok(pnl)
    }

    /// Close a position. Closing an already-closed position changes nothing.
    pub async fn close(
        &self,
        id: Uuid,
        exit_price: f64,
        reason: ExitReason,
    ) -> Result<CloseOutcome, TradeError> {
        if !(exit_price.is_finite() && exit_price > 0.0) {
            return Err(ValidationError::NonPositivePrice(exit_price).into());
        }
        let handle = self.handle(id).await.ok_or(TradeError::NotFound(id))?;

        let closed = {
            let mut pos = handle.lock().await;
            if !pos.is_open() {
                info!(
                    "Close of {} ignored ({}): already closed by {}",
                    id,
                    reason,
                    pos.exit_reason.map(|r| r.to_string()).unwrap_or_default()
                );
                return Ok(CloseOutcome::AlreadyClosed(pos.clone()));
            }

            let pnl = pos.pnl_at(exit_price);
            let now = Utc::now();
            pos.status = PositionStatus::Closed;
            pos.current_price = Some(exit_price);
            pos.unrealized_pnl = None;
            pos.exit_price = Some(exit_price);
            pos.exit_reason = Some(reason);
            pos.closed_at = Some(now);
            pos.realized_pnl = Some(pnl);
            pos.pnl_percent = Some(if pos.amount > 0.0 {
                pnl / pos.amount * 100.0
            } else {
                0.0
            });

            let closed = pos.clone();
            let mut portfolio = self.portfolio.lock().await;
            portfolio.record_close(&closed, pnl);
            let balance = portfolio.balance;
            portfolio.notify(TradeNotification::from_closed(&closed, balance));
            closed
        };

        info!(
            "CLOSED {} {} ({}) | entry {:.2} exit {:.2} | PnL ${:.2} ({:+.2}%)",
            closed.side.as_str().to_uppercase(),
            closed.symbol,
            reason,
            closed.entry_price,
            exit_price,
            closed.realized_pnl.unwrap_or(0.0),
            closed.pnl_percent.unwrap_or(0.0)
        );
        self.persist(&closed).await;
        Ok(CloseOutcome::Closed(closed))
    }

    pub async fn get_portfolio(&self) -> PortfolioSnapshot {
        let (balance, initial_balance, ids, total_trades, wins, total_pnl) = {
            let p = self.portfolio.lock().await;
            (
                p.balance,
                p.initial_balance,
                p.open_position_ids.iter().copied().collect::<Vec<_>>(),
                p.total_trades,
                p.wins,
                p.total_pnl,
            )
        };

        let open_positions = self.collect_open(&ids).await;
        let unrealized_pnl = open_positions
            .iter()
            .filter_map(|p| p.unrealized_pnl)
            .sum();
        let win_rate = if total_trades > 0 {
            wins as f64 / total_trades as f64 * 100.0
        } else {
            0.0
        };

        PortfolioSnapshot {
            balance,
            initial_balance,
            active_positions: open_positions.len(),
            total_trades,
            wins,
            losses: total_trades - wins,
            total_pnl,
            unrealized_pnl,
            win_rate,
            total_return_pct: if initial_balance > 0.0 {
                (balance - initial_balance) / initial_balance * 100.0
            } else {
                0.0
            },
            open_positions,
        }
    }

    /// Closed positions, oldest close first.
    pub async fn history(&self) -> Vec<Position> {
        self.portfolio.lock().await.history.clone()
    }

    /// The most recent close notifications, oldest first.
    pub async fn notifications(&self, limit: usize) -> Vec<TradeNotification> {
        let portfolio = self.portfolio.lock().await;
        let skip = portfolio.notifications.len().saturating_sub(limit);
        portfolio.notifications.iter().skip(skip).cloned().collect()
    }

    pub async fn open_positions(&self) -> Vec<Position> {
        let ids = self.open_ids().await;
        self.collect_open(&ids).await
    }

    pub async fn open_ids(&self) -> Vec<Uuid> {
        self.portfolio
            .lock()
            .await
            .open_position_ids
            .iter()
            .copied()
            .collect()
    }

    pub async fn get(&self, id: Uuid) -> Option<Position> {
        let handle = self.handle(id).await?;
        let pos = handle.lock().await;
        Some(pos.clone())
    }

    async fn handle(&self, id: Uuid) -> Option<Arc<Mutex<Position>>> {
        self.positions.read().await.get(&id).cloned()
    }

    async fn collect_open(&self, ids: &[Uuid]) -> Vec<Position> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(handle) = self.handle(*id).await {
                let pos = handle.lock().await;
                if pos.is_open() {
                    out.push(pos.clone());
                }
            }
        }
        out.sort_by_key(|p| p.opened_at);
        out
    }

    async fn persist(&self, position: &Position) {
        if let Err(e) = self.store.save_position(position).await {
            warn!("Failed to persist position {}: {:#}", position.id, e);
        }
    }
}
