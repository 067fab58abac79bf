pub mod monitor;
pub mod position_manager;
pub mod trade_analyzer;

pub use monitor::{evaluate_exit, AutoMonitor, MonitorHandle, SymbolHealth};
pub use position_manager::{CloseOutcome, PortfolioSnapshot, Position, PositionManager, TradeNotification};
pub use trade_analyzer::{BucketStats, DetailedStats, TradeAnalyzer};
