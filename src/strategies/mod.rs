pub mod consensus;
pub mod cooldown;
pub mod ensemble;
pub mod market_scorer;
pub mod signals;

pub use consensus::SignalEngine;
pub use ensemble::{EnsemblePredictor, VoteModel};
pub use market_scorer::MarketScorer;
pub use signals::{Signal, SignalOutcome, SuppressedReason};
