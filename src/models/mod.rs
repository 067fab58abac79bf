pub mod candle;
pub mod direction;
pub mod features;
pub mod timeframe;

pub use candle::{Candle, CandleSeries};
pub use direction::*;
pub use features::FeatureVector;
pub use timeframe::Timeframe;
