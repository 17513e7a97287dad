pub mod candle;
pub mod direction;
pub mod quote;
pub mod timeframe;

pub use candle::{Candle, CandleSeries};
pub use direction::*;
pub use quote::{AccountInfo, Quote, SymbolSpec};
pub use timeframe::Timeframe;
