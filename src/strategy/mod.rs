//! Strategy: the cadence, trade sizing, and pre-trade safety checks.
//!
//! Everything here is pure: no I/O, no clock. The engine feeds in the
//! persisted cycle position and live market data and gets back the side,
//! the amount, and the output floor for the next swap.

pub mod pattern;
pub mod risk;
pub mod sizing;

pub use pattern::PatternScheduler;
pub use sizing::{TradeSize, TradeSizer};
