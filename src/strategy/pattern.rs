//! The fixed two-buys-two-sells cadence.

use crate::types::Side;

/// Length of one full cadence.
pub const CYCLE_LEN: u8 = 4;

/// BUY → BUY → SELL → SELL, repeating.
pub const PATTERN: [Side; CYCLE_LEN as usize] = [Side::Buy, Side::Buy, Side::Sell, Side::Sell];

pub struct PatternScheduler;

impl PatternScheduler {
    /// Side to trade at `position` and the position that follows it.
    /// Positions outside `[0, 4)` are reduced modulo the cycle length.
    pub fn step(position: u8) -> (Side, u8) {
        let position = position % CYCLE_LEN;
        (PATTERN[position as usize], (position + 1) % CYCLE_LEN)
    }

    pub fn side_at(position: u8) -> Side {
        Self::step(position).0
    }

    /// Cycle position implied by a count of completed trades.
    pub fn position_after(completed_trades: u64) -> u8 {
        (completed_trades % CYCLE_LEN as u64) as u8
    }
}
