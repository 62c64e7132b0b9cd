//! Trade sizing.
//!
//! Turns a session config, the side for this step, and the current spot price
//! into a concrete input amount. BUYs spend a fixed quote notional; SELLs
//! dispose of the base quantity worth that same notional at spot. Sizes that
//! fall below the configured minimum or push the session's inventory past its
//! position limit are rejected before anything reaches the exchange.

use rust_decimal::Decimal;
use tracing::debug;

use crate::types::{Asset, SessionConfig, Side, SizingError};

/// A trade ready for the safety checks.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeSize {
    pub side: Side,
    /// Quote-equivalent value of the trade.
    pub notional: Decimal,
    /// Amount handed to the exchange, in `side.spent_asset()` units.
    pub amount_in: Decimal,
    /// Output expected at the quoted spot price, before slippage.
    pub expected_out: Decimal,
    /// Base quantity the trade moves (acquired on BUY, disposed on SELL).
    pub base_amount: Decimal,
    /// Base position delta after the trade, at spot.
    pub projected_position: Decimal,
}

impl TradeSize {
    pub fn asset_in(&self) -> Asset {
        self.side.spent_asset()
    }
}

pub struct TradeSizer;

impl TradeSizer {
    /// Size the next trade.
    ///
    /// `price` is quote per base; `position_delta` is the session's current
    /// base position delta.
    pub fn size(
        config: &SessionConfig,
        side: Side,
        price: Decimal,
        position_delta: Decimal,
    ) -> Result<TradeSize, SizingError> {
        if price <= Decimal::ZERO {
            return Err(SizingError::InvalidPrice(price));
        }

        let notional = config.trade_notional();
        if notional < config.min_notional {
            return Err(SizingError::BelowMinimum {
                notional,
                minimum: config.min_notional,
            });
        }

        let overflow = || SizingError::Overflow(price);
        let base_amount = notional.checked_div(price).ok_or_else(overflow)?;
        let (amount_in, expected_out, projected_position) = match side {
            Side::Buy => (
                notional,
                base_amount,
                position_delta.checked_add(base_amount).ok_or_else(overflow)?,
            ),
            Side::Sell => (
                base_amount,
                notional,
                position_delta.checked_sub(base_amount).ok_or_else(overflow)?,
            ),
        };

        if let Some(limit) = config.max_position {
            if projected_position.abs() > limit {
                return Err(SizingError::PositionLimit {
                    projected: projected_position,
                    limit,
                });
            }
        }

        debug!(
            side = %side,
            notional = %notional,
            amount_in = %amount_in,
            expected_out = %expected_out,
            "Trade sized"
        );

        Ok(TradeSize {
            side,
            notional,
            amount_in,
            expected_out,
            base_amount,
            projected_position,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
