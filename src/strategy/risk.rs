//! Pre-trade safety checks.
//!
//! Confirms the wallet can cover the trade and the gas to send it, and
//! derives the minimum acceptable output from the slippage tolerance.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::sizing::TradeSize;
use crate::types::{Asset, SafetyError};

/// Basis points in one whole.
const BPS: Decimal = dec!(10000);

/// Wallet balances relevant to one trade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Balances {
    /// Balance of the asset the trade spends.
    pub spent: Decimal,
    /// Gas token balance.
    pub native: Decimal,
}

/// `expected_out × (1 − slippage_bps / 10000)`, saturating at the
/// `Decimal` bounds.
pub fn min_amount_out(expected_out: Decimal, slippage_bps: u32) -> Decimal {
    let keep = (BPS - Decimal::from(slippage_bps)) / BPS;
    expected_out.saturating_mul(keep)
}

/// Reject the trade unless the spent asset covers the input amount and the
/// gas token covers the reserve.
pub fn check_balances(
    size: &TradeSize,
    balances: Balances,
    gas_reserve: Decimal,
) -> Result<(), SafetyError> {
    if balances.spent < size.amount_in {
        return Err(SafetyError::InsufficientBalance {
            asset: size.asset_in(),
            needed: size.amount_in,
            available: balances.spent,
        });
    }
    if balances.native < gas_reserve {
        return Err(SafetyError::InsufficientBalance {
            asset: Asset::Native,
            needed: gas_reserve,
            available: balances.native,
        });
    }
    Ok(())
}
