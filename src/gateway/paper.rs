//! Paper-trading gateway.
//!
//! Simulates a Uniswap-V2-style constant-product pool and a wallet holding
//! base, quote and gas balances. Swaps move the pool price, charge the LP fee
//! and a fixed gas cost, and revert when the output floor is not met. Sessions run end to end
//! without touching a chain.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Mutex;
use tracing::{debug, info};

use super::{ExchangeGateway, SwapReceipt, SwapRequest};
use crate::types::{Asset, GatewayError};

/// Starting pool and wallet for a paper gateway.
#[derive(Debug, Clone)]
pub struct PaperBook {
    pub base_reserve: Decimal,
    pub quote_reserve: Decimal,
    pub base_balance: Decimal,
    pub quote_balance: Decimal,
    pub native_balance: Decimal,
    /// LP fee in basis points (30 = 0.3%).
    pub fee_bps: u32,
    pub gas_per_swap: u64,
    /// Native units charged per gas unit.
    pub gas_price: Decimal,
}

impl Default for PaperBook {
    fn default() -> Self {
        Self {
            base_reserve: dec!(500000),
            quote_reserve: dec!(1000000),
            base_balance: dec!(5000),
            quote_balance: dec!(10000),
            native_balance: dec!(1),
            fee_bps: 30,
            gas_per_swap: 150_000,
            gas_price: dec!(0.00000001),
        }
    }
}

pub struct PaperGateway {
    book: Mutex<PaperBook>,
}

impl PaperGateway {
    pub fn new(book: PaperBook) -> Self {
        info!(
            base_reserve = %book.base_reserve,
            quote_reserve = %book.quote_reserve,
            "Paper gateway ready"
        );
        Self {
            book: Mutex::new(book),
        }
    }

    /// Snapshot of the current pool and wallet.
    pub fn book(&self) -> Result<PaperBook, GatewayError> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PaperBook>, GatewayError> {
        self.book
            .lock()
            .map_err(|_| GatewayError::Unavailable("paper book lock poisoned".into()))
    }

    /// Constant-product output for `amount_in` against the given reserves.
    fn amount_out(amount_in: Decimal, reserve_in: Decimal, reserve_out: Decimal, fee_bps: u32) -> Decimal {
        let bps = dec!(10000);
        let in_after_fee = amount_in * (bps - Decimal::from(fee_bps)) / bps;
        reserve_out * in_after_fee / (reserve_in + in_after_fee)
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    async fn get_balance(&self, asset: Asset) -> Result<Decimal, GatewayError> {
        let book = self.lock()?;
        Ok(match asset {
            Asset::Base => book.base_balance,
            Asset::Quote => book.quote_balance,
            Asset::Native => book.native_balance,
        })
    }

    async fn get_spot_price(&self) -> Result<Decimal, GatewayError> {
        let book = self.lock()?;
        if book.base_reserve.is_zero() {
            return Err(GatewayError::Unavailable("pool has no base liquidity".into()));
        }
        Ok(book.quote_reserve / book.base_reserve)
    }

    async fn swap(&self, request: SwapRequest) -> Result<SwapReceipt, GatewayError> {
        let mut book = self.lock()?;

        let gas_cost = book.gas_price * Decimal::from(book.gas_per_swap);
        if book.native_balance < gas_cost {
            return Err(GatewayError::Reverted("insufficient funds for gas".into()));
        }

        let (wallet_in, reserve_in, reserve_out) = match request.asset_in {
            Asset::Quote => (book.quote_balance, book.quote_reserve, book.base_reserve),
            Asset::Base => (book.base_balance, book.base_reserve, book.quote_reserve),
            Asset::Native => {
                return Err(GatewayError::Reverted("native asset is not tradeable".into()))
            }
        };

        if wallet_in < request.amount_in {
            return Err(GatewayError::Reverted(
                "transfer amount exceeds balance".into(),
            ));
        }

        let amount_out = Self::amount_out(request.amount_in, reserve_in, reserve_out, book.fee_bps);
        if amount_out < request.min_amount_out {
            return Err(GatewayError::Reverted(format!(
                "INSUFFICIENT_OUTPUT_AMOUNT: {amount_out} < {}",
                request.min_amount_out
            )));
        }

        match request.asset_in {
            Asset::Quote => {
                book.quote_reserve += request.amount_in;
                book.base_reserve -= amount_out;
                book.quote_balance -= request.amount_in;
                book.base_balance += amount_out;
            }
            _ => {
                book.base_reserve += request.amount_in;
                book.quote_reserve -= amount_out;
                book.base_balance -= request.amount_in;
                book.quote_balance += amount_out;
            }
        }
        book.native_balance -= gas_cost;

        let receipt = SwapReceipt {
            amount_in: request.amount_in,
            amount_out,
            tx_id: format!("0x{}", uuid::Uuid::new_v4().simple()),
            gas_used: book.gas_per_swap,
        };

        debug!(
            request = %request,
            amount_out = %amount_out,
            tx_id = %receipt.tx_id,
            "[PAPER] Swap filled"
        );

        Ok(receipt)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
