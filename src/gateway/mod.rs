//! Exchange gateway integrations.
//!
//! Defines the `ExchangeGateway` trait the session engine trades through and
//! provides implementations for:
//! - Paper: an in-process constant-product pool with a simulated wallet
//! - HTTP: a signing relayer that owns the key, nonces and allowances

pub mod http;
pub mod paper;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Asset, GatewayError, Side};

/// A swap with an output floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub side: Side,
    pub asset_in: Asset,
    pub amount_in: Decimal,
    /// The swap must revert rather than return less than this.
    pub min_amount_out: Decimal,
}

impl fmt::Display for SwapRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} (min out {})",
            self.side, self.amount_in, self.asset_in, self.min_amount_out
        )
    }
}

/// Realized result of a confirmed swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapReceipt {
    pub amount_in: Decimal,
    pub amount_out: Decimal,
    pub tx_id: String,
    pub gas_used: u64,
}

/// Abstraction over the DEX and the wallet trading on it.
///
/// Approvals are handled behind this trait; callers only ever see an
/// `InsufficientAllowance` failure if the implementation could not fix it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Wallet balance of `asset`, in whole token units.
    async fn get_balance(&self, asset: Asset) -> Result<Decimal, GatewayError>;

    /// Spot price in quote per base.
    async fn get_spot_price(&self) -> Result<Decimal, GatewayError>;

    /// Submit a swap and wait for confirmation.
    async fn swap(&self, request: SwapRequest) -> Result<SwapReceipt, GatewayError>;
}
