//! Trade executor.
//!
//! Runs one pattern step against the gateway: read price and balances,
//! size the trade, check safety, submit the swap with its output floor.
//! Transient gateway failures retry the whole step with backoff; every
//! gateway call is bounded by a timeout.

use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::engine::retry::{halt_reason_for, RetryPolicy};
use crate::gateway::{ExchangeGateway, SwapReceipt, SwapRequest};
use crate::strategy::risk::{check_balances, min_amount_out, Balances};
use crate::strategy::{TradeSize, TradeSizer};
use crate::types::{
    Asset, GatewayError, HaltReason, SafetyError, SessionConfig, Side, SizingError,
};

// ---------------------------------------------------------------------------
// Execution result
// ---------------------------------------------------------------------------

/// A confirmed swap and the sizing that produced it.
#[derive(Debug, Clone)]
pub struct Fill {
    pub size: TradeSize,
    pub min_amount_out: Decimal,
    pub receipt: SwapReceipt,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Why a step produced no trade.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionFailure {
    #[error(transparent)]
    Sizing(#[from] SizingError),

    #[error(transparent)]
    Safety(#[from] SafetyError),

    #[error("{error} (after {attempts} attempt(s))")]
    Gateway { error: GatewayError, attempts: u32 },
}

impl ExecutionFailure {
    pub fn halt_reason(&self) -> HaltReason {
        match self {
            ExecutionFailure::Sizing(_) => HaltReason::SizingRejected,
            ExecutionFailure::Safety(_) => HaltReason::InsufficientBalance,
            ExecutionFailure::Gateway { error, .. } => halt_reason_for(error),
        }
    }
}

/// Failure of a single attempt, before retry classification.
enum AttemptError {
    Gateway(GatewayError),
    Rejected(ExecutionFailure),
}

impl From<GatewayError> for AttemptError {
    fn from(err: GatewayError) -> Self {
        AttemptError::Gateway(err)
    }
}

impl From<SizingError> for AttemptError {
    fn from(err: SizingError) -> Self {
        AttemptError::Rejected(err.into())
    }
}

impl From<SafetyError> for AttemptError {
    fn from(err: SafetyError) -> Self {
        AttemptError::Rejected(err.into())
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    gateway: Arc<dyn ExchangeGateway>,
    retry: RetryPolicy,
    call_timeout: Duration,
    gas_reserve: Decimal,
}

impl Executor {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        retry: RetryPolicy,
        call_timeout: Duration,
        gas_reserve: Decimal,
    ) -> Self {
        Self {
            gateway,
            retry,
            call_timeout,
            gas_reserve,
        }
    }

    /// Execute one step of the pattern.
    ///
    /// `position_delta` is the session's base position before this trade.
    pub async fn execute(
        &self,
        side: Side,
        config: &SessionConfig,
        position_delta: Decimal,
    ) -> Result<Fill, ExecutionFailure> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt(side, config, position_delta).await {
                Ok((size, min_out, receipt)) => {
                    info!(
                        side = %side,
                        amount_in = %receipt.amount_in,
                        amount_out = %receipt.amount_out,
                        tx_id = %receipt.tx_id,
                        attempts = attempt,
                        "Swap confirmed"
                    );
                    return Ok(Fill {
                        size,
                        min_amount_out: min_out,
                        receipt,
                        attempts: attempt,
                    });
                }
                Err(AttemptError::Gateway(err)) if self.retry.should_retry(&err, attempt) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        side = %side,
                        attempt,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "Transient gateway failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(AttemptError::Gateway(error)) => {
                    return Err(ExecutionFailure::Gateway {
                        error,
                        attempts: attempt,
                    })
                }
                Err(AttemptError::Rejected(failure)) => return Err(failure),
            }
        }
    }

    async fn attempt(
        &self,
        side: Side,
        config: &SessionConfig,
        position_delta: Decimal,
    ) -> Result<(TradeSize, Decimal, SwapReceipt), AttemptError> {
        let price = self.call(self.gateway.get_spot_price()).await?;
        let spent = self.call(self.gateway.get_balance(side.spent_asset())).await?;
        let native = self.call(self.gateway.get_balance(Asset::Native)).await?;
        debug!(side = %side, price = %price, spent = %spent, native = %native, "Market read");

        let size = TradeSizer::size(config, side, price, position_delta)?;
        check_balances(&size, Balances { spent, native }, self.gas_reserve)?;

        let min_out = min_amount_out(size.expected_out, config.slippage_bps);
        let request = SwapRequest {
            side,
            asset_in: size.asset_in(),
            amount_in: size.amount_in,
            min_amount_out: min_out,
        };
        let receipt = self.call(self.gateway.swap(request)).await?;
        Ok((size, min_out, receipt))
    }

    /// Bound a gateway call by the configured timeout.
    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(format!(
                "no response within {}s",
                self.call_timeout.as_secs_f64()
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
