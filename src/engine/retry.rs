//! Retry policy for transient gateway failures.

use std::time::Duration;

use crate::types::{GatewayError, HaltReason};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero means a single attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base × 2^(retry−1)`,
    /// capped at `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Whether a failure on attempt `attempt` (1-based) should be retried.
    pub fn should_retry(&self, err: &GatewayError, attempt: u32) -> bool {
        err.is_transient() && attempt <= self.max_retries
    }
}

/// Halt reason for a gateway failure that ended an attempt.
pub fn halt_reason_for(err: &GatewayError) -> HaltReason {
    if err.is_transient() {
        HaltReason::TradeFailed
    } else {
        HaltReason::TradeReverted
    }
}
