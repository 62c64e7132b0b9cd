//! Shared types for the CADENCE session engine.
//!
//! These types form the data model used across all modules: the per-operator
//! session configuration, the persisted runtime state, the append-only trade
//! record, and the error taxonomy the engine classifies failures into.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Operator identity. Opaque to the core; the control surface decides
/// what it maps to (chat user id, API principal, ...).
pub type OperatorId = String;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Trade direction relative to the base asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Asset handed to the exchange for this side.
    pub fn spent_asset(&self) -> Asset {
        match self {
            Side::Buy => Asset::Quote,
            Side::Sell => Asset::Base,
        }
    }

    /// Asset received from the exchange for this side.
    pub fn received_asset(&self) -> Asset {
        self.opposite().spent_asset()
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            _ => Err(anyhow::anyhow!("Unknown trade side: {s}")),
        }
    }
}

/// Assets the gateway can report balances for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Asset {
    /// The traded token.
    Base,
    /// The pricing token (liquidity and notional are denominated in it).
    Quote,
    /// The chain's gas token.
    Native,
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Base => write!(f, "base"),
            Asset::Quote => write!(f, "quote"),
            Asset::Native => write!(f, "native"),
        }
    }
}

/// Why a session stopped running. Persisted alongside the final aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HaltReason {
    SizingRejected,
    InsufficientBalance,
    TradeFailed,
    TradeReverted,
    PersistenceFailed,
    MaxTradesReached,
    StoppedByOperator,
}

impl HaltReason {
    pub const ALL: &'static [HaltReason] = &[
        HaltReason::SizingRejected,
        HaltReason::InsufficientBalance,
        HaltReason::TradeFailed,
        HaltReason::TradeReverted,
        HaltReason::PersistenceFailed,
        HaltReason::MaxTradesReached,
        HaltReason::StoppedByOperator,
    ];

    /// Stable reason code, as stored and reported.
    pub fn code(&self) -> &'static str {
        match self {
            HaltReason::SizingRejected => "sizing-rejected",
            HaltReason::InsufficientBalance => "insufficient-balance",
            HaltReason::TradeFailed => "trade-failed",
            HaltReason::TradeReverted => "trade-reverted",
            HaltReason::PersistenceFailed => "persistence-failed",
            HaltReason::MaxTradesReached => "max-trades-reached",
            HaltReason::StoppedByOperator => "stopped-by-operator",
        }
    }

    /// Whether the halt was caused by a failure rather than a normal end.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            HaltReason::MaxTradesReached | HaltReason::StoppedByOperator
        )
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl std::str::FromStr for HaltReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HaltReason::ALL
            .iter()
            .copied()
            .find(|r| r.code() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown halt reason: {s}"))
    }
}

/// Lifecycle phase of an operator's session as seen by the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionPhase {
    Idle,
    Running,
    Stopping,
    Halted,
}

impl SessionPhase {
    /// Running or stopping: a loop exists for this operator.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionPhase::Running | SessionPhase::Stopping)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Idle => write!(f, "IDLE"),
            SessionPhase::Running => write!(f, "RUNNING"),
            SessionPhase::Stopping => write!(f, "STOPPING"),
            SessionPhase::Halted => write!(f, "HALTED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Session configuration
// ---------------------------------------------------------------------------

fn default_slippage_bps() -> u32 {
    50
}

fn default_min_notional() -> Decimal {
    dec!(10)
}

fn default_max_trades() -> u64 {
    1000
}

/// Per-operator trading parameters. Immutable while a session runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Total liquidity committed to the session, in quote units.
    pub total_liquidity: Decimal,
    /// Percent of `total_liquidity` traded per step (2 = 2%).
    pub trade_pct: Decimal,
    /// Seconds between trade attempts.
    pub interval_secs: u64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u32,
    /// Smallest quote notional a single trade may have.
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
    /// Bound on |base position delta| after any trade.
    #[serde(default)]
    pub max_position: Option<Decimal>,
    /// Completed trades after which the session halts.
    #[serde(default = "default_max_trades")]
    pub max_trades: u64,
}

impl fmt::Display for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "liquidity={} pct={}% amount={} interval={}s slippage={}bps min={} max_trades={}",
            self.total_liquidity,
            self.trade_pct,
            self.trade_notional(),
            self.interval_secs,
            self.slippage_bps,
            self.min_notional,
            self.max_trades,
        )
    }
}

impl SessionConfig {
    /// Build a config with default slippage, minimum notional and trade cap.
    pub fn new(total_liquidity: Decimal, trade_pct: Decimal, interval_secs: u64) -> Self {
        Self {
            total_liquidity,
            trade_pct,
            interval_secs,
            slippage_bps: default_slippage_bps(),
            min_notional: default_min_notional(),
            max_position: None,
            max_trades: default_max_trades(),
        }
    }

    /// Check every bound. A session never starts with an invalid config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.total_liquidity <= Decimal::ZERO {
            return Err(ConfigError::NonPositiveLiquidity(self.total_liquidity));
        }
        if self.trade_pct <= Decimal::ZERO || self.trade_pct > dec!(100) {
            return Err(ConfigError::TradePctOutOfRange(self.trade_pct));
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::IntervalTooShort(self.interval_secs));
        }
        if self.slippage_bps == 0 || self.slippage_bps > 10_000 {
            return Err(ConfigError::SlippageOutOfRange(self.slippage_bps));
        }
        if self.min_notional < Decimal::ZERO {
            return Err(ConfigError::NegativeMinNotional(self.min_notional));
        }
        if let Some(limit) = self.max_position {
            if limit <= Decimal::ZERO {
                return Err(ConfigError::NonPositiveMaxPosition(limit));
            }
        }
        if self.max_trades == 0 {
            return Err(ConfigError::ZeroMaxTrades);
        }
        Ok(())
    }

    /// Quote notional of a single trade: `total_liquidity × trade_pct / 100`.
    pub fn trade_notional(&self) -> Decimal {
        self.total_liquidity.saturating_mul(self.trade_pct / dec!(100))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Persisted runtime state of an operator's session.
///
/// This is the resume point after any restart: the cycle position and the
/// aggregates here are the only source of truth the engine trusts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub active: bool,
    pub trades_executed: u64,
    /// Quote spent on BUY trades.
    pub spent_notional: Decimal,
    /// Quote received from SELL trades.
    pub received_quote: Decimal,
    /// Base acquired minus base disposed.
    pub base_position_delta: Decimal,
    /// Index into the BUY/BUY/SELL/SELL cycle, always in `[0, 4)`.
    pub cycle_position: u8,
    pub halt_reason: Option<HaltReason>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "active={} trades={} spent={} received={} net={:+} position={:+} cycle={}",
            self.active,
            self.trades_executed,
            self.spent_notional,
            self.received_quote,
            self.net_quote(),
            self.base_position_delta,
            self.cycle_position,
        )?;
        if let Some(reason) = self.halt_reason {
            write!(f, " halted={reason}")?;
        }
        Ok(())
    }
}

impl SessionState {
    /// Fresh, inactive state with zero aggregates.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            active: false,
            trades_executed: 0,
            spent_notional: Decimal::ZERO,
            received_quote: Decimal::ZERO,
            base_position_delta: Decimal::ZERO,
            cycle_position: 0,
            halt_reason: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
        }
    }

    /// Reset the aggregates and mark the state active for a new session.
    pub fn begin_session(&mut self, now: DateTime<Utc>) {
        self.active = true;
        self.trades_executed = 0;
        self.spent_notional = Decimal::ZERO;
        self.received_quote = Decimal::ZERO;
        self.base_position_delta = Decimal::ZERO;
        self.cycle_position = 0;
        self.halt_reason = None;
        self.last_error = None;
        self.started_at = Some(now);
        self.stopped_at = None;
        self.updated_at = now;
    }

    /// Deactivate with a reason. Aggregates are kept for reporting.
    pub fn halt(&mut self, reason: HaltReason, detail: Option<String>, now: DateTime<Utc>) {
        self.active = false;
        self.halt_reason = Some(reason);
        self.last_error = detail;
        self.stopped_at = Some(now);
        self.updated_at = now;
    }

    /// Net quote P/L: received minus spent.
    pub fn net_quote(&self) -> Decimal {
        self.received_quote - self.spent_notional
    }

    pub fn aggregates(&self) -> Aggregates {
        Aggregates {
            trades_executed: self.trades_executed,
            spent_notional: self.spent_notional,
            received_quote: self.received_quote,
            net_quote: self.net_quote(),
            base_position_delta: self.base_position_delta,
            cycle_position: self.cycle_position,
        }
    }
}

/// Running totals reported to the control surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregates {
    pub trades_executed: u64,
    pub spent_notional: Decimal,
    pub received_quote: Decimal,
    pub net_quote: Decimal,
    pub base_position_delta: Decimal,
    pub cycle_position: u8,
}

impl fmt::Display for Aggregates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trades={} spent={:.2} received={:.2} net={:+.2} base_delta={:+.6}",
            self.trades_executed,
            self.spent_notional,
            self.received_quote,
            self.net_quote,
            self.base_position_delta,
        )
    }
}

// ---------------------------------------------------------------------------
// Trade record
// ---------------------------------------------------------------------------

/// One executed trade. Append-only; never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub operator_id: OperatorId,
    pub side: Side,
    pub amount_in: Decimal,
    pub amount_out: Decimal,
    pub tx_id: String,
    pub timestamp: DateTime<Utc>,
    pub gas_used: u64,
    /// Realized price in quote per base.
    pub execution_price: Decimal,
}

impl fmt::Display for TradeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tx: String = self.tx_id.chars().take(12).collect();
        write!(
            f,
            "{} in={:.6} out={:.6} @ {:.6} gas={} tx={tx}… at {}",
            self.side,
            self.amount_in,
            self.amount_out,
            self.execution_price,
            self.gas_used,
            self.timestamp.to_rfc3339(),
        )
    }
}

impl TradeRecord {
    /// Realized quote-per-base price of a fill. Zero if either leg is zero.
    pub fn price_of(side: Side, amount_in: Decimal, amount_out: Decimal) -> Decimal {
        let (quote, base) = match side {
            Side::Buy => (amount_in, amount_out),
            Side::Sell => (amount_out, amount_in),
        };
        if base.is_zero() {
            Decimal::ZERO
        } else {
            quote / base
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Invalid or missing session configuration. Raised before any trade.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("No configuration found for operator {0}")]
    Missing(OperatorId),

    #[error("Total liquidity must be positive, got {0}")]
    NonPositiveLiquidity(Decimal),

    #[error("Trade percentage must be in (0, 100], got {0}")]
    TradePctOutOfRange(Decimal),

    #[error("Interval must be at least 1 second, got {0}")]
    IntervalTooShort(u64),

    #[error("Slippage must be in (0, 10000] bps, got {0}")]
    SlippageOutOfRange(u32),

    #[error("Minimum notional must be non-negative, got {0}")]
    NegativeMinNotional(Decimal),

    #[error("Maximum position must be positive when set, got {0}")]
    NonPositiveMaxPosition(Decimal),

    #[error("Maximum trade count must be at least 1")]
    ZeroMaxTrades,
}

/// The computed trade violates a notional or inventory bound.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SizingError {
    #[error("Trade notional {notional} is below the minimum {minimum}")]
    BelowMinimum { notional: Decimal, minimum: Decimal },

    #[error("Post-trade base position {projected} would exceed the limit {limit}")]
    PositionLimit { projected: Decimal, limit: Decimal },

    #[error("Spot price must be positive, got {0}")]
    InvalidPrice(Decimal),

    #[error("Trade size is out of range at spot price {0}")]
    Overflow(Decimal),
}

/// Pre-trade balance check failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SafetyError {
    #[error("Insufficient {asset} balance: need {needed}, have {available}")]
    InsufficientBalance {
        asset: Asset,
        needed: Decimal,
        available: Decimal,
    },
}

/// Classified failure from the exchange gateway.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway timeout: {0}")]
    Timeout(String),

    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    #[error("Transaction reverted: {0}")]
    Reverted(String),

    #[error("Insufficient allowance: {0}")]
    InsufficientAllowance(String),
}

impl GatewayError {
    /// Transient failures are retried with backoff; the rest halt at once.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Timeout(_) | GatewayError::Unavailable(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Timeout(_) => "timeout",
            GatewayError::Unavailable(_) => "unavailable",
            GatewayError::Reverted(_) => "reverted",
            GatewayError::InsufficientAllowance(_) => "insufficient-allowance",
        }
    }
}

/// Durable store failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Corrupt stored record ({table}): {message}")]
    Corrupt { table: &'static str, message: String },
}

/// Errors surfaced by the control-surface operations of the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("A session is already active for operator {0}")]
    AlreadyActive(OperatorId),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Operator {0} is not authorized")]
    Unauthorized(OperatorId),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
