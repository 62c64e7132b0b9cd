//! Accountant: turns confirmed swaps into trade records and folds them
//! into the session aggregates.

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::gateway::SwapReceipt;
use crate::strategy::PatternScheduler;
use crate::types::{SessionState, Side, TradeRecord};

pub struct Accountant;

impl Accountant {
    /// Build the append-only record for a confirmed swap.
    pub fn record_fill(
        operator: &str,
        side: Side,
        receipt: &SwapReceipt,
        now: DateTime<Utc>,
    ) -> TradeRecord {
        TradeRecord {
            id: Uuid::new_v4(),
            operator_id: operator.to_string(),
            side,
            amount_in: receipt.amount_in,
            amount_out: receipt.amount_out,
            tx_id: receipt.tx_id.clone(),
            timestamp: now,
            gas_used: receipt.gas_used,
            execution_price: TradeRecord::price_of(side, receipt.amount_in, receipt.amount_out),
        }
    }

    /// Apply a persisted trade to the state: aggregates, counter, cycle
    /// position. Clears any error left by an earlier attempt.
    pub fn apply(state: &mut SessionState, record: &TradeRecord, now: DateTime<Utc>) {
        match record.side {
            Side::Buy => {
                state.spent_notional += record.amount_in;
                state.base_position_delta += record.amount_out;
            }
            Side::Sell => {
                state.received_quote += record.amount_out;
                state.base_position_delta -= record.amount_in;
            }
        }
        state.trades_executed += 1;
        state.cycle_position = PatternScheduler::step(state.cycle_position).1;
        state.last_error = None;
        state.updated_at = now;

        info!(
            operator = %record.operator_id,
            side = %record.side,
            trades = state.trades_executed,
            spent = format!("{:.2}", state.spent_notional),
            received = format!("{:.2}", state.received_quote),
            net = format!("{:+.2}", state.net_quote()),
            position = %state.base_position_delta,
            "Trade accounted"
        );
    }

    /// Fold trades recorded for the current session but missing from its
    /// aggregates, as left by a crash between `append_trade` and the state
    /// save. `history` is newest first and must reach back to the session
    /// start. Returns how many records were folded in.
    pub fn reconcile(state: &mut SessionState, history: &[TradeRecord]) -> usize {
        let Some(started_at) = state.started_at else {
            return 0;
        };
        let session: Vec<&TradeRecord> = history
            .iter()
            .take_while(|t| t.timestamp >= started_at)
            .collect();

        let missing = (session.len() as u64).saturating_sub(state.trades_executed) as usize;
        for record in session[..missing].iter().rev() {
            Self::apply(state, record, record.timestamp);
        }

        let expected = PatternScheduler::position_after(state.trades_executed);
        if state.cycle_position != expected {
            warn!(
                cycle = state.cycle_position,
                expected,
                trades = state.trades_executed,
                "Cycle position disagrees with trade count, realigning"
            );
            state.cycle_position = expected;
        }
        missing
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
