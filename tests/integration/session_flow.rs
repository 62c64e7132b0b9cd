//! End-to-end session behaviour: cadence, sizing, failure handling,
//! accounting, single-session enforcement and crash recovery.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use cadence::engine::notify::Notification;
use cadence::engine::retry::RetryPolicy;
use cadence::engine::{EngineSettings, SessionEngine};
use cadence::storage::{MemoryStore, SqliteStore, StateStore};
use cadence::types::*;

use crate::mock_gateway::{FlakyStore, ScriptedGateway};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn settings() -> EngineSettings {
    EngineSettings {
        retry: RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        },
        gateway_timeout: Duration::from_secs(5),
        gas_reserve: dec!(0.01),
        notification_buffer: 64,
    }
}

fn gateway() -> ScriptedGateway {
    ScriptedGateway::new(dec!(2), dec!(10000), dec!(100000))
}

fn session(max_trades: u64) -> SessionConfig {
    SessionConfig {
        max_trades,
        ..SessionConfig::new(dec!(10000), dec!(2), 60)
    }
}

async fn engine_for(
    store: Arc<dyn StateStore>,
    gw: &ScriptedGateway,
    operator: &str,
    config: SessionConfig,
) -> SessionEngine {
    store.save_config(operator, &config).await.unwrap();
    SessionEngine::new(store, Arc::new(gw.clone()), settings())
}

/// Start, wait for the loop to halt, and return the persisted state.
async fn run_to_halt(engine: &SessionEngine, store: &dyn StateStore, operator: &str) -> SessionState {
    engine.start(operator).await.unwrap();
    engine.wait(operator).await;
    store.load_state(operator).await.unwrap().unwrap()
}

fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn sides(store: &dyn StateStore, operator: &str) -> Vec<Side> {
    store
        .list_trades(operator, 100)
        .await
        .unwrap()
        .into_iter()
        .rev()
        .map(|t| t.side)
        .collect()
}

// ---------------------------------------------------------------------------
// Sizing and cadence
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_first_tick_buys_two_percent_with_slippage_floor() {
    let store = Arc::new(MemoryStore::new());
    let gw = ScriptedGateway::new(dec!(2.5), dec!(0), dec!(5000));
    let engine = engine_for(store.clone(), &gw, "alice", session(1)).await;

    let state = run_to_halt(&engine, store.as_ref(), "alice").await;

    let requests = gw.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].side, Side::Buy);
    assert_eq!(requests[0].asset_in, Asset::Quote);
    assert_eq!(requests[0].amount_in, dec!(200));
    // (200 / 2.5) × 0.995
    assert_eq!(requests[0].min_amount_out, dec!(79.6));

    assert_eq!(state.trades_executed, 1);
    assert_eq!(state.cycle_position, 1);
    assert_eq!(state.halt_reason, Some(HaltReason::MaxTradesReached));
}

#[tokio::test(start_paused = true)]
async fn test_four_trades_complete_one_cycle_and_halt() {
    let store = Arc::new(MemoryStore::new());
    let gw = gateway();
    let engine = engine_for(store.clone(), &gw, "alice", session(4)).await;
    let mut events = engine.subscribe();

    let state = run_to_halt(&engine, store.as_ref(), "alice").await;

    assert_eq!(state.halt_reason, Some(HaltReason::MaxTradesReached));
    assert!(!state.active);
    assert_eq!(state.trades_executed, 4);
    assert_eq!(state.cycle_position, 0);
    assert_eq!(state.spent_notional, dec!(400));
    assert_eq!(state.received_quote, dec!(400));
    assert_eq!(state.base_position_delta, Decimal::ZERO);
    assert_eq!(
        sides(store.as_ref(), "alice").await,
        vec![Side::Buy, Side::Buy, Side::Sell, Side::Sell]
    );

    let events = drain(&mut events);
    assert!(matches!(events.first(), Some(Notification::Started { resumed: false, .. })));
    let trades = events
        .iter()
        .filter(|e| matches!(e, Notification::TradeCompleted { .. }))
        .count();
    assert_eq!(trades, 4);
    assert!(matches!(
        events.last(),
        Some(Notification::Halted {
            reason: HaltReason::MaxTradesReached,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_below_minimum_notional_halts_without_trading() {
    let store = Arc::new(MemoryStore::new());
    let gw = gateway();
    let config = SessionConfig {
        min_notional: dec!(50),
        ..SessionConfig::new(dec!(1000), dec!(0.1), 60)
    };
    let engine = engine_for(store.clone(), &gw, "alice", config).await;

    let state = run_to_halt(&engine, store.as_ref(), "alice").await;

    assert_eq!(state.halt_reason, Some(HaltReason::SizingRejected));
    assert_eq!(state.cycle_position, 0);
    assert_eq!(gw.swap_count(), 0);
    assert!(store.list_trades("alice", 10).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_insufficient_balance_halts_before_swap() {
    let store = Arc::new(MemoryStore::new());
    let gw = ScriptedGateway::new(dec!(2), dec!(0), dec!(150));
    let engine = engine_for(store.clone(), &gw, "alice", session(10)).await;

    let state = run_to_halt(&engine, store.as_ref(), "alice").await;

    assert_eq!(state.halt_reason, Some(HaltReason::InsufficientBalance));
    assert!(state.last_error.unwrap().contains("quote"));
    assert_eq!(gw.swap_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_position_limit_rejects_third_buy() {
    let store = Arc::new(MemoryStore::new());
    let gw = gateway();
    let config = SessionConfig {
        max_position: Some(dec!(150)),
        ..session(10)
    };
    let engine = engine_for(store.clone(), &gw, "alice", config).await;

    // Each BUY acquires 100 base; the second would reach 200 > 150.
    let state = run_to_halt(&engine, store.as_ref(), "alice").await;

    assert_eq!(state.halt_reason, Some(HaltReason::SizingRejected));
    assert_eq!(state.trades_executed, 1);
    assert_eq!(state.cycle_position, 1);
}

// ---------------------------------------------------------------------------
// Accounting
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_aggregates_match_trade_history_under_moving_price() {
    let store = Arc::new(MemoryStore::new());
    let gw = gateway();
    let engine = engine_for(store.clone(), &gw, "alice", session(6)).await;
    let mut events = engine.subscribe();

    engine.start("alice").await.unwrap();
    let prices = [dec!(2.2), dec!(1.9), dec!(2.5), dec!(2.05), dec!(1.75)];
    let mut next_price = prices.iter();
    loop {
        match events.recv().await.unwrap() {
            Notification::TradeCompleted { .. } => {
                if let Some(price) = next_price.next() {
                    gw.set_price(*price);
                }
            }
            Notification::Halted { .. } => break,
            _ => {}
        }
    }
    engine.wait("alice").await;

    let state = store.load_state("alice").await.unwrap().unwrap();
    let trades = store.list_trades("alice", 100).await.unwrap();
    assert_eq!(trades.len(), 6);

    let spent: Decimal = trades
        .iter()
        .filter(|t| t.side == Side::Buy)
        .map(|t| t.amount_in)
        .sum();
    let received: Decimal = trades
        .iter()
        .filter(|t| t.side == Side::Sell)
        .map(|t| t.amount_out)
        .sum();
    let acquired: Decimal = trades
        .iter()
        .filter(|t| t.side == Side::Buy)
        .map(|t| t.amount_out)
        .sum();
    let disposed: Decimal = trades
        .iter()
        .filter(|t| t.side == Side::Sell)
        .map(|t| t.amount_in)
        .sum();

    assert_eq!(state.spent_notional, spent);
    assert_eq!(state.received_quote, received);
    assert_eq!(state.base_position_delta, acquired - disposed);
    assert_eq!(state.net_quote(), received - spent);
    assert_eq!(state.spent_notional, dec!(800));
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_keeps_cycle_position() {
    let store = Arc::new(MemoryStore::new());
    let gw = gateway();
    gw.script([
        None,
        None,
        Some(GatewayError::Reverted("execution reverted".into())),
    ]);
    let engine = engine_for(store.clone(), &gw, "alice", session(10)).await;

    let state = run_to_halt(&engine, store.as_ref(), "alice").await;

    assert_eq!(state.halt_reason, Some(HaltReason::TradeReverted));
    assert_eq!(state.cycle_position, 2);
    assert_eq!(state.trades_executed, 2);
    assert_eq!(gw.swap_count(), 3);
    assert_eq!(store.list_trades("alice", 10).await.unwrap().len(), 2);

    let status = engine.status("alice").await.unwrap();
    assert_eq!(status.phase, SessionPhase::Halted);
    assert_eq!(status.next_side, Side::Sell);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_exhaust_to_trade_failed() {
    let store = Arc::new(MemoryStore::new());
    let gw = gateway();
    gw.script((0..3).map(|_| Some(GatewayError::Timeout("rpc".into()))));
    let engine = engine_for(store.clone(), &gw, "alice", session(10)).await;

    let state = run_to_halt(&engine, store.as_ref(), "alice").await;

    assert_eq!(state.halt_reason, Some(HaltReason::TradeFailed));
    assert_eq!(state.cycle_position, 0);
    assert_eq!(state.trades_executed, 0);
    // First attempt plus two retries.
    assert_eq!(gw.swap_count(), 3);
    assert!(state.last_error.unwrap().contains("timeout"));
    assert!(store.list_trades("alice", 10).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_then_success_trades_once() {
    let store = Arc::new(MemoryStore::new());
    let gw = gateway();
    gw.script([Some(GatewayError::Unavailable("502".into()))]);
    let engine = engine_for(store.clone(), &gw, "alice", session(1)).await;

    let state = run_to_halt(&engine, store.as_ref(), "alice").await;

    assert_eq!(state.halt_reason, Some(HaltReason::MaxTradesReached));
    assert_eq!(state.trades_executed, 1);
    assert_eq!(gw.swap_count(), 2);
    assert_eq!(store.list_trades("alice", 10).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unrecorded_trade_halts_with_persistence_failed() {
    let store = Arc::new(FlakyStore::default());
    store.fail_appends(true);
    let gw = gateway();
    let engine = engine_for(store.clone(), &gw, "alice", session(10)).await;

    let state = run_to_halt(&engine, store.as_ref(), "alice").await;

    assert_eq!(state.halt_reason, Some(HaltReason::PersistenceFailed));
    assert_eq!(state.trades_executed, 0);
    assert_eq!(state.cycle_position, 0);
    assert_eq!(state.spent_notional, Decimal::ZERO);
    assert_eq!(gw.swap_count(), 1);
    // The confirmed transaction is named for reconciliation.
    assert!(state.last_error.unwrap().contains("0x"));
}

#[tokio::test(start_paused = true)]
async fn test_unsaved_state_is_reconciled_on_recovery() {
    let store = Arc::new(FlakyStore::default());
    let gw = gateway();
    let engine = engine_for(store.clone(), &gw, "alice", session(2)).await;
    let mut events = engine.subscribe();
    store.fail_state_saves(true);

    engine.start("alice").await.unwrap();
    engine.wait("alice").await;

    // The swap is logged but neither the trade nor the halt reached the state.
    let events = drain(&mut events);
    assert!(matches!(
        events.last(),
        Some(Notification::HaltNotPersisted {
            reason: HaltReason::PersistenceFailed,
            ..
        })
    ));
    assert!(!events
        .iter()
        .any(|e| matches!(e, Notification::Halted { .. })));
    let stale = store.load_state("alice").await.unwrap().unwrap();
    assert!(stale.active);
    assert_eq!(stale.trades_executed, 0);
    assert_eq!(store.list_trades("alice", 10).await.unwrap().len(), 1);
    drop(engine);

    store.fail_state_saves(false);
    let recovered = SessionEngine::new(store.clone(), Arc::new(gw.clone()), settings());
    let mut events = recovered.subscribe();
    assert_eq!(recovered.recover().await.unwrap(), vec!["alice".to_string()]);
    recovered.wait("alice").await;

    match drain(&mut events).first() {
        Some(Notification::Started { resumed, aggregates, .. }) => {
            assert!(resumed);
            assert_eq!(aggregates.trades_executed, 1);
            assert_eq!(aggregates.cycle_position, 1);
        }
        other => panic!("expected a resumed start, got {other:?}"),
    }

    // Position 0 ran once; the resumed loop continued at position 1.
    assert_eq!(gw.swap_count(), 2);
    assert_eq!(sides(store.as_ref(), "alice").await, vec![Side::Buy, Side::Buy]);
    let state = store.load_state("alice").await.unwrap().unwrap();
    assert_eq!(state.halt_reason, Some(HaltReason::MaxTradesReached));
    assert_eq!(state.trades_executed, 2);
    assert_eq!(state.cycle_position, 2);
    assert_eq!(state.spent_notional, dec!(400));
}

#[tokio::test(start_paused = true)]
async fn test_dust_price_halts_with_sizing_rejected() {
    let store = Arc::new(MemoryStore::new());
    let gw = ScriptedGateway::new(dec!(0.0000000000000000000000000001), dec!(0), dec!(100000));
    let engine = engine_for(store.clone(), &gw, "alice", session(10)).await;

    let state = run_to_halt(&engine, store.as_ref(), "alice").await;

    assert_eq!(state.halt_reason, Some(HaltReason::SizingRejected));
    assert!(!state.active);
    assert_eq!(gw.swap_count(), 0);
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_second_start_rejected_and_single_loop_runs() {
    let store = Arc::new(MemoryStore::new());
    let gw = gateway();
    let engine = engine_for(store.clone(), &gw, "alice", session(100)).await;

    engine.start("alice").await.unwrap();
    assert!(matches!(
        engine.start("alice").await,
        Err(EngineError::AlreadyActive(_))
    ));

    tokio::time::sleep(Duration::from_secs(150)).await;
    assert!(matches!(
        engine.start("alice").await,
        Err(EngineError::AlreadyActive(_))
    ));
    engine.stop("alice").await.unwrap();
    engine.wait("alice").await;

    let state = store.load_state("alice").await.unwrap().unwrap();
    // Ticks at 0s, 60s and 120s from exactly one loop.
    assert_eq!(state.trades_executed, 3);
    assert_eq!(gw.swap_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_stop_finishes_attempt_then_halts() {
    let store = Arc::new(MemoryStore::new());
    let gw = gateway();
    let engine = engine_for(store.clone(), &gw, "alice", session(100)).await;
    let mut events = engine.subscribe();

    engine.start("alice").await.unwrap();
    tokio::time::sleep(Duration::from_secs(61)).await;

    let stopping = engine.stop("alice").await.unwrap();
    assert_eq!(stopping.phase, SessionPhase::Stopping);
    engine.wait("alice").await;

    let status = engine.status("alice").await.unwrap();
    assert_eq!(status.phase, SessionPhase::Halted);
    assert_eq!(status.halt_reason, Some(HaltReason::StoppedByOperator));
    assert_eq!(status.aggregates.trades_executed, 2);
    assert_eq!(status.next_side, Side::Sell);

    let events = drain(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, Notification::StopRequested { .. })));
    assert!(matches!(
        events.last(),
        Some(Notification::Halted {
            reason: HaltReason::StoppedByOperator,
            ..
        })
    ));

    // A fresh start begins a new session from zero.
    let restarted = engine.start("alice").await.unwrap();
    assert_eq!(restarted.phase, SessionPhase::Running);
    assert_eq!(restarted.halt_reason, None);
    tokio::time::sleep(Duration::from_secs(1)).await;
    engine.shutdown().await;
    let state = store.load_state("alice").await.unwrap().unwrap();
    assert_eq!(state.trades_executed, 1);
    assert_eq!(state.cycle_position, 1);
}

#[tokio::test(start_paused = true)]
async fn test_resume_repeats_the_interrupted_step() {
    let store = Arc::new(MemoryStore::new());
    let gw = gateway();
    let first = engine_for(store.clone(), &gw, "alice", session(8)).await;

    first.start("alice").await.unwrap();
    tokio::time::sleep(Duration::from_secs(121)).await;
    first.shutdown().await;
    drop(first);

    let persisted = store.load_state("alice").await.unwrap().unwrap();
    assert!(persisted.active);
    assert_eq!(persisted.cycle_position, 3);

    let second = SessionEngine::new(store.clone(), Arc::new(gw.clone()), settings());
    let mut events = second.subscribe();
    assert_eq!(second.recover().await.unwrap(), vec!["alice".to_string()]);
    second.wait("alice").await;

    let events = drain(&mut events);
    assert!(matches!(events.first(), Some(Notification::Started { resumed: true, .. })));
    match events.get(1) {
        Some(Notification::TradeCompleted { trade, .. }) => assert_eq!(trade.side, Side::Sell),
        other => panic!("expected a trade after resume, got {other:?}"),
    }

    let state = store.load_state("alice").await.unwrap().unwrap();
    assert_eq!(state.trades_executed, 8);
    assert_eq!(state.cycle_position, 0);
    assert_eq!(
        sides(store.as_ref(), "alice").await,
        vec![
            Side::Buy,
            Side::Buy,
            Side::Sell,
            Side::Sell,
            Side::Buy,
            Side::Buy,
            Side::Sell,
            Side::Sell
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_operators_run_independently() {
    let store = Arc::new(MemoryStore::new());
    let gw = gateway();
    let engine = engine_for(store.clone(), &gw, "alice", session(2)).await;
    store
        .save_config(
            "bob",
            &SessionConfig {
                max_trades: 3,
                ..SessionConfig::new(dec!(5000), dec!(1), 30)
            },
        )
        .await
        .unwrap();

    engine.start("alice").await.unwrap();
    engine.start("bob").await.unwrap();
    engine.wait("alice").await;
    engine.wait("bob").await;

    let alice = store.load_state("alice").await.unwrap().unwrap();
    let bob = store.load_state("bob").await.unwrap().unwrap();
    assert_eq!(alice.trades_executed, 2);
    assert_eq!(alice.spent_notional, dec!(400));
    assert_eq!(bob.trades_executed, 3);
    assert_eq!(bob.spent_notional, dec!(100));
    assert_eq!(store.list_trades("bob", 10).await.unwrap().len(), 3);
}

// Runs on real time: under a paused clock the runtime auto-advances while
// sqlx works on its connection thread, so every pool acquire times out.
// Takes ~3 minutes (three 60s intervals).
#[tokio::test]
async fn test_full_cycle_on_sqlite_store() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let gw = gateway();
    let engine = engine_for(store.clone(), &gw, "alice", session(4)).await;

    let state = run_to_halt(&engine, store.as_ref(), "alice").await;

    assert_eq!(state.halt_reason, Some(HaltReason::MaxTradesReached));
    assert_eq!(state.cycle_position, 0);
    let trades = store.list_trades("alice", 10).await.unwrap();
    assert_eq!(trades.len(), 4);
    assert_eq!(trades[0].side, Side::Sell);
    assert_eq!(trades[3].execution_price, dec!(2));
}
