//! Session engine: the control surface over per-operator session loops.
//!
//! `start` / `stop` / `status` plus configuration updates, crash recovery
//! and graceful shutdown. Running loops are tracked in an in-process
//! registry; the persisted `active` flag in the store is the durable
//! membership record.

pub mod accountant;
pub mod executor;
pub mod notify;
pub mod retry;
pub mod runner;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{info, warn};

use crate::gateway::ExchangeGateway;
use crate::storage::{Activation, StateStore};
use crate::strategy::PatternScheduler;
use crate::types::{
    Aggregates, Asset, ConfigError, EngineError, HaltReason, OperatorId, SessionConfig,
    SessionPhase, SessionState, Side, TradeRecord,
};

use accountant::Accountant;
use executor::Executor;
use notify::{Notification, Notifier};
use retry::RetryPolicy;
use runner::{Lifecycle, SessionRunner};

/// Trade records read beyond the resumed trade count when reconciling.
const RECONCILE_WINDOW: usize = 16;

// ---------------------------------------------------------------------------
// Settings and reports
// ---------------------------------------------------------------------------

/// Engine-wide knobs shared by every session.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    /// Bound on every gateway call.
    pub gateway_timeout: Duration,
    /// Native balance that must remain available for gas.
    pub gas_reserve: Decimal,
    pub notification_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            gateway_timeout: Duration::from_secs(30),
            gas_reserve: Decimal::ZERO,
            notification_buffer: 256,
        }
    }
}

/// What the control surface sees for one operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub operator: OperatorId,
    pub phase: SessionPhase,
    /// Persisted membership flag.
    pub active: bool,
    pub config: Option<SessionConfig>,
    pub aggregates: Aggregates,
    pub next_side: Side,
    /// Quote notional of the next trade, if configured.
    pub trade_amount: Option<Decimal>,
    pub halt_reason: Option<HaltReason>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Best-effort live market view. Absent fields mean the gateway did not
/// answer in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub price: Option<Decimal>,
    pub base_balance: Option<Decimal>,
    pub quote_balance: Option<Decimal>,
    pub native_balance: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct SessionHandle {
    lifecycle: watch::Sender<Lifecycle>,
    done: Shared<BoxFuture<'static, ()>>,
}

impl SessionHandle {
    fn is_finished(&self) -> bool {
        self.done.clone().now_or_never().is_some()
    }

    fn phase(&self) -> SessionPhase {
        match *self.lifecycle.borrow() {
            Lifecycle::Running => SessionPhase::Running,
            _ => SessionPhase::Stopping,
        }
    }

    /// Send `signal` unless the loop already has a pending stop.
    fn signal(&self, signal: Lifecycle) -> bool {
        self.lifecycle.send_if_modified(|current| {
            if *current == Lifecycle::Running {
                *current = signal;
                true
            } else {
                false
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SessionEngine {
    store: Arc<dyn StateStore>,
    gateway: Arc<dyn ExchangeGateway>,
    settings: EngineSettings,
    notifier: Notifier,
    sessions: Mutex<HashMap<OperatorId, SessionHandle>>,
}

impl SessionEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        gateway: Arc<dyn ExchangeGateway>,
        settings: EngineSettings,
    ) -> Self {
        let notifier = Notifier::new(settings.notification_buffer);
        Self {
            store,
            gateway,
            settings,
            notifier,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Start (or resume an orphaned) session for `operator`.
    pub async fn start(&self, operator: &str) -> Result<SessionStatus, EngineError> {
        {
            let mut sessions = self.sessions.lock().await;
            if sessions.get(operator).is_some_and(|h| !h.is_finished()) {
                return Err(EngineError::AlreadyActive(operator.to_string()));
            }
            sessions.remove(operator);

            let config = self.load_valid_config(operator).await?;
            let activation = self.store.try_activate(operator, Utc::now()).await?;
            let activation = self.reconcile(operator, activation).await?;
            let handle = self.spawn(operator, config, activation);
            sessions.insert(operator.to_string(), handle);
        }
        self.status(operator).await
    }

    /// Request a stop. The in-flight attempt finishes first; the loop then
    /// halts with `stopped-by-operator`. Without a running loop this only
    /// clears an orphaned active flag and reports the terminal figures.
    pub async fn stop(&self, operator: &str) -> Result<SessionStatus, EngineError> {
        {
            let sessions = self.sessions.lock().await;
            match sessions.get(operator).filter(|h| !h.is_finished()) {
                Some(handle) => {
                    if handle.signal(Lifecycle::StopRequested) {
                        info!(operator, "Stop requested");
                        self.notifier.publish(Notification::StopRequested {
                            operator: operator.to_string(),
                        });
                    }
                }
                None => {
                    if let Some(mut state) = self.store.load_state(operator).await? {
                        if state.active {
                            state.halt(HaltReason::StoppedByOperator, None, Utc::now());
                            self.store.save_state(operator, &state).await?;
                            info!(operator, "Cleared orphaned session");
                            self.notifier.publish(Notification::Halted {
                                operator: operator.to_string(),
                                reason: HaltReason::StoppedByOperator,
                                detail: None,
                                aggregates: state.aggregates(),
                            });
                        }
                    }
                }
            }
        }
        self.status(operator).await
    }

    /// Current phase, configuration and persisted aggregates.
    pub async fn status(&self, operator: &str) -> Result<SessionStatus, EngineError> {
        let live_phase = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(operator)
                .filter(|h| !h.is_finished())
                .map(SessionHandle::phase)
        };
        let config = self.store.load_config(operator).await?;
        let state = self
            .store
            .load_state(operator)
            .await?
            .unwrap_or_else(|| SessionState::new(Utc::now()));

        let phase = match live_phase {
            Some(phase) => phase,
            None if state.halt_reason.is_some() => SessionPhase::Halted,
            None => SessionPhase::Idle,
        };

        Ok(SessionStatus {
            operator: operator.to_string(),
            phase,
            active: state.active,
            trade_amount: config.as_ref().map(SessionConfig::trade_notional),
            config,
            aggregates: state.aggregates(),
            next_side: PatternScheduler::side_at(state.cycle_position),
            halt_reason: state.halt_reason,
            last_error: state.last_error,
            started_at: state.started_at,
            stopped_at: state.stopped_at,
        })
    }

    /// Live price and balances. Each figure is independent; failures are
    /// reported as absent.
    pub async fn market_snapshot(&self) -> MarketSnapshot {
        let timeout = self.settings.gateway_timeout;
        let gw = &self.gateway;
        let (price, base, quote, native) = tokio::join!(
            tokio::time::timeout(timeout, gw.get_spot_price()),
            tokio::time::timeout(timeout, gw.get_balance(Asset::Base)),
            tokio::time::timeout(timeout, gw.get_balance(Asset::Quote)),
            tokio::time::timeout(timeout, gw.get_balance(Asset::Native)),
        );
        MarketSnapshot {
            price: price.ok().and_then(Result::ok),
            base_balance: base.ok().and_then(Result::ok),
            quote_balance: quote.ok().and_then(Result::ok),
            native_balance: native.ok().and_then(Result::ok),
        }
    }

    /// Replace an operator's configuration. Refused while a session is
    /// active, so a running session never sees its parameters change.
    pub async fn configure(
        &self,
        operator: &str,
        config: SessionConfig,
    ) -> Result<SessionConfig, EngineError> {
        config.validate()?;
        let sessions = self.sessions.lock().await;
        let live = sessions.get(operator).is_some_and(|h| !h.is_finished());
        let persisted_active = self
            .store
            .load_state(operator)
            .await?
            .is_some_and(|s| s.active);
        if live || persisted_active {
            return Err(EngineError::AlreadyActive(operator.to_string()));
        }
        self.store.save_config(operator, &config).await?;
        info!(operator, config = %config, "Configuration saved");
        Ok(config)
    }

    /// Change only the trade percentage.
    pub async fn update_trade_pct(
        &self,
        operator: &str,
        trade_pct: Decimal,
    ) -> Result<SessionConfig, EngineError> {
        let mut config = self.existing_config(operator).await?;
        config.trade_pct = trade_pct;
        self.configure(operator, config).await
    }

    /// Change only the interval between trades.
    pub async fn update_interval(
        &self,
        operator: &str,
        interval_secs: u64,
    ) -> Result<SessionConfig, EngineError> {
        let mut config = self.existing_config(operator).await?;
        config.interval_secs = interval_secs;
        self.configure(operator, config).await
    }

    /// Most recent trades first.
    pub async fn trades(&self, operator: &str, limit: usize) -> Result<Vec<TradeRecord>, EngineError> {
        Ok(self.store.list_trades(operator, limit).await?)
    }

    /// Resume every session the store still marks active. Returns the
    /// operators that were resumed.
    pub async fn recover(&self) -> Result<Vec<OperatorId>, EngineError> {
        let mut resumed = Vec::new();
        let mut sessions = self.sessions.lock().await;

        for operator in self.store.active_operators().await? {
            if sessions.get(&operator).is_some_and(|h| !h.is_finished()) {
                continue;
            }

            let config = match self.load_valid_config(&operator).await {
                Ok(config) => config,
                Err(EngineError::Config(e)) => {
                    warn!(operator = %operator, error = %e, "Cannot resume session, halting");
                    if let Some(mut state) = self.store.load_state(&operator).await? {
                        state.halt(HaltReason::TradeReverted, Some(e.to_string()), Utc::now());
                        self.store.save_state(&operator, &state).await?;
                        self.notifier.publish(Notification::Halted {
                            operator: operator.clone(),
                            reason: HaltReason::TradeReverted,
                            detail: Some(e.to_string()),
                            aggregates: state.aggregates(),
                        });
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            let activation = self.store.try_activate(&operator, Utc::now()).await?;
            let activation = self.reconcile(&operator, activation).await?;
            let handle = self.spawn(&operator, config, activation);
            sessions.insert(operator.clone(), handle);
            resumed.push(operator);
        }

        if !resumed.is_empty() {
            info!(count = resumed.len(), operators = ?resumed, "Recovered active sessions");
        }
        Ok(resumed)
    }

    /// Wait for an operator's loop to exit. Returns at once if none runs.
    pub async fn wait(&self, operator: &str) {
        let done = {
            let sessions = self.sessions.lock().await;
            sessions.get(operator).map(|h| h.done.clone())
        };
        if let Some(done) = done {
            done.await;
        }
    }

    /// Suspend every running loop after its current attempt and wait for
    /// all of them. Sessions stay active in the store and resume on the
    /// next `recover`. Loops with a pending stop still halt.
    pub async fn shutdown(&self) {
        let pending: Vec<_> = {
            let mut sessions = self.sessions.lock().await;
            sessions
                .drain()
                .map(|(_, handle)| {
                    handle.signal(Lifecycle::Shutdown);
                    handle.done
                })
                .collect()
        };
        info!(sessions = pending.len(), "Waiting for session loops to finish");
        join_all(pending).await;
    }

    async fn existing_config(&self, operator: &str) -> Result<SessionConfig, EngineError> {
        self.store
            .load_config(operator)
            .await?
            .ok_or_else(|| ConfigError::Missing(operator.to_string()).into())
    }

    async fn load_valid_config(&self, operator: &str) -> Result<SessionConfig, EngineError> {
        let config = self.existing_config(operator).await?;
        config.validate()?;
        Ok(config)
    }

    /// Bring a resumed state up to date with the trade log before its loop
    /// runs again, so no recorded step is executed twice.
    async fn reconcile(
        &self,
        operator: &str,
        activation: Activation,
    ) -> Result<Activation, EngineError> {
        let mut state = match activation {
            Activation::Resumable(state) => state,
            fresh @ Activation::Activated(_) => return Ok(fresh),
        };
        let window = usize::try_from(state.trades_executed)
            .unwrap_or(usize::MAX)
            .saturating_add(RECONCILE_WINDOW);
        let history = self.store.list_trades(operator, window).await?;

        let folded = Accountant::reconcile(&mut state, &history);
        if folded > 0 {
            warn!(
                operator,
                folded,
                trades = state.trades_executed,
                cycle = state.cycle_position,
                "Resumed state was missing recorded trades, folded them in"
            );
            self.store.save_state(operator, &state).await?;
        }
        Ok(Activation::Resumable(state))
    }

    fn spawn(&self, operator: &str, config: SessionConfig, activation: Activation) -> SessionHandle {
        let resumed = activation.is_resume();
        let state = match activation {
            Activation::Activated(s) | Activation::Resumable(s) => s,
        };

        info!(
            operator,
            resumed,
            cycle = state.cycle_position,
            trades = state.trades_executed,
            "Session starting"
        );
        self.notifier.publish(Notification::Started {
            operator: operator.to_string(),
            resumed,
            config: config.clone(),
            aggregates: state.aggregates(),
        });

        let (tx, rx) = watch::channel(Lifecycle::Running);
        let executor = Executor::new(
            self.gateway.clone(),
            self.settings.retry,
            self.settings.gateway_timeout,
            self.settings.gas_reserve,
        );
        let runner = SessionRunner::new(
            operator.to_string(),
            config,
            state,
            self.store.clone(),
            executor,
            self.settings.retry,
            self.notifier.clone(),
            rx,
        );

        let done = tokio::spawn(runner.run()).map(|_| ()).boxed().shared();
        SessionHandle {
            lifecycle: tx,
            done,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
