//! Per-operator session loop.
//!
//! One runner per running session, owned by a tokio task. Each tick reloads
//! the persisted state, executes the next pattern step and persists the
//! outcome before announcing it. The lifecycle token is checked at every
//! tick boundary and interrupts the interval wait, never an attempt.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::engine::accountant::Accountant;
use crate::engine::executor::Executor;
use crate::engine::notify::{Notification, Notifier};
use crate::engine::retry::RetryPolicy;
use crate::storage::StateStore;
use crate::strategy::PatternScheduler;
use crate::types::{HaltReason, OperatorId, SessionConfig, SessionState, StoreError, TradeRecord};

/// Signal sent from the engine to a running loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    /// Finish the current attempt, then halt with `stopped-by-operator`.
    StopRequested,
    /// Exit without touching the persisted state; the session resumes on
    /// the next boot.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Traded(TradeRecord),
    Halted(HaltReason),
    /// The loop must end but the store still holds the pre-halt state.
    HaltNotPersisted(HaltReason),
    /// The persisted state was deactivated elsewhere.
    Detached,
}

pub struct SessionRunner {
    operator: OperatorId,
    config: SessionConfig,
    state: SessionState,
    store: Arc<dyn StateStore>,
    executor: Executor,
    /// Backoff for retrying failed state saves.
    persist_retry: RetryPolicy,
    notifier: Notifier,
    lifecycle: watch::Receiver<Lifecycle>,
}

impl SessionRunner {
    pub fn new(
        operator: OperatorId,
        config: SessionConfig,
        state: SessionState,
        store: Arc<dyn StateStore>,
        executor: Executor,
        persist_retry: RetryPolicy,
        notifier: Notifier,
        lifecycle: watch::Receiver<Lifecycle>,
    ) -> Self {
        Self {
            operator,
            config,
            state,
            store,
            executor,
            persist_retry,
            notifier,
            lifecycle,
        }
    }

    /// Drive the session until it halts, detaches or is shut down.
    pub async fn run(mut self) {
        info!(
            operator = %self.operator,
            config = %self.config,
            cycle = self.state.cycle_position,
            trades = self.state.trades_executed,
            "Session loop started"
        );

        loop {
            let signal = *self.lifecycle.borrow_and_update();
            match signal {
                Lifecycle::StopRequested => {
                    self.halt(HaltReason::StoppedByOperator, None).await;
                    break;
                }
                Lifecycle::Shutdown => {
                    info!(operator = %self.operator, "Session suspended for shutdown");
                    break;
                }
                Lifecycle::Running => {}
            }

            match self.tick().await {
                TickOutcome::Traded(_) => {}
                TickOutcome::Halted(_) | TickOutcome::HaltNotPersisted(_) | TickOutcome::Detached => {
                    break
                }
            }

            let engine_gone = tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => false,
                changed = self.lifecycle.changed() => changed.is_err(),
            };
            if engine_gone {
                warn!(operator = %self.operator, "Engine dropped, session left resumable");
                break;
            }
        }

        debug!(operator = %self.operator, "Session loop exited");
    }

    /// One pattern step, start to persisted finish.
    pub async fn tick(&mut self) -> TickOutcome {
        match self.store.load_state(&self.operator).await {
            Ok(Some(state)) if state.active => self.state = state,
            Ok(_) => {
                warn!(operator = %self.operator, "Persisted session is no longer active, detaching");
                return TickOutcome::Detached;
            }
            Err(e) => {
                return self
                    .halt(
                        HaltReason::PersistenceFailed,
                        Some(format!("failed to load session state: {e}")),
                    )
                    .await
            }
        }

        if self.state.trades_executed >= self.config.max_trades {
            return self.halt(HaltReason::MaxTradesReached, None).await;
        }

        let side = PatternScheduler::side_at(self.state.cycle_position);
        debug!(
            operator = %self.operator,
            side = %side,
            cycle = self.state.cycle_position,
            "Executing pattern step"
        );

        let fill = match self
            .executor
            .execute(side, &self.config, self.state.base_position_delta)
            .await
        {
            Ok(fill) => fill,
            Err(failure) => {
                warn!(
                    operator = %self.operator,
                    side = %side,
                    error = %failure,
                    "Trade attempt failed"
                );
                return self.halt(failure.halt_reason(), Some(failure.to_string())).await;
            }
        };

        let now = Utc::now();
        let record = Accountant::record_fill(&self.operator, side, &fill.receipt, now);

        if let Err(e) = self.store.append_trade(&self.operator, &record).await {
            error!(operator = %self.operator, tx_id = %record.tx_id, error = %e, "Trade confirmed but not recorded");
            return self
                .halt(
                    HaltReason::PersistenceFailed,
                    Some(format!("trade {} confirmed but not recorded: {e}", record.tx_id)),
                )
                .await;
        }

        let mut next = self.state.clone();
        Accountant::apply(&mut next, &record, now);
        let saved = self.persist(&next).await;
        self.state = next;
        if let Err(e) = saved {
            // The record is durable, so the halt carries the trade with it.
            error!(operator = %self.operator, tx_id = %record.tx_id, error = %e, "Trade recorded but state not saved");
            return self
                .halt(
                    HaltReason::PersistenceFailed,
                    Some(format!("trade {} recorded, state save failed: {e}", record.tx_id)),
                )
                .await;
        }

        self.notifier.publish(Notification::TradeCompleted {
            operator: self.operator.clone(),
            trade: record.clone(),
            aggregates: self.state.aggregates(),
        });

        if self.state.trades_executed >= self.config.max_trades {
            return self.halt(HaltReason::MaxTradesReached, None).await;
        }
        TickOutcome::Traded(record)
    }

    /// Persist a halt, then announce it. A halt that cannot be saved is
    /// announced as such and leaves the session to recovery.
    async fn halt(&mut self, reason: HaltReason, detail: Option<String>) -> TickOutcome {
        let mut halted = self.state.clone();
        halted.halt(reason, detail.clone(), Utc::now());
        if let Err(e) = self.persist(&halted).await {
            error!(
                operator = %self.operator,
                reason = %reason,
                error = %e,
                "Halt not persisted, session left active for recovery"
            );
            self.notifier.publish(Notification::HaltNotPersisted {
                operator: self.operator.clone(),
                reason,
                detail,
                error: e.to_string(),
            });
            return TickOutcome::HaltNotPersisted(reason);
        }
        self.state = halted;

        if reason.is_failure() {
            warn!(operator = %self.operator, reason = %reason, state = %self.state, "Session halted");
        } else {
            info!(operator = %self.operator, reason = %reason, state = %self.state, "Session halted");
        }

        self.notifier.publish(Notification::Halted {
            operator: self.operator.clone(),
            reason,
            detail,
            aggregates: self.state.aggregates(),
        });
        TickOutcome::Halted(reason)
    }

    /// Save `state`, retrying store failures with backoff.
    async fn persist(&self, state: &SessionState) -> Result<(), StoreError> {
        let mut retry = 0;
        loop {
            match self.store.save_state(&self.operator, state).await {
                Ok(()) => return Ok(()),
                Err(e) if retry < self.persist_retry.max_retries => {
                    retry += 1;
                    let delay = self.persist_retry.backoff(retry);
                    warn!(
                        operator = %self.operator,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "State save failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
