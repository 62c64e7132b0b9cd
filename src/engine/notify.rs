//! Reason-coded session notifications.
//!
//! Every start, completed trade, stop request and halt is published on a
//! broadcast channel. The control surface (or the binary's log task)
//! subscribes; a lagging or absent subscriber never blocks a session.

use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{Aggregates, HaltReason, OperatorId, SessionConfig, TradeRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    Started {
        operator: OperatorId,
        resumed: bool,
        config: SessionConfig,
        aggregates: Aggregates,
    },
    TradeCompleted {
        operator: OperatorId,
        trade: TradeRecord,
        aggregates: Aggregates,
    },
    StopRequested {
        operator: OperatorId,
    },
    Halted {
        operator: OperatorId,
        reason: HaltReason,
        detail: Option<String>,
        aggregates: Aggregates,
    },
    /// The loop gave up but the halt could not be saved. The store still
    /// marks the session active, so the next `recover` resumes it.
    HaltNotPersisted {
        operator: OperatorId,
        reason: HaltReason,
        detail: Option<String>,
        error: String,
    },
}

impl Notification {
    pub fn operator(&self) -> &str {
        match self {
            Notification::Started { operator, .. }
            | Notification::TradeCompleted { operator, .. }
            | Notification::StopRequested { operator }
            | Notification::Halted { operator, .. }
            | Notification::HaltNotPersisted { operator, .. } => operator,
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Started {
                operator,
                resumed,
                config,
                aggregates,
            } => {
                let verb = if *resumed { "resumed" } else { "started" };
                write!(
                    f,
                    "[{operator}] session {verb}: {config} (cycle {})",
                    aggregates.cycle_position
                )
            }
            Notification::TradeCompleted {
                operator,
                trade,
                aggregates,
            } => write!(f, "[{operator}] {trade} | {aggregates}"),
            Notification::StopRequested { operator } => {
                write!(f, "[{operator}] stop requested, finishing current attempt")
            }
            Notification::Halted {
                operator,
                reason,
                detail,
                aggregates,
            } => {
                write!(f, "[{operator}] session halted: {reason}")?;
                if let Some(detail) = detail {
                    write!(f, " ({detail})")?;
                }
                write!(f, " | {aggregates}")
            }
            Notification::HaltNotPersisted {
                operator,
                reason,
                detail,
                error,
            } => {
                write!(f, "[{operator}] session loop ended ({reason}) but the halt was not saved: {error}")?;
                if let Some(detail) = detail {
                    write!(f, " ({detail})")?;
                }
                write!(f, "; resumes on next recovery")
            }
        }
    }
}

/// Cloneable publishing half of the notification channel.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            debug!("Notification dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
