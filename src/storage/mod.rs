//! Persistence layer.
//!
//! `StateStore` is durable per-operator storage of session configuration,
//! runtime state and trade history. Backends: an in-process `MemoryStore`
//! and a SQLite-backed `SqliteStore`.
//!
//! The store owns the single-active-session guarantee: `try_activate` is a
//! compare-and-set on the persisted `active` flag. A restarted process
//! resumes an orphaned session instead of spawning a second one.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{OperatorId, SessionConfig, SessionState, StoreError, TradeRecord};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Result of the activation compare-and-set.
#[derive(Debug, Clone, PartialEq)]
pub enum Activation {
    /// The flag was clear and is now set; aggregates were reset.
    Activated(SessionState),
    /// The flag was already set with no loop attached (crash leftover);
    /// the state is returned unchanged for resumption.
    Resumable(SessionState),
}

impl Activation {
    pub fn state(&self) -> &SessionState {
        match self {
            Activation::Activated(s) | Activation::Resumable(s) => s,
        }
    }

    pub fn is_resume(&self) -> bool {
        matches!(self, Activation::Resumable(_))
    }
}

/// Durable storage keyed by operator identity.
///
/// Reads for an operator always reflect that operator's latest committed
/// write.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_config(&self, operator: &str) -> Result<Option<SessionConfig>, StoreError>;

    async fn save_config(&self, operator: &str, config: &SessionConfig) -> Result<(), StoreError>;

    async fn load_state(&self, operator: &str) -> Result<Option<SessionState>, StoreError>;

    /// Replace the operator's state atomically.
    async fn save_state(&self, operator: &str, state: &SessionState) -> Result<(), StoreError>;

    /// Compare-and-set the `active` flag. Creates the state row if missing.
    async fn try_activate(&self, operator: &str, now: DateTime<Utc>) -> Result<Activation, StoreError>;

    /// Append a trade. Never fails silently.
    async fn append_trade(&self, operator: &str, record: &TradeRecord) -> Result<(), StoreError>;

    /// Most recent trades first.
    async fn list_trades(&self, operator: &str, limit: usize) -> Result<Vec<TradeRecord>, StoreError>;

    /// Operators whose persisted state is active (recovery after restart).
    async fn active_operators(&self) -> Result<Vec<OperatorId>, StoreError>;
}
