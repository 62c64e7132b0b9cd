//! In-process store. Used by tests and paper runs that need no durability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{Activation, StateStore};
use crate::types::{OperatorId, SessionConfig, SessionState, StoreError, TradeRecord};

#[derive(Default)]
struct Tables {
    configs: HashMap<OperatorId, SessionConfig>,
    states: HashMap<OperatorId, SessionState>,
    trades: HashMap<OperatorId, Vec<TradeRecord>>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_config(&self, operator: &str) -> Result<Option<SessionConfig>, StoreError> {
        Ok(self.tables.lock().await.configs.get(operator).cloned())
    }

    async fn save_config(&self, operator: &str, config: &SessionConfig) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .configs
            .insert(operator.to_string(), config.clone());
        Ok(())
    }

    async fn load_state(&self, operator: &str) -> Result<Option<SessionState>, StoreError> {
        Ok(self.tables.lock().await.states.get(operator).cloned())
    }

    async fn save_state(&self, operator: &str, state: &SessionState) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .states
            .insert(operator.to_string(), state.clone());
        Ok(())
    }

    async fn try_activate(&self, operator: &str, now: DateTime<Utc>) -> Result<Activation, StoreError> {
        let mut tables = self.tables.lock().await;
        let state = tables
            .states
            .entry(operator.to_string())
            .or_insert_with(|| SessionState::new(now));

        if state.active {
            return Ok(Activation::Resumable(state.clone()));
        }
        state.begin_session(now);
        Ok(Activation::Activated(state.clone()))
    }

    async fn append_trade(&self, operator: &str, record: &TradeRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let trades = tables.trades.entry(operator.to_string()).or_default();
        if trades.iter().any(|t| t.id == record.id || t.tx_id == record.tx_id) {
            return Err(StoreError::Backend(format!(
                "duplicate trade record {} ({})",
                record.id, record.tx_id
            )));
        }
        trades.push(record.clone());
        Ok(())
    }

    async fn list_trades(&self, operator: &str, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .trades
            .get(operator)
            .map(|t| t.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn active_operators(&self) -> Result<Vec<OperatorId>, StoreError> {
        let tables = self.tables.lock().await;
        let mut ops: Vec<OperatorId> = tables
            .states
            .iter()
            .filter(|(_, s)| s.active)
            .map(|(op, _)| op.clone())
            .collect();
        ops.sort();
        Ok(ops)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
