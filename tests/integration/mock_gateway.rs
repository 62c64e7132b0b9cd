//! Scripted gateway and store wrappers for integration testing.
//!
//! `ScriptedGateway` fills every swap at the configured spot price unless
//! a failure has been queued for it, and records every swap request.
//! `FlakyStore` wraps a `MemoryStore` and can be told to fail appends or
//! state saves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cadence::gateway::{ExchangeGateway, SwapReceipt, SwapRequest};
use cadence::storage::{Activation, MemoryStore, StateStore};
use cadence::types::*;

struct Book {
    price: Decimal,
    base: Decimal,
    quote: Decimal,
    native: Decimal,
    /// Outcomes for upcoming swaps, consumed front to back. `None` fills.
    script: VecDeque<Option<GatewayError>>,
    requests: Vec<SwapRequest>,
    tx_seq: u64,
}

/// A deterministic exchange whose wallet and failures are controlled
/// from test code.
#[derive(Clone)]
pub struct ScriptedGateway {
    book: Arc<Mutex<Book>>,
}

impl ScriptedGateway {
    pub fn new(price: Decimal, base: Decimal, quote: Decimal) -> Self {
        Self {
            book: Arc::new(Mutex::new(Book {
                price,
                base,
                quote,
                native: Decimal::ONE,
                script: VecDeque::new(),
                requests: Vec::new(),
                tx_seq: 0,
            })),
        }
    }

    /// Queue outcomes for the next swaps: `None` fills, `Some(e)` fails.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Option<GatewayError>>) {
        self.book.lock().unwrap().script.extend(outcomes);
    }

    pub fn set_price(&self, price: Decimal) {
        self.book.lock().unwrap().price = price;
    }

    pub fn requests(&self) -> Vec<SwapRequest> {
        self.book.lock().unwrap().requests.clone()
    }

    pub fn swap_count(&self) -> usize {
        self.book.lock().unwrap().requests.len()
    }
}

#[async_trait]
impl ExchangeGateway for ScriptedGateway {
    async fn get_balance(&self, asset: Asset) -> Result<Decimal, GatewayError> {
        let book = self.book.lock().unwrap();
        Ok(match asset {
            Asset::Base => book.base,
            Asset::Quote => book.quote,
            Asset::Native => book.native,
        })
    }

    async fn get_spot_price(&self) -> Result<Decimal, GatewayError> {
        Ok(self.book.lock().unwrap().price)
    }

    async fn swap(&self, request: SwapRequest) -> Result<SwapReceipt, GatewayError> {
        let mut book = self.book.lock().unwrap();
        book.requests.push(request.clone());

        if let Some(Some(err)) = book.script.pop_front() {
            return Err(err);
        }

        let amount_out = match request.side {
            Side::Buy => request.amount_in / book.price,
            Side::Sell => request.amount_in * book.price,
        };
        match request.side {
            Side::Buy => {
                book.quote -= request.amount_in;
                book.base += amount_out;
            }
            Side::Sell => {
                book.base -= request.amount_in;
                book.quote += amount_out;
            }
        }
        book.tx_seq += 1;

        Ok(SwapReceipt {
            amount_in: request.amount_in,
            amount_out,
            tx_id: format!("0x{:064x}", book.tx_seq),
            gas_used: 21_000,
        })
    }
}

/// Memory store whose trade appends or state saves can be made to fail.
/// Activation writes through regardless.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_appends: AtomicBool,
    fail_state_saves: AtomicBool,
}

impl FlakyStore {
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_state_saves(&self, fail: bool) {
        self.fail_state_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn load_config(&self, operator: &str) -> Result<Option<SessionConfig>, StoreError> {
        self.inner.load_config(operator).await
    }

    async fn save_config(&self, operator: &str, config: &SessionConfig) -> Result<(), StoreError> {
        self.inner.save_config(operator, config).await
    }

    async fn load_state(&self, operator: &str) -> Result<Option<SessionState>, StoreError> {
        self.inner.load_state(operator).await
    }

    async fn save_state(&self, operator: &str, state: &SessionState) -> Result<(), StoreError> {
        if self.fail_state_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("database is locked".into()));
        }
        self.inner.save_state(operator, state).await
    }

    async fn try_activate(&self, operator: &str, now: DateTime<Utc>) -> Result<Activation, StoreError> {
        self.inner.try_activate(operator, now).await
    }

    async fn append_trade(&self, operator: &str, record: &TradeRecord) -> Result<(), StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk I/O error".into()));
        }
        self.inner.append_trade(operator, record).await
    }

    async fn list_trades(&self, operator: &str, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        self.inner.list_trades(operator, limit).await
    }

    async fn active_operators(&self) -> Result<Vec<OperatorId>, StoreError> {
        self.inner.active_operators().await
    }
}
