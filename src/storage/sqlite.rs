//! SQLite-backed store.
//!
//! Decimals are stored as TEXT to keep exact precision; timestamps as
//! RFC 3339 TEXT. Three tables: `session_configs`, `session_states`
//! (one row per operator) and the append-only `trade_records`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Activation, StateStore};
use crate::types::{
    HaltReason, OperatorId, SessionConfig, SessionState, Side, StoreError, TradeRecord,
};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and ensure the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        info!(url, "SQLite store ready");
        Ok(store)
    }

    /// Private in-memory database. A single connection that is never
    /// recycled, so the data lives as long as the store.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_configs (
                operator_id TEXT PRIMARY KEY,
                total_liquidity TEXT NOT NULL,
                trade_pct TEXT NOT NULL,
                interval_secs INTEGER NOT NULL,
                slippage_bps INTEGER NOT NULL,
                min_notional TEXT NOT NULL,
                max_position TEXT,
                max_trades INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_states (
                operator_id TEXT PRIMARY KEY,
                active INTEGER NOT NULL DEFAULT 0,
                trades_executed INTEGER NOT NULL DEFAULT 0,
                spent_notional TEXT NOT NULL DEFAULT '0',
                received_quote TEXT NOT NULL DEFAULT '0',
                base_position_delta TEXT NOT NULL DEFAULT '0',
                cycle_position INTEGER NOT NULL DEFAULT 0 CHECK (cycle_position BETWEEN 0 AND 3),
                halt_reason TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                stopped_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                operator_id TEXT NOT NULL,
                side TEXT NOT NULL CHECK (side IN ('BUY', 'SELL')),
                amount_in TEXT NOT NULL,
                amount_out TEXT NOT NULL,
                tx_id TEXT NOT NULL UNIQUE,
                timestamp TEXT NOT NULL,
                gas_used INTEGER NOT NULL,
                execution_price TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_trade_records_operator ON trade_records(operator_id, seq DESC)",
        )
        .execute(&self.pool)
        .await?;

        debug!("SQLite schema ensured");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn corrupt(table: &'static str, message: impl ToString) -> StoreError {
    StoreError::Corrupt {
        table,
        message: message.to_string(),
    }
}

fn decimal(row: &SqliteRow, table: &'static str, col: &str) -> Result<Decimal, StoreError> {
    let raw: String = row.try_get(col)?;
    Decimal::from_str(&raw).map_err(|e| corrupt(table, format!("{col}={raw}: {e}")))
}

fn timestamp(raw: &str, table: &'static str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(table, format!("timestamp {raw}: {e}")))
}

fn opt_timestamp(
    row: &SqliteRow,
    table: &'static str,
    col: &str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|r| timestamp(&r, table)).transpose()
}

fn unsigned(row: &SqliteRow, table: &'static str, col: &str) -> Result<u64, StoreError> {
    let raw: i64 = row.try_get(col)?;
    u64::try_from(raw).map_err(|_| corrupt(table, format!("{col} is negative: {raw}")))
}

fn config_from_row(row: &SqliteRow) -> Result<SessionConfig, StoreError> {
    const T: &str = "session_configs";
    let max_position: Option<String> = row.try_get("max_position")?;
    let max_position = max_position
        .map(|raw| Decimal::from_str(&raw).map_err(|e| corrupt(T, e)))
        .transpose()?;
    let slippage: i64 = row.try_get("slippage_bps")?;

    Ok(SessionConfig {
        total_liquidity: decimal(row, T, "total_liquidity")?,
        trade_pct: decimal(row, T, "trade_pct")?,
        interval_secs: unsigned(row, T, "interval_secs")?,
        slippage_bps: u32::try_from(slippage).map_err(|e| corrupt(T, e))?,
        min_notional: decimal(row, T, "min_notional")?,
        max_position,
        max_trades: unsigned(row, T, "max_trades")?,
    })
}

fn state_from_row(row: &SqliteRow) -> Result<SessionState, StoreError> {
    const T: &str = "session_states";
    let cycle: i64 = row.try_get("cycle_position")?;
    let halt_reason: Option<String> = row.try_get("halt_reason")?;
    let halt_reason = halt_reason
        .map(|code| HaltReason::from_str(&code).map_err(|e| corrupt(T, e)))
        .transpose()?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(SessionState {
        active: row.try_get("active")?,
        trades_executed: unsigned(row, T, "trades_executed")?,
        spent_notional: decimal(row, T, "spent_notional")?,
        received_quote: decimal(row, T, "received_quote")?,
        base_position_delta: decimal(row, T, "base_position_delta")?,
        cycle_position: u8::try_from(cycle)
            .ok()
            .filter(|c| *c < 4)
            .ok_or_else(|| corrupt(T, format!("cycle_position out of range: {cycle}")))?,
        halt_reason,
        last_error: row.try_get("last_error")?,
        created_at: timestamp(&created_at, T)?,
        updated_at: timestamp(&updated_at, T)?,
        started_at: opt_timestamp(row, T, "started_at")?,
        stopped_at: opt_timestamp(row, T, "stopped_at")?,
    })
}

fn trade_from_row(row: &SqliteRow) -> Result<TradeRecord, StoreError> {
    const T: &str = "trade_records";
    let id: String = row.try_get("id")?;
    let side: String = row.try_get("side")?;
    let ts: String = row.try_get("timestamp")?;

    Ok(TradeRecord {
        id: Uuid::parse_str(&id).map_err(|e| corrupt(T, e))?,
        operator_id: row.try_get("operator_id")?,
        side: Side::from_str(&side).map_err(|e| corrupt(T, e))?,
        amount_in: decimal(row, T, "amount_in")?,
        amount_out: decimal(row, T, "amount_out")?,
        tx_id: row.try_get("tx_id")?,
        timestamp: timestamp(&ts, T)?,
        gas_used: unsigned(row, T, "gas_used")?,
        execution_price: decimal(row, T, "execution_price")?,
    })
}

const UPSERT_STATE: &str = r#"
    INSERT INTO session_states (
        operator_id, active, trades_executed, spent_notional, received_quote,
        base_position_delta, cycle_position, halt_reason, last_error,
        created_at, updated_at, started_at, stopped_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(operator_id) DO UPDATE SET
        active = excluded.active,
        trades_executed = excluded.trades_executed,
        spent_notional = excluded.spent_notional,
        received_quote = excluded.received_quote,
        base_position_delta = excluded.base_position_delta,
        cycle_position = excluded.cycle_position,
        halt_reason = excluded.halt_reason,
        last_error = excluded.last_error,
        updated_at = excluded.updated_at,
        started_at = excluded.started_at,
        stopped_at = excluded.stopped_at
"#;

#[async_trait]
impl StateStore for SqliteStore {
    async fn load_config(&self, operator: &str) -> Result<Option<SessionConfig>, StoreError> {
        let row = sqlx::query("SELECT * FROM session_configs WHERE operator_id = ?")
            .bind(operator)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(config_from_row).transpose()
    }

    async fn save_config(&self, operator: &str, config: &SessionConfig) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO session_configs (
                operator_id, total_liquidity, trade_pct, interval_secs, slippage_bps,
                min_notional, max_position, max_trades, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(operator_id) DO UPDATE SET
                total_liquidity = excluded.total_liquidity,
                trade_pct = excluded.trade_pct,
                interval_secs = excluded.interval_secs,
                slippage_bps = excluded.slippage_bps,
                min_notional = excluded.min_notional,
                max_position = excluded.max_position,
                max_trades = excluded.max_trades,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(operator)
        .bind(config.total_liquidity.to_string())
        .bind(config.trade_pct.to_string())
        .bind(config.interval_secs as i64)
        .bind(config.slippage_bps as i64)
        .bind(config.min_notional.to_string())
        .bind(config.max_position.map(|p| p.to_string()))
        .bind(config.max_trades as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_state(&self, operator: &str) -> Result<Option<SessionState>, StoreError> {
        let row = sqlx::query("SELECT * FROM session_states WHERE operator_id = ?")
            .bind(operator)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(state_from_row).transpose()
    }

    async fn save_state(&self, operator: &str, state: &SessionState) -> Result<(), StoreError> {
        sqlx::query(UPSERT_STATE)
            .bind(operator)
            .bind(state.active)
            .bind(state.trades_executed as i64)
            .bind(state.spent_notional.to_string())
            .bind(state.received_quote.to_string())
            .bind(state.base_position_delta.to_string())
            .bind(state.cycle_position as i64)
            .bind(state.halt_reason.map(|r| r.code()))
            .bind(state.last_error.as_deref())
            .bind(state.created_at.to_rfc3339())
            .bind(state.updated_at.to_rfc3339())
            .bind(state.started_at.map(|t| t.to_rfc3339()))
            .bind(state.stopped_at.map(|t| t.to_rfc3339()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_activate(&self, operator: &str, now: DateTime<Utc>) -> Result<Activation, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Writing first takes the database write lock for the whole check.
        sqlx::query(
            "INSERT OR IGNORE INTO session_states (operator_id, active, created_at, updated_at) VALUES (?, 0, ?, ?)",
        )
        .bind(operator)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let flipped = sqlx::query(
            r#"
            UPDATE session_states SET
                active = 1, trades_executed = 0, spent_notional = '0', received_quote = '0',
                base_position_delta = '0', cycle_position = 0, halt_reason = NULL,
                last_error = NULL, started_at = ?, stopped_at = NULL, updated_at = ?
            WHERE operator_id = ? AND active = 0
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(operator)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        let row = sqlx::query("SELECT * FROM session_states WHERE operator_id = ?")
            .bind(operator)
            .fetch_one(&mut *tx)
            .await?;
        let state = state_from_row(&row)?;
        tx.commit().await?;

        Ok(if flipped {
            Activation::Activated(state)
        } else {
            Activation::Resumable(state)
        })
    }

    async fn append_trade(&self, operator: &str, record: &TradeRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trade_records (
                id, operator_id, side, amount_in, amount_out, tx_id,
                timestamp, gas_used, execution_price
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(operator)
        .bind(record.side.to_string())
        .bind(record.amount_in.to_string())
        .bind(record.amount_out.to_string())
        .bind(&record.tx_id)
        .bind(record.timestamp.to_rfc3339())
        .bind(record.gas_used as i64)
        .bind(record.execution_price.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_trades(&self, operator: &str, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM trade_records WHERE operator_id = ? ORDER BY seq DESC LIMIT ?",
        )
        .bind(operator)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn active_operators(&self) -> Result<Vec<OperatorId>, StoreError> {
        let rows = sqlx::query(
            "SELECT operator_id FROM session_states WHERE active = 1 ORDER BY operator_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("operator_id").map_err(StoreError::from))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
