//! Control API route handlers.
//!
//! All endpoints return JSON. Engine errors map to HTTP status codes in
//! `ApiError`; every operator-scoped route checks the allowlist first.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};

use crate::engine::{MarketSnapshot, SessionEngine, SessionStatus};
use crate::types::{
    ConfigError, EngineError, OperatorId, SessionConfig, TradeRecord,
};

const DEFAULT_TRADE_LIMIT: usize = 20;
const MAX_TRADE_LIMIT: usize = 500;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct ApiState {
    pub engine: Arc<SessionEngine>,
    /// Empty means every operator is served.
    pub allowed_operators: HashSet<OperatorId>,
}

impl ApiState {
    fn authorize(&self, operator: &str) -> Result<(), ApiError> {
        if self.allowed_operators.is_empty() || self.allowed_operators.contains(operator) {
            Ok(())
        } else {
            Err(EngineError::Unauthorized(operator.to_string()).into())
        }
    }
}

pub type AppState = Arc<ApiState>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub session: SessionStatus,
    pub market: MarketSnapshot,
}

#[derive(Debug, Deserialize)]
pub struct TradePctBody {
    pub trade_pct: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct IntervalBody {
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct TradesQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            EngineError::AlreadyActive(_) => (StatusCode::CONFLICT, "already_active"),
            EngineError::Config(ConfigError::Missing(_)) => {
                (StatusCode::BAD_REQUEST, "missing_config")
            }
            EngineError::Config(_) => (StatusCode::BAD_REQUEST, "invalid_config"),
            EngineError::Unauthorized(_) => (StatusCode::FORBIDDEN, "unauthorized"),
            EngineError::Store(e) => {
                error!(error = %e, "Store failure while serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, "store_error")
            }
        };
        let body = ErrorBody {
            error: code,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /api/operators/:id/status
pub async fn get_status(
    State(state): State<AppState>,
    Path(operator): Path<String>,
) -> ApiResult<StatusResponse> {
    state.authorize(&operator)?;
    let session = state.engine.status(&operator).await?;
    let market = state.engine.market_snapshot().await;
    Ok(Json(StatusResponse { session, market }))
}

/// POST /api/operators/:id/start
pub async fn start_session(
    State(state): State<AppState>,
    Path(operator): Path<String>,
) -> ApiResult<SessionStatus> {
    state.authorize(&operator)?;
    let status = state.engine.start(&operator).await?;
    info!(operator = %operator, "Session started via API");
    Ok(Json(status))
}

/// POST /api/operators/:id/stop
pub async fn stop_session(
    State(state): State<AppState>,
    Path(operator): Path<String>,
) -> ApiResult<SessionStatus> {
    state.authorize(&operator)?;
    Ok(Json(state.engine.stop(&operator).await?))
}

/// GET /api/operators/:id/config
pub async fn get_config(
    State(state): State<AppState>,
    Path(operator): Path<String>,
) -> ApiResult<SessionConfig> {
    state.authorize(&operator)?;
    state
        .engine
        .status(&operator)
        .await?
        .config
        .map(Json)
        .ok_or_else(|| EngineError::from(ConfigError::Missing(operator)).into())
}

/// PUT /api/operators/:id/config
pub async fn put_config(
    State(state): State<AppState>,
    Path(operator): Path<String>,
    Json(config): Json<SessionConfig>,
) -> ApiResult<SessionConfig> {
    state.authorize(&operator)?;
    Ok(Json(state.engine.configure(&operator, config).await?))
}

/// PATCH /api/operators/:id/config/trade-pct
pub async fn patch_trade_pct(
    State(state): State<AppState>,
    Path(operator): Path<String>,
    Json(body): Json<TradePctBody>,
) -> ApiResult<SessionConfig> {
    state.authorize(&operator)?;
    Ok(Json(
        state.engine.update_trade_pct(&operator, body.trade_pct).await?,
    ))
}

/// PATCH /api/operators/:id/config/interval
pub async fn patch_interval(
    State(state): State<AppState>,
    Path(operator): Path<String>,
    Json(body): Json<IntervalBody>,
) -> ApiResult<SessionConfig> {
    state.authorize(&operator)?;
    Ok(Json(
        state.engine.update_interval(&operator, body.interval_secs).await?,
    ))
}

/// GET /api/operators/:id/trades?limit=N
pub async fn get_trades(
    State(state): State<AppState>,
    Path(operator): Path<String>,
    Query(query): Query<TradesQuery>,
) -> ApiResult<Vec<TradeRecord>> {
    state.authorize(&operator)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TRADE_LIMIT)
        .min(MAX_TRADE_LIMIT);
    Ok(Json(state.engine.trades(&operator, limit).await?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StoreError;

    async fn status_of(err: EngineError) -> (StatusCode, serde_json::Value) {
        let resp = ApiError::from(err).into_response();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let (status, body) = status_of(EngineError::AlreadyActive("a".into())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_active");

        let (status, body) = status_of(ConfigError::Missing("a".into()).into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "missing_config");

        let (status, _) = status_of(ConfigError::ZeroMaxTrades.into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = status_of(EngineError::Unauthorized("m".into())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) =
            status_of(StoreError::Backend("disk full".into()).into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["message"].as_str().unwrap().contains("disk full"));
    }
}
