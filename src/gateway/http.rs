//! HTTP relayer gateway.
//!
//! Talks JSON to a signing relayer that owns the wallet key, nonce
//! management, gas pricing and token approvals. The relayer exposes:
//!
//! - `GET  /balance/{asset}` → `{"amount": "12.5"}`
//! - `GET  /price`           → `{"price": "2.01"}` (quote per base)
//! - `POST /swap`            → `{"amount_in", "amount_out", "tx_id", "gas_used"}`
//!
//! Rejections come back as `{"error": "<code>", "message": "..."}`. Transport
//! failures, timeouts, 429 and 5xx are transient; everything else the relayer
//! refuses is permanent.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ExchangeGateway, SwapReceipt, SwapRequest};
use crate::types::{Asset, GatewayError};

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    amount: Decimal,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct HttpGateway {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpGateway {
    /// Create a relayer client. `timeout` bounds every request, including
    /// swap confirmation.
    pub fn new(base_url: &str, api_key: Option<SecretString>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("CADENCE/0.1.0 (dex-session-engine)")
            .build()
            .context("Failed to build HTTP client for relayer gateway")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key.expose_secret()),
            None => req,
        }
    }

    /// Send a request and decode a JSON body, classifying every failure.
    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, GatewayError> {
        let resp = self.authorize(req).send().await.map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = classify_rejection(status, &body);
            warn!(status = %status, kind = err.kind(), "Relayer rejected request");
            return Err(err);
        }

        resp.json::<T>()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("malformed relayer response: {e}")))
    }
}

/// Map a reqwest transport error to a gateway error kind.
fn classify_transport(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout(err.to_string())
    } else {
        GatewayError::Unavailable(err.to_string())
    }
}

/// Map a non-2xx relayer response to a gateway error kind.
pub(crate) fn classify_rejection(status: StatusCode, body: &str) -> GatewayError {
    let parsed: ErrorResponse = serde_json::from_str(body).unwrap_or(ErrorResponse {
        error: String::new(),
        message: body.to_string(),
    });
    let message = if parsed.message.is_empty() {
        format!("HTTP {status}")
    } else {
        parsed.message
    };

    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        return GatewayError::Timeout(message);
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return GatewayError::Unavailable(message);
    }

    match parsed.error.as_str() {
        "insufficient_allowance" => GatewayError::InsufficientAllowance(message),
        _ => GatewayError::Reverted(message),
    }
}

#[async_trait]
impl ExchangeGateway for HttpGateway {
    async fn get_balance(&self, asset: Asset) -> Result<Decimal, GatewayError> {
        let resp: BalanceResponse = self
            .send(self.http.get(self.url(&format!("balance/{asset}"))))
            .await?;
        debug!(asset = %asset, amount = %resp.amount, "Balance fetched");
        Ok(resp.amount)
    }

    async fn get_spot_price(&self) -> Result<Decimal, GatewayError> {
        let resp: PriceResponse = self.send(self.http.get(self.url("price"))).await?;
        debug!(price = %resp.price, "Spot price fetched");
        Ok(resp.price)
    }

    async fn swap(&self, request: SwapRequest) -> Result<SwapReceipt, GatewayError> {
        debug!(request = %request, "Submitting swap to relayer");
        self.send(self.http.post(self.url("swap")).json(&request)).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
