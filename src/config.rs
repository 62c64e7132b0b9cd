//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (the relayer API key) are referenced by env-var name in the
//! config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::time::Duration;

use crate::engine::retry::RetryPolicy;
use crate::engine::EngineSettings;
use crate::gateway::paper::PaperBook;
use crate::types::{OperatorId, SessionConfig};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    pub storage: StorageConfig,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Session configs written to the store at boot, keyed by operator.
    #[serde(default)]
    pub operators: BTreeMap<OperatorId, SessionConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub gateway_timeout_secs: u64,
    /// Native balance kept back for gas.
    pub gas_reserve: Decimal,
    pub notification_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            gateway_timeout_secs: 30,
            gas_reserve: dec!(0.005),
            notification_buffer: 256,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// sqlx SQLite URL, e.g. `sqlite://cadence.db`.
    pub database_url: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    Paper,
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub mode: GatewayMode,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub paper: PaperConfig,
}

/// Starting pool and wallet for paper mode.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PaperConfig {
    pub base_reserve: Decimal,
    pub quote_reserve: Decimal,
    pub base_balance: Decimal,
    pub quote_balance: Decimal,
    pub native_balance: Decimal,
    pub fee_bps: u32,
    pub gas_per_swap: u64,
    pub gas_price: Decimal,
}

impl Default for PaperConfig {
    fn default() -> Self {
        let book = PaperBook::default();
        Self {
            base_reserve: book.base_reserve,
            quote_reserve: book.quote_reserve,
            base_balance: book.base_balance,
            quote_balance: book.quote_balance,
            native_balance: book.native_balance,
            fee_bps: book.fee_bps,
            gas_per_swap: book.gas_per_swap,
            gas_price: book.gas_price,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
    /// Operator ids served by the API. Empty serves everyone.
    pub allowed_operators: Vec<OperatorId>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
            allowed_operators: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        for (operator, session) in &config.operators {
            session
                .validate()
                .with_context(|| format!("Invalid session config for operator {operator}"))?;
        }
        if config.gateway.mode == GatewayMode::Http && config.gateway.base_url.is_none() {
            anyhow::bail!("gateway.base_url is required when gateway.mode = \"http\"");
        }
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Relayer API key, if one is configured.
    pub fn gateway_api_key(&self) -> Result<Option<SecretString>> {
        self.gateway
            .api_key_env
            .as_deref()
            .map(|env| Self::resolve_env(env).map(SecretString::new))
            .transpose()
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let e = &self.engine;
        EngineSettings {
            retry: RetryPolicy {
                max_retries: e.max_retries,
                base_delay: Duration::from_millis(e.backoff_base_ms),
                max_delay: Duration::from_millis(e.backoff_max_ms),
            },
            gateway_timeout: Duration::from_secs(e.gateway_timeout_secs),
            gas_reserve: e.gas_reserve,
            notification_buffer: e.notification_buffer,
        }
    }

    pub fn paper_book(&self) -> PaperBook {
        let p = &self.gateway.paper;
        PaperBook {
            base_reserve: p.base_reserve,
            quote_reserve: p.quote_reserve,
            base_balance: p.base_balance,
            quote_balance: p.quote_balance,
            native_balance: p.native_balance,
            fee_bps: p.fee_bps,
            gas_per_swap: p.gas_per_swap,
            gas_price: p.gas_price,
        }
    }

    pub fn allowed_operators(&self) -> HashSet<OperatorId> {
        self.api.allowed_operators.iter().cloned().collect()
    }
}
