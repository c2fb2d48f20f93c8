use config::{Config, Environment, File};
use serde::Deserialize;

use crate::execution::ExecutorConfig;
use crate::models::Mode;
use crate::reconcile::ReconcileConfig;
use crate::risk::RiskLimits;
use crate::{BotError, Result};

/// Service configuration: optional TOML file plus `PERPBOT__`-prefixed
/// environment overrides (e.g. `PERPBOT__EXCHANGE__API_KEY`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub exchange: ExchangeSettings,
    pub trading: TradingSettings,
    pub reconcile: ReconcileConfig,
    pub database: DatabaseSettings,
    /// Strategies ensured running at boot, in addition to whatever the
    /// persistence layer restores.
    pub strategies: Vec<StrategySeed>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    /// Hard per-call timeout; a timed-out call is classified Transient.
    pub request_timeout_secs: u64,
    pub rate_limit_per_min: u32,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            base_url: "https://fapi.binance.com".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            request_timeout_secs: 5,
            rate_limit_per_min: 1200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingSettings {
    pub taker_fee_rate: f64,
    /// Default tick interval for seeded strategies.
    pub default_interval_secs: u64,
    pub max_order_notional: f64,
    pub max_concurrent_strategies: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            taker_fee_rate: 0.0005,
            default_interval_secs: 15,
            max_order_notional: 1000.0,
            max_concurrent_strategies: 20,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/perpbot".to_string(),
        }
    }
}

/// A strategy the service keeps running, declared in config.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategySeed {
    pub symbol: String,
    pub mode: Mode,
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl AppConfig {
    /// Load from an optional TOML file and the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        } else {
            builder = builder.add_source(File::with_name("perpbot").required(false));
        }

        builder = builder.add_source(Environment::with_prefix("PERPBOT").separator("__"));

        builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| BotError::Config(e.to_string()))
    }

    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            max_order_notional: self.trading.max_order_notional,
            max_concurrent_strategies: self.trading.max_concurrent_strategies,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            taker_fee_rate: self.trading.taker_fee_rate,
            max_retries: self.trading.max_retries,
            retry_backoff_ms: self.trading.retry_backoff_ms,
            limits: self.risk_limits(),
        }
    }
}
