//! Daemon configuration.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use dexfin_connectors::endpoints::{REQUEST_TIMEOUT_MS, REST_URL, WS_URL};
use dexfin_connectors::{
    apply_capacity_overrides, default_rate_limits, BookSyncConfig, ConnectorConfig, LimitId,
    RateLimit,
};
use dexfin_domain::{ApiCredentials, TradingPair};
use zeroize::Zeroizing;

use crate::error::{DaemonError, DaemonResult};

/// Instruments tracked when `DEXFIN_TRADING_PAIRS` is unset.
pub const DEFAULT_TRADING_PAIRS: &str = "BTC-USDT";

// =============================================================================
// Configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Exchange endpoints and credentials
    pub exchange: ExchangeConfig,

    /// Market data configuration
    pub market_data: MarketDataConfig,

    /// Rate-limit capacity overrides, applied on top of the default table
    pub rate_limit_overrides: Vec<(LimitId, u32)>,

    /// Environment (test, development, production)
    pub environment: Environment,
}

/// Exchange endpoints and credentials.
#[derive(Clone)]
pub struct ExchangeConfig {
    /// REST base URL
    pub rest_url: String,
    /// Streaming URL
    pub ws_url: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// API key (private endpoints disabled when absent)
    pub api_key: Option<String>,
    /// API secret
    pub api_secret: Option<Zeroizing<String>>,
}

/// Market data configuration.
#[derive(Debug, Clone)]
pub struct MarketDataConfig {
    /// Instruments to track
    pub trading_pairs: Vec<TradingPair>,
    /// Silence after which a book is marked stale
    pub book_stale_after: Duration,
    /// Clock resync period
    pub clock_sync_interval: Duration,
    /// Top-of-book log period
    pub report_interval: Duration,
}

/// Environment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Test environment
    Test,
    /// Development environment
    Development,
    /// Production environment
    Production,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DaemonResult<Self> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DaemonResult<Self> {
        let environment = load_environment(&lookup)?;
        let exchange = load_exchange_config(&lookup)?;
        let market_data = load_market_data_config(&lookup)?;
        let rate_limit_overrides = match lookup("DEXFIN_RATE_LIMIT_OVERRIDES") {
            Some(raw) => parse_rate_limit_overrides(&raw)?,
            None => Vec::new(),
        };

        let config = Self {
            exchange,
            market_data,
            rate_limit_overrides,
            environment,
        };
        // Reject overrides for limits the table doesn't define
        config.rate_limits()?;
        Ok(config)
    }

    /// Create test configuration.
    pub fn test() -> Self {
        Self {
            exchange: ExchangeConfig {
                rest_url: "http://127.0.0.1:0".to_string(),
                ws_url: "ws://127.0.0.1:0".to_string(),
                request_timeout: Duration::from_secs(2),
                api_key: None,
                api_secret: None,
            },
            market_data: MarketDataConfig {
                trading_pairs: default_trading_pairs(),
                book_stale_after: Duration::from_secs(5),
                clock_sync_interval: Duration::from_secs(60),
                report_interval: Duration::from_secs(1),
            },
            rate_limit_overrides: Vec::new(),
            environment: Environment::Test,
        }
    }

    /// Connector settings derived from this configuration.
    pub fn connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            rest_url: self.exchange.rest_url.clone(),
            ws_url: self.exchange.ws_url.clone(),
            request_timeout: self.exchange.request_timeout,
        }
    }

    /// Book synchronizer settings derived from this configuration.
    pub fn book_sync_config(&self) -> BookSyncConfig {
        BookSyncConfig {
            stale_after: self.market_data.book_stale_after,
            ..BookSyncConfig::default()
        }
    }

    /// Default rate-limit table with the configured overrides applied.
    pub fn rate_limits(&self) -> DaemonResult<Vec<RateLimit>> {
        let mut limits = default_rate_limits();
        apply_capacity_overrides(&mut limits, &self.rate_limit_overrides)?;
        Ok(limits)
    }
}

impl ExchangeConfig {
    /// Credentials, when both halves are configured.
    pub fn credentials(&self) -> Option<ApiCredentials> {
        match (&self.api_key, &self.api_secret) {
            (Some(key), Some(secret)) => Some(ApiCredentials::new(key.clone(), secret.as_str())),
            _ => None,
        }
    }
}

impl fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("rest_url", &self.rest_url)
            .field("ws_url", &self.ws_url)
            .field("request_timeout", &self.request_timeout)
            .field("api_key", &self.api_key)
            .field("api_secret", &self.api_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig {
                rest_url: REST_URL.to_string(),
                ws_url: WS_URL.to_string(),
                request_timeout: Duration::from_millis(REQUEST_TIMEOUT_MS),
                api_key: None,
                api_secret: None,
            },
            market_data: MarketDataConfig {
                trading_pairs: default_trading_pairs(),
                book_stale_after: Duration::from_secs(30),
                clock_sync_interval: Duration::from_secs(300),
                report_interval: Duration::from_secs(10),
            },
            rate_limit_overrides: Vec::new(),
            environment: Environment::Development,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

// =============================================================================
// Loaders
// =============================================================================

fn load_environment(lookup: &impl Fn(&str) -> Option<String>) -> DaemonResult<Environment> {
    let env_str = lookup("DEXFIN_ENV").unwrap_or_else(|| "development".to_string());

    match env_str.to_lowercase().as_str() {
        "test" => Ok(Environment::Test),
        "development" | "dev" => Ok(Environment::Development),
        "production" | "prod" => Ok(Environment::Production),
        other => Err(DaemonError::Config(format!(
            "Invalid DEXFIN_ENV: {}. Expected: test, development, production",
            other
        ))),
    }
}

fn load_exchange_config(lookup: &impl Fn(&str) -> Option<String>) -> DaemonResult<ExchangeConfig> {
    let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let api_key = non_empty("DEXFIN_API_KEY");
    let api_secret = non_empty("DEXFIN_SECRET_KEY").map(Zeroizing::new);
    if api_key.is_some() != api_secret.is_some() {
        return Err(DaemonError::Config(
            "DEXFIN_API_KEY and DEXFIN_SECRET_KEY must be set together".to_string(),
        ));
    }

    let timeout_ms = load_number(lookup, "DEXFIN_REQUEST_TIMEOUT_MS", REQUEST_TIMEOUT_MS)?;

    Ok(ExchangeConfig {
        rest_url: non_empty("DEXFIN_REST_URL").unwrap_or_else(|| REST_URL.to_string()),
        ws_url: non_empty("DEXFIN_WS_URL").unwrap_or_else(|| WS_URL.to_string()),
        request_timeout: Duration::from_millis(timeout_ms),
        api_key,
        api_secret,
    })
}

fn load_market_data_config(
    lookup: &impl Fn(&str) -> Option<String>,
) -> DaemonResult<MarketDataConfig> {
    let trading_pairs = match lookup("DEXFIN_TRADING_PAIRS") {
        Some(raw) => parse_trading_pairs(&raw)?,
        None => default_trading_pairs(),
    };

    Ok(MarketDataConfig {
        trading_pairs,
        book_stale_after: Duration::from_secs(load_number(lookup, "DEXFIN_BOOK_STALE_SECS", 30)?),
        clock_sync_interval: Duration::from_secs(load_number(lookup, "DEXFIN_CLOCK_SYNC_SECS", 300)?),
        report_interval: Duration::from_secs(load_number(lookup, "DEXFIN_BOOK_REPORT_SECS", 10)?),
    })
}

/// Positive integer variable, `default` when unset.
fn load_number(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> DaemonResult<u64> {
    match lookup(key) {
        Some(val) => match u64::from_str(val.trim()) {
            Ok(0) | Err(_) => Err(DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            Ok(n) => Ok(n),
        },
        None => Ok(default),
    }
}

fn default_trading_pairs() -> Vec<TradingPair> {
    parse_trading_pairs(DEFAULT_TRADING_PAIRS).unwrap_or_default()
}

/// `BTC-USDT,ETH-USDT` → pairs, duplicates dropped.
fn parse_trading_pairs(raw: &str) -> DaemonResult<Vec<TradingPair>> {
    let mut pairs: Vec<TradingPair> = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let pair = TradingPair::from_str(item)
            .map_err(|e| DaemonError::Config(format!("Invalid DEXFIN_TRADING_PAIRS entry {}: {}", item, e)))?;
        if !pairs.contains(&pair) {
            pairs.push(pair);
        }
    }

    if pairs.is_empty() {
        return Err(DaemonError::Config("DEXFIN_TRADING_PAIRS is empty".to_string()));
    }
    Ok(pairs)
}

/// `ORDERS=5,DEPTH=20` → capacity overrides.
fn parse_rate_limit_overrides(raw: &str) -> DaemonResult<Vec<(LimitId, u32)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| {
            let invalid =
                || DaemonError::Config(format!("Invalid DEXFIN_RATE_LIMIT_OVERRIDES entry: {}", item));
            let (name, capacity) = item.split_once('=').ok_or_else(invalid)?;
            let id = LimitId::from_str(name)?;
            let capacity = u32::from_str(capacity.trim()).map_err(|_| invalid())?;
            Ok((id, capacity))
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> DaemonResult<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.exchange.rest_url, REST_URL);
        assert_eq!(config.exchange.request_timeout, Duration::from_secs(10));
        assert_eq!(config.environment, Environment::Development);
        assert!(config.exchange.credentials().is_none());
    }

    #[test]
    fn test_test_config() {
        let config = Config::test();

        assert_eq!(config.environment, Environment::Test);
        assert_eq!(config.market_data.trading_pairs.len(), 1);
    }

    #[test]
    fn test_empty_environment_uses_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.exchange.ws_url, WS_URL);
        assert_eq!(config.market_data.book_stale_after, Duration::from_secs(30));
        assert_eq!(config.market_data.trading_pairs[0].to_string(), "BTC-USDT");
        assert!(config.rate_limit_overrides.is_empty());
    }

    #[test]
    fn test_full_environment() {
        let config = load(&[
            ("DEXFIN_ENV", "prod"),
            ("DEXFIN_API_KEY", "key"),
            ("DEXFIN_SECRET_KEY", "secret"),
            ("DEXFIN_REST_URL", "http://localhost:9000"),
            ("DEXFIN_TRADING_PAIRS", "btc-usdt, ETH-USDT,BTC-USDT"),
            ("DEXFIN_REQUEST_TIMEOUT_MS", "2500"),
            ("DEXFIN_BOOK_STALE_SECS", "12"),
            ("DEXFIN_CLOCK_SYNC_SECS", "60"),
            ("DEXFIN_RATE_LIMIT_OVERRIDES", "orders=5, DEPTH=20"),
        ])
        .unwrap();

        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.exchange.rest_url, "http://localhost:9000");
        assert_eq!(config.exchange.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.market_data.trading_pairs.len(), 2);
        assert_eq!(config.book_sync_config().stale_after, Duration::from_secs(12));
        assert_eq!(config.market_data.clock_sync_interval, Duration::from_secs(60));
        assert_eq!(
            config.rate_limit_overrides,
            vec![(LimitId::Orders, 5), (LimitId::Depth, 20)]
        );

        let credentials = config.exchange.credentials().unwrap();
        assert_eq!(credentials.api_key(), "key");

        let limits = config.rate_limits().unwrap();
        let orders = limits.iter().find(|l| l.id == LimitId::Orders).unwrap();
        assert_eq!(orders.capacity, 5);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(load(&[("DEXFIN_ENV", "staging")]).is_err());
        assert!(load(&[("DEXFIN_BOOK_STALE_SECS", "0")]).is_err());
        assert!(load(&[("DEXFIN_REQUEST_TIMEOUT_MS", "soon")]).is_err());
        assert!(load(&[("DEXFIN_TRADING_PAIRS", "BTCUSDT")]).is_err());
        assert!(load(&[("DEXFIN_TRADING_PAIRS", " , ")]).is_err());
        assert!(load(&[("DEXFIN_API_KEY", "key")]).is_err());
    }

    #[test]
    fn test_unknown_rate_limit_name_is_rejected() {
        let result = load(&[("DEXFIN_RATE_LIMIT_OVERRIDES", "WARP_SPEED=10")]);

        assert!(matches!(result, Err(DaemonError::Connector(_))));
        assert!(load(&[("DEXFIN_RATE_LIMIT_OVERRIDES", "ORDERS")]).is_err());
        assert!(load(&[("DEXFIN_RATE_LIMIT_OVERRIDES", "ORDERS=-1")]).is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = load(&[("DEXFIN_API_KEY", "key"), ("DEXFIN_SECRET_KEY", "hunter2")]).unwrap();

        let printed = format!("{:?}", config);

        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_environment_display() {
        assert_eq!(Environment::Test.to_string(), "test");
        assert_eq!(Environment::Development.to_string(), "development");
        assert_eq!(Environment::Production.to_string(), "production");
    }
}
