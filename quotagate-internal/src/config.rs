use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::rate_limit::RateLimitConfig;

/// Top-level gateway configuration, loaded from a TOML file.
///
/// Secrets (payment provider API key, webhook signing secret, Redis URL) are
/// deliberately absent here; they come from the environment at startup so a
/// checked-in config file can never leak credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub payment: PaymentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Socket address to bind to; defaults to 0.0.0.0:3000 when unset
    pub bind_address: Option<SocketAddr>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    /// Number of metered actions a free-tier user may consume before the
    /// gate denies with `QuotaExhausted`. Configuration, not a constant:
    /// the product has shipped with different caps.
    #[serde(default = "default_free_scan_cap")]
    pub free_scan_cap: u32,
}

fn default_free_scan_cap() -> u32 {
    1
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_scan_cap: default_free_scan_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaymentConfig {
    /// Base URL of the payment provider's REST API
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Price identifier the provider reports for the monthly plan
    #[serde(default)]
    pub price_id_monthly: String,

    /// Price identifier the provider reports for the annual plan
    #[serde(default)]
    pub price_id_annual: String,

    /// Timeout for each provider round-trip, in milliseconds. The checkout
    /// verify path has a human waiting on it, so this must stay small.
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum accepted age of a webhook signature timestamp, in seconds
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,
}

fn default_api_base_url() -> String {
    "https://api.stripe.com/v1".to_string()
}

fn default_provider_timeout_ms() -> u64 {
    5000
}

fn default_webhook_tolerance_secs() -> u64 {
    300
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            price_id_monthly: String::new(),
            price_id_annual: String::new(),
            timeout_ms: default_provider_timeout_ms(),
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
        }
    }
}

impl PaymentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Timeout for each Redis operation, in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub redis_timeout_ms: u64,
}

fn default_redis_timeout_ms() -> u64 {
    500
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            redis_timeout_ms: default_redis_timeout_ms(),
        }
    }
}

impl StorageConfig {
    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_timeout_ms)
    }
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file {}: {e}", path.display()),
            })
        })?;
        Self::load_from_toml(&contents)
    }

    pub fn load_from_toml(contents: &str) -> Result<Self, Error> {
        toml::from_str(contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config: {e}"),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.quota.free_scan_cap, 1);
        assert_eq!(config.payment.timeout_ms, 5000);
        assert_eq!(config.payment.webhook_tolerance_secs, 300);
        assert_eq!(config.storage.redis_timeout_ms, 500);
        assert!(config.gateway.bind_address.is_none());
        assert!(!config.gateway.debug);
    }

    #[test]
    fn test_config_load_from_toml() -> Result<(), Error> {
        let config = Config::load_from_toml(
            r#"
            [gateway]
            bind_address = "127.0.0.1:8080"
            debug = true

            [quota]
            free_scan_cap = 3

            [rate_limit]
            max_per_window = 20
            window_secs = 30

            [payment]
            price_id_monthly = "price_monthly_123"
            price_id_annual = "price_annual_456"
            timeout_ms = 2500
            "#,
        )?;

        assert_eq!(config.quota.free_scan_cap, 3);
        assert_eq!(config.rate_limit.max_per_window, 20);
        assert_eq!(config.rate_limit.window_secs, 30);
        assert_eq!(config.payment.price_id_monthly, "price_monthly_123");
        assert_eq!(config.payment.timeout_ms, 2500);
        assert_eq!(
            config.gateway.bind_address.map(|a| a.port()),
            Some(8080)
        );
        Ok(())
    }

    #[test]
    fn test_config_rejects_unknown_fields() {
        let result = Config::load_from_toml(
            r#"
            [quota]
            free_scan_cap = 1
            free_scam_cap = 2
            "#,
        );
        assert!(result.is_err());
    }
}
