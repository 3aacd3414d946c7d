pub mod limiter;

pub use limiter::SlidingWindowRateLimiter;

use serde::{Deserialize, Serialize};

/// Configuration for the in-process sliding-window rate limiter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Length of the trailing window, in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Maximum permitted actions per key within the window
    #[serde(default = "default_max_per_window")]
    pub max_per_window: u32,

    /// Interval between background eviction sweeps, in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_per_window() -> u32 {
    10
}

fn default_sweep_interval_secs() -> u64 {
    120
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            window_secs: default_window_secs(),
            max_per_window: default_max_per_window(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_config_defaults() {
        let config = RateLimitConfig::default();
        assert!(config.enabled);
        assert_eq!(config.window_secs, 60);
        assert_eq!(config.max_per_window, 10);
        assert_eq!(config.sweep_interval_secs, 120);
    }
}
