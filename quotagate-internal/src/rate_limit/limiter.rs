use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::debug;

use crate::rate_limit::RateLimitConfig;

/// In-process sliding-window rate limiter keyed by an opaque actor string.
///
/// Each key owns its own `Mutex<VecDeque<Instant>>`, so the prune-check-append
/// sequence is atomic per key without serializing unrelated keys behind a
/// global lock. State is process-local only; a restart degrades to fully
/// permissive, never to fully blocking.
pub struct SlidingWindowRateLimiter {
    windows: Arc<DashMap<String, Mutex<VecDeque<Instant>>>>,

    config: RateLimitConfig,

    /// Background eviction sweep handle
    sweep_handle: RwLock<Option<JoinHandle<()>>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            config,
            sweep_handle: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check whether a new action under `key` is permitted at `now`.
    ///
    /// Prunes timestamps older than the window, then appends `now` if and
    /// only if the remaining count is under `max_per_window`. A denied call
    /// records nothing, so denials never extend the window.
    // A poisoned Mutex means another thread panicked while holding the lock;
    // that is a catastrophic failure we do not recover from.
    #[expect(clippy::expect_used)]
    pub fn allow(&self, key: &str, now: Instant) -> bool {
        if !self.config.enabled {
            return true;
        }

        let window = Duration::from_secs(self.config.window_secs);
        let entry = self.windows.entry(key.to_string()).or_default();
        let mut stamps = entry.lock().expect("Mutex poisoned");

        // Strictly older than the window: an entry exactly one window old
        // still counts against the limit.
        while let Some(oldest) = stamps.front() {
            if now.duration_since(*oldest) > window {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() < self.config.max_per_window as usize {
            stamps.push_back(now);
            counter!("quotagate_rate_limit_allowed_total").increment(1);
            true
        } else {
            counter!("quotagate_rate_limit_denied_total").increment(1);
            false
        }
    }

    /// Drop every key whose window has fully expired at `now`.
    ///
    /// Returns the number of evicted keys. Called by the background sweeper;
    /// delayed eviction only affects memory, never correctness.
    pub fn sweep(&self, now: Instant) -> u64 {
        Self::sweep_windows(&self.windows, Duration::from_secs(self.config.window_secs), now)
    }

    #[expect(clippy::expect_used)]
    fn sweep_windows(
        windows: &DashMap<String, Mutex<VecDeque<Instant>>>,
        window: Duration,
        now: Instant,
    ) -> u64 {
        let mut evicted = 0u64;
        windows.retain(|_, stamps| {
            let mut stamps = stamps.lock().expect("Mutex poisoned");
            while let Some(oldest) = stamps.front() {
                if now.duration_since(*oldest) > window {
                    stamps.pop_front();
                } else {
                    break;
                }
            }
            if stamps.is_empty() {
                evicted += 1;
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Number of keys currently tracked (for tests and observability)
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Start the background eviction sweep
    pub async fn start_sweeper(&self) {
        let windows = Arc::clone(&self.windows);
        let window = Duration::from_secs(self.config.window_secs);
        let sweep_interval = Duration::from_secs(self.config.sweep_interval_secs);

        let handle = tokio::spawn(async move {
            let mut sweep_timer = interval(sweep_interval);

            loop {
                sweep_timer.tick().await;

                let evicted = Self::sweep_windows(&windows, window, Instant::now());
                if evicted > 0 {
                    counter!("quotagate_rate_limit_evicted_keys_total").increment(evicted);
                    debug!("Evicted {} idle rate limit keys", evicted);
                }
            }
        });

        *self.sweep_handle.write().await = Some(handle);
    }

    /// Stop the background eviction sweep
    pub async fn stop_sweeper(&self) {
        if let Some(handle) = self.sweep_handle.write().await.take() {
            handle.abort();
        }
    }
}

impl Drop for SlidingWindowRateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep_handle.get_mut().take() {
            handle.abort();
        }
    }
}
