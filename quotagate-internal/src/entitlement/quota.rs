use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use serde::Serialize;
use tracing::{debug, warn};

use crate::entitlement::store::{EntitlementStore, ScanConsumption};
use crate::entitlement::{EntitlementRecord, SubscriptionStatus};
use crate::error::Error;
use crate::rate_limit::SlidingWindowRateLimiter;

/// Outcome of a single admission check.
///
/// Denials are ordinary values rather than errors: a rate-limited or
/// quota-exhausted caller is a healthy, expected case that the HTTP layer
/// maps to 429 / 403.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDecision {
    Allow {
        subscription_status: SubscriptionStatus,
        /// Free scans left after this one; `None` for paid tiers
        scans_remaining: Option<u32>,
    },
    Denied(DenialReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    RateLimited,
    QuotaExhausted,
}

/// Single admission point for metered actions.
///
/// Evaluates in strict order: rate limit first (cheap, in-process), then
/// entitlement. A rate-limited request must not touch storage at all, so a
/// flood of abusive traffic cannot translate into Redis load.
pub struct QuotaGate {
    store: EntitlementStore,
    rate_limiter: Arc<SlidingWindowRateLimiter>,
    free_scan_cap: u32,
}

impl QuotaGate {
    pub fn new(
        store: EntitlementStore,
        rate_limiter: Arc<SlidingWindowRateLimiter>,
        free_scan_cap: u32,
    ) -> Self {
        Self {
            store,
            rate_limiter,
            free_scan_cap,
        }
    }

    /// Admit or deny one scan for `user_id` arriving from `origin`.
    ///
    /// Read failures fail open: when the entitlement record cannot be
    /// fetched the user is treated as free-tier and the consume is still
    /// attempted, so a storage blip degrades to the most conservative
    /// entitlement instead of a hard outage. The consuming write itself
    /// fails loudly, because silently skipping it would hand out unmetered
    /// scans.
    pub async fn check_and_consume(
        &self,
        user_id: &str,
        origin: &str,
        now: Instant,
    ) -> Result<QuotaDecision, Error> {
        let rate_key = format!("{user_id}:{origin}");
        if !self.rate_limiter.allow(&rate_key, now) {
            counter!("quotagate_scans_denied_total", "reason" => "rate_limited").increment(1);
            return Ok(QuotaDecision::Denied(DenialReason::RateLimited));
        }

        let record = match self.store.get(user_id).await {
            Ok(Some(record)) => record,
            Ok(None) => EntitlementRecord::default_for(user_id),
            Err(e) => {
                warn!(
                    user_id,
                    "Entitlement read failed, treating user as free tier: {e}"
                );
                counter!("quotagate_entitlement_read_failures_total").increment(1);
                EntitlementRecord::default_for(user_id)
            }
        };

        if record.subscription_status.is_paid() {
            counter!("quotagate_scans_allowed_total", "tier" => "paid").increment(1);
            return Ok(QuotaDecision::Allow {
                subscription_status: record.subscription_status,
                scans_remaining: None,
            });
        }

        match self.store.consume_free_scan(user_id, self.free_scan_cap).await? {
            ScanConsumption::Granted { remaining } => {
                counter!("quotagate_scans_allowed_total", "tier" => "free").increment(1);
                Ok(QuotaDecision::Allow {
                    subscription_status: SubscriptionStatus::Free,
                    scans_remaining: Some(remaining),
                })
            }
            ScanConsumption::PaidTier {
                subscription_status,
            } => {
                // An activation landed between the read and the consume (or
                // the read failed open); the consume saw the paid record and
                // charged nothing. Its tier supersedes the stale read.
                debug!(user_id, "Entitlement upgraded mid-check");
                counter!("quotagate_scans_allowed_total", "tier" => "paid").increment(1);
                Ok(QuotaDecision::Allow {
                    subscription_status,
                    scans_remaining: None,
                })
            }
            ScanConsumption::Exhausted => {
                counter!("quotagate_scans_denied_total", "reason" => "quota_exhausted")
                    .increment(1);
                Ok(QuotaDecision::Denied(DenialReason::QuotaExhausted))
            }
        }
    }
}
