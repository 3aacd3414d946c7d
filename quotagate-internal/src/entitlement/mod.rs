pub mod quota;
pub mod store;

pub use quota::{DenialReason, QuotaDecision, QuotaGate};
pub use store::{EntitlementStore, ScanConsumption};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subscription tier as reported by the payment provider.
///
/// Binary entitlement: paid tiers are unlimited, `free` is metered against
/// the configured scan cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Free,
    Monthly,
    Annual,
}

impl SubscriptionStatus {
    pub fn is_paid(&self) -> bool {
        matches!(self, SubscriptionStatus::Monthly | SubscriptionStatus::Annual)
    }

    /// Stable string form used as the Redis hash field value
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Free => "free",
            SubscriptionStatus::Monthly => "monthly",
            SubscriptionStatus::Annual => "annual",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "free" => Some(SubscriptionStatus::Free),
            "monthly" => Some(SubscriptionStatus::Monthly),
            "annual" => Some(SubscriptionStatus::Annual),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable entitlement record, one per user.
///
/// `scan_count` is tier-dependent: under `free` it counts consumed quota
/// toward the cap; under paid tiers it is informational only and reset on
/// activation. `updated_at` exists for observability, never for conflict
/// resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementRecord {
    pub user_id: String,
    pub subscription_status: SubscriptionStatus,
    pub scan_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl EntitlementRecord {
    /// The implicit record for a user who has never been written: absence is
    /// equivalent to a free tier with nothing consumed, so the read path
    /// never special-cases "new user".
    pub fn default_for(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            subscription_status: SubscriptionStatus::Free,
            scan_count: 0,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_status_round_trip() {
        for status in [
            SubscriptionStatus::Free,
            SubscriptionStatus::Monthly,
            SubscriptionStatus::Annual,
        ] {
            assert_eq!(SubscriptionStatus::from_str_opt(status.as_str()), Some(status));
        }
        assert_eq!(SubscriptionStatus::from_str_opt("lifetime"), None);
    }

    #[test]
    fn test_only_paid_tiers_are_paid() {
        assert!(!SubscriptionStatus::Free.is_paid());
        assert!(SubscriptionStatus::Monthly.is_paid());
        assert!(SubscriptionStatus::Annual.is_paid());
    }

    #[test]
    fn test_default_record_is_free_with_no_usage() {
        let record = EntitlementRecord::default_for("user_abc");
        assert_eq!(record.user_id, "user_abc");
        assert_eq!(record.subscription_status, SubscriptionStatus::Free);
        assert_eq!(record.scan_count, 0);
    }
}
