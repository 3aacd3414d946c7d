use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::json;

use crate::entitlement::{DenialReason, QuotaDecision, SubscriptionStatus};
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppState;

#[derive(Debug, Serialize)]
struct ScanResponse {
    allowed: bool,
    subscription_status: SubscriptionStatus,
    /// Free scans left after this one; absent for paid tiers
    #[serde(skip_serializing_if = "Option::is_none")]
    scans_remaining: Option<u32>,
}

/// Handler for `POST /v1/scans`: admit or deny one metered scan.
///
/// Denials are successful responses with non-2xx codes, 429 for rate
/// limiting and 403 for an exhausted quota, each carrying a machine-readable
/// `code` so clients can branch without string-matching the message.
pub async fn scan_handler(
    State(app_state): AppState,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::new(ErrorDetails::UserIdRequired))?;
    let origin = request_origin(&headers);

    let decision = app_state
        .quota_gate
        .check_and_consume(user_id, origin, Instant::now())
        .await?;

    let response = match decision {
        QuotaDecision::Allow {
            subscription_status,
            scans_remaining,
        } => Json(ScanResponse {
            allowed: true,
            subscription_status,
            scans_remaining,
        })
        .into_response(),
        QuotaDecision::Denied(DenialReason::RateLimited) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Too many scan requests, retry later",
                "code": "rate_limited",
            })),
        )
            .into_response(),
        QuotaDecision::Denied(DenialReason::QuotaExhausted) => (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "Free scan quota exhausted, upgrade to continue",
                "code": "quota_exhausted",
                "scans_remaining": 0,
            })),
        )
            .into_response(),
    };
    Ok(response)
}

/// Best-effort request origin for per-origin rate limiting.
///
/// The gateway sits behind a proxy in production, so the peer address is the
/// proxy; the first `x-forwarded-for` entry is the real client.
fn request_origin(headers: &HeaderMap) -> &str {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("direct")
}
