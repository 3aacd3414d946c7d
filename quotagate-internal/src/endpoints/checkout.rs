use axum::extract::State;
use axum::response::Json;
use serde::{Deserialize, Serialize};

use crate::entitlement::SubscriptionStatus;
use crate::error::Error;
use crate::gateway_util::{AppState, StructuredJson};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyCheckoutRequest {
    pub session_id: String,
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyCheckoutResponse {
    pub subscription_status: SubscriptionStatus,
}

/// Handler for `POST /v1/checkout/verify`.
///
/// Called by the frontend when the user lands back from the provider's
/// checkout page. Confirms the session with the provider and activates the
/// entitlement before responding, so the very next scan sees the paid tier.
pub async fn verify_checkout_handler(
    State(app_state): AppState,
    StructuredJson(request): StructuredJson<VerifyCheckoutRequest>,
) -> Result<Json<VerifyCheckoutResponse>, Error> {
    let subscription_status = app_state
        .checkout_reconciler
        .verify(&request.session_id, &request.user_id)
        .await?;

    Ok(Json(VerifyCheckoutResponse {
        subscription_status,
    }))
}
