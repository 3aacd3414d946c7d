use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use bytes::Bytes;
use serde_json::{json, Value};

use crate::error::Error;
use crate::gateway_util::AppState;

pub const SIGNATURE_HEADER: &str = "x-payment-signature";

/// Handler for `POST /v1/webhooks/payment`.
///
/// Takes the raw body; signature verification covers the exact bytes the
/// provider sent, so nothing may parse or re-serialize them first.
pub async fn payment_webhook_handler(
    State(app_state): AppState,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, Error> {
    let sig_header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    app_state
        .webhook_reconciler
        .handle(&body, sig_header)
        .await?;

    Ok(Json(json!({ "received": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::entitlement::SubscriptionStatus;
    use crate::testing::mock_app_state;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_unsigned_delivery_accepted_without_configured_secret() -> Result<(), Error> {
        // mock state carries no signing secret
        let state = mock_app_state(Config::default());
        let body = Bytes::from_static(br#"{"type":"invoice.paid","data":{"object":{}}}"#);

        let response =
            payment_webhook_handler(State(state), HeaderMap::new(), body).await?;
        assert_eq!(response.0, json!({ "received": true }));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancellation_webhook_downgrades_user() -> Result<(), Error> {
        let state = mock_app_state(Config::default());
        state
            .entitlement_store
            .apply_activation("user-1", SubscriptionStatus::Monthly)
            .await?;
        state
            .entitlement_store
            .record_customer("cus_1", "user-1")
            .await?;

        let body = Bytes::from_static(
            br#"{"type":"customer.subscription.deleted","data":{"object":{"customer":"cus_1"}}}"#,
        );
        payment_webhook_handler(State(state.clone()), HeaderMap::new(), body).await?;

        let record = state.entitlement_store.get("user-1").await?;
        assert_eq!(
            record.map(|r| r.subscription_status),
            Some(SubscriptionStatus::Free)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_signed_state_rejects_missing_header() {
        use crate::entitlement::EntitlementStore;
        use crate::gateway_util::AppStateData;
        use crate::payment::webhook::SignatureVerifier;
        use crate::payment::PaymentClient;
        use secrecy::SecretString;
        use std::sync::Arc;

        let state = AppStateData::with_components(
            Arc::new(Config::default()),
            EntitlementStore::new_memory(),
            PaymentClient::new_mock(),
            Some(SignatureVerifier::new(SecretString::from("whsec_x"), 300)),
        );
        let body = Bytes::from_static(b"{}");

        let result = payment_webhook_handler(State(state), HeaderMap::new(), body).await;
        let Err(error) = result else {
            return assert!(result.is_err());
        };
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
    }
}
