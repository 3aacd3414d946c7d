//! Helpers for constructing gateway state in tests.

use std::sync::Arc;

use crate::config::Config;
use crate::entitlement::EntitlementStore;
use crate::gateway_util::AppStateData;
use crate::payment::{MockPaymentClient, PaymentClient};

/// App state wired to the in-memory store and a mock payment client.
pub fn mock_app_state(config: Config) -> AppStateData {
    AppStateData::with_components(
        Arc::new(config),
        EntitlementStore::new_memory(),
        PaymentClient::new_mock(),
        None,
    )
}

/// Like [`mock_app_state`], but hands back the mock payment client so tests
/// can seed checkout sessions and subscriptions.
pub fn mock_app_state_with_payment(config: Config) -> (AppStateData, MockPaymentClient) {
    let mock = MockPaymentClient::default();
    let state = AppStateData::with_components(
        Arc::new(config),
        EntitlementStore::new_memory(),
        PaymentClient::Mock(mock.clone()),
        None,
    );
    (state, mock)
}
