pub mod webhook;

use dashmap::DashMap;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::warn;

use crate::config::PaymentConfig;
use crate::entitlement::SubscriptionStatus;
use crate::error::{Error, ErrorDetails};

/// Checkout session as reported by the payment provider.
///
/// Only the fields the reconciler consumes; the provider sends far more.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    /// Provider-side payment state, e.g. "paid" or "unpaid"
    pub payment_status: String,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    /// Opaque user id we attached when the checkout was created
    pub client_reference_id: Option<String>,
}

impl CheckoutSession {
    pub fn is_paid(&self) -> bool {
        self.payment_status == "paid"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer: Option<String>,
    #[serde(default)]
    pub items: SubscriptionItems,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    pub price: Price,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Price {
    pub id: String,
}

impl ProviderSubscription {
    /// Price id of the first subscription item. Our plans are all
    /// single-item, so anything beyond the first is ignored.
    pub fn price_id(&self) -> Option<&str> {
        self.items.data.first().map(|item| item.price.id.as_str())
    }
}

/// Maps provider price ids onto subscription tiers.
#[derive(Debug, Clone)]
pub struct PriceTable {
    monthly: String,
    annual: String,
}

impl PriceTable {
    pub fn new(config: &PaymentConfig) -> Self {
        Self {
            monthly: config.price_id_monthly.clone(),
            annual: config.price_id_annual.clone(),
        }
    }

    /// Resolve a price id to a tier.
    ///
    /// An unrecognized id still granted a completed payment, so we assign
    /// the monthly tier rather than strand a paying customer on free; the
    /// warning is the operator's cue to update the price table.
    pub fn resolve(&self, price_id: &str) -> SubscriptionStatus {
        if price_id == self.annual {
            SubscriptionStatus::Annual
        } else if price_id == self.monthly {
            SubscriptionStatus::Monthly
        } else {
            warn!(
                price_id,
                "Unknown price id from payment provider, defaulting to monthly tier"
            );
            SubscriptionStatus::Monthly
        }
    }
}

/// Payment provider client.
///
/// An enum rather than a trait object so the production and mock variants
/// can be constructed and matched without dynamic dispatch; tests use the
/// mock variant with canned sessions and subscriptions.
#[derive(Debug, Clone)]
pub enum PaymentClient {
    Production(ProductionPaymentClient),
    Mock(MockPaymentClient),
}

impl PaymentClient {
    pub fn new_production(config: &PaymentConfig, api_key: SecretString) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| {
                Error::new(ErrorDetails::AppState {
                    message: format!("Failed to build payment HTTP client: {e}"),
                })
            })?;
        Ok(PaymentClient::Production(ProductionPaymentClient {
            http_client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key,
        }))
    }

    pub fn new_mock() -> Self {
        PaymentClient::Mock(MockPaymentClient::default())
    }

    pub async fn get_checkout_session(&self, session_id: &str) -> Result<CheckoutSession, Error> {
        match self {
            PaymentClient::Production(client) => client.get_checkout_session(session_id).await,
            PaymentClient::Mock(client) => client.get_checkout_session(session_id),
        }
    }

    pub async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<ProviderSubscription, Error> {
        match self {
            PaymentClient::Production(client) => client.get_subscription(subscription_id).await,
            PaymentClient::Mock(client) => client.get_subscription(subscription_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProductionPaymentClient {
    http_client: Client,
    base_url: String,
    api_key: SecretString,
}

impl ProductionPaymentClient {
    async fn get_checkout_session(&self, session_id: &str) -> Result<CheckoutSession, Error> {
        let url = format!("{}/checkout/sessions/{session_id}", self.base_url);
        self.get_json("checkout session fetch", &url).await
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<ProviderSubscription, Error> {
        let url = format!("{}/subscriptions/{subscription_id}", self.base_url);
        self.get_json("subscription fetch", &url).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        url: &str,
    ) -> Result<T, Error> {
        let response = self
            .http_client
            .get(url)
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::new(ErrorDetails::PaymentProviderTimeout {
                        operation: operation.to_string(),
                    })
                } else {
                    Error::new(ErrorDetails::PaymentProvider {
                        message: format!("{operation} failed: {e}"),
                        status_code: e.status(),
                    })
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::new(ErrorDetails::PaymentProvider {
                message: format!("{operation} failed: {body}"),
                status_code: Some(status),
            }));
        }

        response.json::<T>().await.map_err(|e| {
            Error::new(ErrorDetails::PaymentProvider {
                message: format!("{operation} returned malformed JSON: {e}"),
                status_code: None,
            })
        })
    }
}

/// In-memory stand-in for the provider, used by tests.
///
/// Clones share the underlying maps, so sessions inserted through any
/// handle are visible to every consumer of the client.
#[derive(Debug, Clone, Default)]
pub struct MockPaymentClient {
    sessions: std::sync::Arc<DashMap<String, CheckoutSession>>,
    subscriptions: std::sync::Arc<DashMap<String, ProviderSubscription>>,
}

impl MockPaymentClient {
    pub fn insert_session(&self, session: CheckoutSession) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn insert_subscription(&self, subscription: ProviderSubscription) {
        self.subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    fn get_checkout_session(&self, session_id: &str) -> Result<CheckoutSession, Error> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| {
                Error::new(ErrorDetails::PaymentProvider {
                    message: format!("No such checkout session: {session_id}"),
                    status_code: Some(reqwest::StatusCode::NOT_FOUND),
                })
            })
    }

    fn get_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription, Error> {
        self.subscriptions
            .get(subscription_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| {
                Error::new(ErrorDetails::PaymentProvider {
                    message: format!("No such subscription: {subscription_id}"),
                    status_code: Some(reqwest::StatusCode::NOT_FOUND),
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price_table() -> PriceTable {
        PriceTable {
            monthly: "price_monthly_123".to_string(),
            annual: "price_annual_456".to_string(),
        }
    }

    #[test]
    fn test_price_table_resolves_known_tiers() {
        let table = price_table();
        assert_eq!(
            table.resolve("price_monthly_123"),
            SubscriptionStatus::Monthly
        );
        assert_eq!(table.resolve("price_annual_456"), SubscriptionStatus::Annual);
    }

    #[test]
    fn test_price_table_defaults_unknown_to_monthly() {
        let table = price_table();
        assert_eq!(table.resolve("price_mystery"), SubscriptionStatus::Monthly);
    }

    #[test]
    fn test_checkout_session_paid_flag() -> Result<(), serde_json::Error> {
        let session: CheckoutSession = serde_json::from_str(
            r#"{
                "id": "cs_test_1",
                "payment_status": "paid",
                "customer": "cus_1",
                "subscription": "sub_1",
                "mode": "subscription"
            }"#,
        )?;
        assert!(session.is_paid());
        assert_eq!(session.subscription.as_deref(), Some("sub_1"));
        Ok(())
    }

    #[test]
    fn test_subscription_price_id_takes_first_item() -> Result<(), serde_json::Error> {
        let subscription: ProviderSubscription = serde_json::from_str(
            r#"{
                "id": "sub_1",
                "customer": "cus_1",
                "items": {"data": [{"price": {"id": "price_monthly_123"}}]}
            }"#,
        )?;
        assert_eq!(subscription.price_id(), Some("price_monthly_123"));
        Ok(())
    }

    #[tokio::test]
    async fn test_mock_client_unknown_session_is_provider_error() {
        let client = PaymentClient::new_mock();
        let result = client.get_checkout_session("cs_missing").await;
        assert!(result.is_err());
    }
}
