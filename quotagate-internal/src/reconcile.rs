use chrono::Utc;
use metrics::counter;
use tracing::{info, warn};

use crate::entitlement::{EntitlementStore, SubscriptionStatus};
use crate::error::{Error, ErrorDetails};
use crate::payment::webhook::{SignatureVerifier, WebhookEvent};
use crate::payment::{CheckoutSession, PaymentClient, PriceTable};

/// How entitlement writes from payment signals are applied.
///
/// Last-writer-wins: both the checkout verify path and the webhook path may
/// observe the same provider state, and applying either repeatedly converges
/// on the same record, so neither path needs to coordinate with the other.
#[derive(Clone)]
pub struct ReconciliationPolicy {
    store: EntitlementStore,
}

impl ReconciliationPolicy {
    pub fn new(store: EntitlementStore) -> Self {
        Self { store }
    }

    pub async fn activate(
        &self,
        user_id: &str,
        status: SubscriptionStatus,
    ) -> Result<(), Error> {
        self.store.apply_activation(user_id, status).await?;
        info!(user_id, status = %status, "Entitlement activated");
        counter!("quotagate_activations_total").increment(1);
        Ok(())
    }

    /// Cancel the subscription of whichever user owns `customer_id`.
    ///
    /// An unknown customer is not an error: the cancellation may belong to a
    /// checkout we never verified, and there is nothing to revoke.
    pub async fn cancel_by_customer(&self, customer_id: &str) -> Result<bool, Error> {
        match self.store.lookup_user_by_customer(customer_id).await? {
            Some(user_id) => {
                self.store.apply_cancellation(&user_id).await?;
                info!(user_id, customer_id, "Entitlement cancelled");
                counter!("quotagate_cancellations_total").increment(1);
                Ok(true)
            }
            None => {
                warn!(customer_id, "Cancellation for unknown customer, ignoring");
                Ok(false)
            }
        }
    }
}

/// Synchronous reconciliation path: the frontend lands back from checkout
/// holding a session id and asks us to verify it with the provider.
#[derive(Clone)]
pub struct CheckoutReconciler {
    payment: PaymentClient,
    prices: PriceTable,
    policy: ReconciliationPolicy,
    store: EntitlementStore,
}

impl CheckoutReconciler {
    pub fn new(
        payment: PaymentClient,
        prices: PriceTable,
        policy: ReconciliationPolicy,
        store: EntitlementStore,
    ) -> Self {
        Self {
            payment,
            prices,
            policy,
            store,
        }
    }

    /// Verify `session_id` with the provider and activate `user_id` if paid.
    ///
    /// Fetches live provider state rather than trusting anything the client
    /// sent; the session id alone proves nothing.
    pub async fn verify(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<SubscriptionStatus, Error> {
        let session = self.payment.get_checkout_session(session_id).await?;

        if !session.is_paid() {
            return Err(Error::new(ErrorDetails::PaymentNotCompleted {
                session_id: session_id.to_string(),
            }));
        }

        if let Some(reference) = &session.client_reference_id {
            if reference != user_id {
                warn!(
                    session_id,
                    user_id,
                    reference,
                    "Checkout session references a different user"
                );
            }
        }

        let status = self.resolve_tier(&session).await;

        if let Some(customer_id) = &session.customer {
            self.store.record_customer(customer_id, user_id).await?;
        }
        self.policy.activate(user_id, status).await?;

        Ok(status)
    }

    async fn resolve_tier(&self, session: &CheckoutSession) -> SubscriptionStatus {
        let Some(subscription_id) = &session.subscription else {
            warn!(
                session_id = session.id,
                "Paid session has no subscription, defaulting to monthly tier"
            );
            return SubscriptionStatus::Monthly;
        };
        match self.payment.get_subscription(subscription_id).await {
            Ok(subscription) => match subscription.price_id() {
                Some(price_id) => self.prices.resolve(price_id),
                None => {
                    warn!(
                        subscription_id,
                        "Subscription has no price items, defaulting to monthly tier"
                    );
                    SubscriptionStatus::Monthly
                }
            },
            Err(e) => {
                // The payment itself is confirmed; tier resolution failing
                // must not block activation.
                warn!(
                    subscription_id,
                    "Could not resolve subscription tier, defaulting to monthly: {e}"
                );
                SubscriptionStatus::Monthly
            }
        }
    }
}

/// What the webhook reconciler did with an accepted delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    ActivationApplied,
    CancellationApplied,
    Ignored,
}

/// Asynchronous reconciliation path: provider-initiated event deliveries.
///
/// Signature failure is the only rejection. Everything past the signature
/// check is acknowledged, including payloads we cannot parse or act on;
/// redelivering those would just fail again.
#[derive(Clone)]
pub struct WebhookReconciler {
    verifier: Option<std::sync::Arc<SignatureVerifier>>,
    payment: PaymentClient,
    prices: PriceTable,
    policy: ReconciliationPolicy,
    store: EntitlementStore,
}

impl WebhookReconciler {
    pub fn new(
        verifier: Option<SignatureVerifier>,
        payment: PaymentClient,
        prices: PriceTable,
        policy: ReconciliationPolicy,
        store: EntitlementStore,
    ) -> Self {
        if verifier.is_none() {
            warn!("No webhook signing secret configured, accepting unsigned deliveries");
        }
        Self {
            verifier: verifier.map(std::sync::Arc::new),
            payment,
            prices,
            policy,
            store,
        }
    }

    pub async fn handle(
        &self,
        payload: &[u8],
        sig_header: Option<&str>,
    ) -> Result<WebhookOutcome, Error> {
        if let Some(verifier) = &self.verifier {
            let sig_header = sig_header.ok_or_else(|| {
                Error::new(ErrorDetails::InvalidSignature {
                    message: "signature header absent".to_string(),
                })
            })?;
            verifier.verify(payload, sig_header, Utc::now())?;
        }

        let event = match WebhookEvent::parse(payload) {
            Ok(event) => event,
            Err(e) => {
                // Authenticated but unparseable; acknowledge so the
                // provider stops redelivering it.
                warn!("Dropping malformed webhook payload: {e}");
                counter!("quotagate_webhooks_ignored_total").increment(1);
                return Ok(WebhookOutcome::Ignored);
            }
        };

        match event.event_type.as_str() {
            "checkout.session.completed" => self.handle_checkout_completed(&event).await,
            "customer.subscription.deleted" => self.handle_subscription_deleted(&event).await,
            other => {
                counter!("quotagate_webhooks_ignored_total").increment(1);
                tracing::debug!(event_type = other, "Ignoring unhandled webhook event type");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn handle_checkout_completed(
        &self,
        event: &WebhookEvent,
    ) -> Result<WebhookOutcome, Error> {
        let session: CheckoutSession =
            match serde_json::from_value(event.data.object.clone()) {
                Ok(session) => session,
                Err(e) => {
                    warn!("Malformed checkout session in webhook, ignoring: {e}");
                    counter!("quotagate_webhooks_ignored_total").increment(1);
                    return Ok(WebhookOutcome::Ignored);
                }
            };

        if !session.is_paid() {
            counter!("quotagate_webhooks_ignored_total").increment(1);
            return Ok(WebhookOutcome::Ignored);
        }
        let Some(user_id) = session.client_reference_id.clone() else {
            warn!(
                session_id = session.id,
                "Completed checkout carries no user reference, ignoring"
            );
            counter!("quotagate_webhooks_ignored_total").increment(1);
            return Ok(WebhookOutcome::Ignored);
        };

        let status = self.resolve_tier(&session).await;

        if let Some(customer_id) = &session.customer {
            self.store.record_customer(customer_id, &user_id).await?;
        }
        self.policy.activate(&user_id, status).await?;
        Ok(WebhookOutcome::ActivationApplied)
    }

    async fn handle_subscription_deleted(
        &self,
        event: &WebhookEvent,
    ) -> Result<WebhookOutcome, Error> {
        let customer_id = event
            .data
            .object
            .get("customer")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let Some(customer_id) = customer_id else {
            warn!("Subscription deletion carries no customer id, ignoring");
            counter!("quotagate_webhooks_ignored_total").increment(1);
            return Ok(WebhookOutcome::Ignored);
        };

        if self.policy.cancel_by_customer(&customer_id).await? {
            Ok(WebhookOutcome::CancellationApplied)
        } else {
            counter!("quotagate_webhooks_ignored_total").increment(1);
            Ok(WebhookOutcome::Ignored)
        }
    }

    async fn resolve_tier(&self, session: &CheckoutSession) -> SubscriptionStatus {
        let Some(subscription_id) = &session.subscription else {
            return SubscriptionStatus::Monthly;
        };
        match self.payment.get_subscription(subscription_id).await {
            Ok(subscription) => subscription
                .price_id()
                .map_or(SubscriptionStatus::Monthly, |id| self.prices.resolve(id)),
            Err(e) => {
                warn!(
                    subscription_id,
                    "Could not resolve subscription tier from webhook, defaulting to monthly: {e}"
                );
                SubscriptionStatus::Monthly
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::{MockPaymentClient, Price, ProviderSubscription, SubscriptionItem, SubscriptionItems};
    use crate::payment::webhook::sign_payload;
    use secrecy::SecretString;

    fn prices() -> PriceTable {
        PriceTable::new(&crate::config::PaymentConfig {
            price_id_monthly: "price_m".to_string(),
            price_id_annual: "price_a".to_string(),
            ..Default::default()
        })
    }

    fn mock_with_paid_session(price_id: &str) -> PaymentClient {
        let mock = MockPaymentClient::default();
        mock.insert_session(CheckoutSession {
            id: "cs_1".to_string(),
            payment_status: "paid".to_string(),
            customer: Some("cus_1".to_string()),
            subscription: Some("sub_1".to_string()),
            client_reference_id: Some("user-1".to_string()),
        });
        mock.insert_subscription(ProviderSubscription {
            id: "sub_1".to_string(),
            customer: Some("cus_1".to_string()),
            items: SubscriptionItems {
                data: vec![SubscriptionItem {
                    price: Price {
                        id: price_id.to_string(),
                    },
                }],
            },
        });
        PaymentClient::Mock(mock)
    }

    fn checkout_reconciler(payment: PaymentClient, store: EntitlementStore) -> CheckoutReconciler {
        CheckoutReconciler::new(
            payment,
            prices(),
            ReconciliationPolicy::new(store.clone()),
            store,
        )
    }

    #[tokio::test]
    async fn test_verify_paid_session_activates_annual() -> Result<(), Error> {
        let store = EntitlementStore::new_memory();
        let reconciler = checkout_reconciler(mock_with_paid_session("price_a"), store.clone());

        let status = reconciler.verify("cs_1", "user-1").await?;
        assert_eq!(status, SubscriptionStatus::Annual);

        let record = store.get("user-1").await?;
        assert_eq!(
            record.map(|r| r.subscription_status),
            Some(SubscriptionStatus::Annual)
        );
        assert_eq!(
            store.lookup_user_by_customer("cus_1").await?,
            Some("user-1".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_verify_unpaid_session_is_payment_required() -> Result<(), Error> {
        let store = EntitlementStore::new_memory();
        let mock = MockPaymentClient::default();
        mock.insert_session(CheckoutSession {
            id: "cs_1".to_string(),
            payment_status: "unpaid".to_string(),
            customer: None,
            subscription: None,
            client_reference_id: None,
        });
        let reconciler = checkout_reconciler(PaymentClient::Mock(mock), store.clone());

        let result = reconciler.verify("cs_1", "user-1").await;
        assert!(result.is_err());
        // No entitlement write on failure
        assert!(store.get("user-1").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_verify_is_idempotent() -> Result<(), Error> {
        let store = EntitlementStore::new_memory();
        let reconciler = checkout_reconciler(mock_with_paid_session("price_m"), store.clone());

        let first = reconciler.verify("cs_1", "user-1").await?;
        let second = reconciler.verify("cs_1", "user-1").await?;
        assert_eq!(first, second);
        assert_eq!(first, SubscriptionStatus::Monthly);
        Ok(())
    }

    #[tokio::test]
    async fn test_verify_unknown_price_falls_back_to_monthly() -> Result<(), Error> {
        let store = EntitlementStore::new_memory();
        let reconciler =
            checkout_reconciler(mock_with_paid_session("price_retired"), store.clone());

        let status = reconciler.verify("cs_1", "user-1").await?;
        assert_eq!(status, SubscriptionStatus::Monthly);
        Ok(())
    }

    fn webhook_reconciler(
        secret: Option<&str>,
        payment: PaymentClient,
        store: EntitlementStore,
    ) -> WebhookReconciler {
        WebhookReconciler::new(
            secret.map(|s| SignatureVerifier::new(SecretString::from(s), 300)),
            payment,
            prices(),
            ReconciliationPolicy::new(store.clone()),
            store,
        )
    }

    #[tokio::test]
    async fn test_webhook_rejects_bad_signature() {
        let reconciler = webhook_reconciler(
            Some("whsec_real"),
            PaymentClient::new_mock(),
            EntitlementStore::new_memory(),
        );
        let payload = br#"{"type":"checkout.session.completed","data":{"object":{}}}"#;
        let header = sign_payload("whsec_forged", chrono::Utc::now().timestamp(), payload);

        assert!(reconciler.handle(payload, Some(&header)).await.is_err());
        assert!(reconciler.handle(payload, None).await.is_err());
    }

    #[tokio::test]
    async fn test_webhook_checkout_completed_activates_user() -> Result<(), Error> {
        let store = EntitlementStore::new_memory();
        let reconciler =
            webhook_reconciler(Some("whsec_test"), mock_with_paid_session("price_a"), store.clone());

        let payload = br#"{"id":"evt_1","type":"checkout.session.completed","data":{"object":{"id":"cs_1","payment_status":"paid","customer":"cus_1","subscription":"sub_1","client_reference_id":"user-1"}}}"#;
        let header = sign_payload("whsec_test", chrono::Utc::now().timestamp(), payload);

        let outcome = reconciler.handle(payload, Some(&header)).await?;
        assert_eq!(outcome, WebhookOutcome::ActivationApplied);

        let record = store.get("user-1").await?;
        assert_eq!(
            record.map(|r| r.subscription_status),
            Some(SubscriptionStatus::Annual)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_webhook_subscription_deleted_cancels_known_customer() -> Result<(), Error> {
        let store = EntitlementStore::new_memory();
        store
            .apply_activation("user-1", SubscriptionStatus::Monthly)
            .await?;
        store.record_customer("cus_1", "user-1").await?;
        let reconciler =
            webhook_reconciler(None, PaymentClient::new_mock(), store.clone());

        let payload =
            br#"{"type":"customer.subscription.deleted","data":{"object":{"id":"sub_1","customer":"cus_1"}}}"#;
        let outcome = reconciler.handle(payload, None).await?;
        assert_eq!(outcome, WebhookOutcome::CancellationApplied);

        let record = store.get("user-1").await?;
        assert_eq!(
            record.map(|r| r.subscription_status),
            Some(SubscriptionStatus::Free)
        );
        Ok(())
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_webhook_unknown_customer_cancellation_is_acknowledged() -> Result<(), Error> {
        let reconciler = webhook_reconciler(
            None,
            PaymentClient::new_mock(),
            EntitlementStore::new_memory(),
        );
        let payload =
            br#"{"type":"customer.subscription.deleted","data":{"object":{"customer":"cus_ghost"}}}"#;

        assert_eq!(
            reconciler.handle(payload, None).await?,
            WebhookOutcome::Ignored
        );
        assert!(logs_contain("Cancellation for unknown customer"));
        Ok(())
    }

    #[tokio::test]
    async fn test_webhook_unhandled_and_malformed_payloads_are_acknowledged() -> Result<(), Error> {
        let reconciler = webhook_reconciler(
            None,
            PaymentClient::new_mock(),
            EntitlementStore::new_memory(),
        );

        assert_eq!(
            reconciler
                .handle(br#"{"type":"invoice.paid","data":{"object":{}}}"#, None)
                .await?,
            WebhookOutcome::Ignored
        );
        assert_eq!(
            reconciler.handle(b"not json at all", None).await?,
            WebhookOutcome::Ignored
        );
        Ok(())
    }
}
