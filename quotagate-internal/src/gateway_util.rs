use std::sync::Arc;

use axum::extract::{rejection::JsonRejection, FromRequest, Json, Request};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use tracing::instrument;

use crate::config::Config;
use crate::entitlement::{EntitlementStore, QuotaGate};
use crate::error::{Error, ErrorDetails};
use crate::payment::webhook::SignatureVerifier;
use crate::payment::{PaymentClient, PriceTable};
use crate::rate_limit::SlidingWindowRateLimiter;
use crate::reconcile::{CheckoutReconciler, ReconciliationPolicy, WebhookReconciler};

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub entitlement_store: EntitlementStore,
    pub rate_limiter: Arc<SlidingWindowRateLimiter>,
    pub quota_gate: Arc<QuotaGate>,
    pub checkout_reconciler: CheckoutReconciler,
    pub webhook_reconciler: WebhookReconciler,
}
pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    /// Build production state from config plus environment secrets.
    ///
    /// Secrets are read here and nowhere else: `QUOTAGATE_REDIS_URL`,
    /// `QUOTAGATE_PAYMENT_API_KEY`, `QUOTAGATE_PAYMENT_WEBHOOK_SECRET`.
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let redis_url = non_empty_env("QUOTAGATE_REDIS_URL");
        let payment_api_key = non_empty_env("QUOTAGATE_PAYMENT_API_KEY").map(SecretString::from);
        let webhook_secret =
            non_empty_env("QUOTAGATE_PAYMENT_WEBHOOK_SECRET").map(SecretString::from);

        let entitlement_store = setup_entitlement_store(&config, redis_url).await?;
        let payment_client = setup_payment_client(&config, payment_api_key)?;
        let verifier = webhook_secret
            .map(|secret| SignatureVerifier::new(secret, config.payment.webhook_tolerance_secs));

        Ok(Self::with_components(
            config,
            entitlement_store,
            payment_client,
            verifier,
        ))
    }

    /// Assemble state from already-built components. Tests use this with the
    /// memory store and mock payment client.
    pub fn with_components(
        config: Arc<Config>,
        entitlement_store: EntitlementStore,
        payment_client: PaymentClient,
        verifier: Option<SignatureVerifier>,
    ) -> Self {
        let rate_limiter = Arc::new(SlidingWindowRateLimiter::new(config.rate_limit.clone()));
        let quota_gate = Arc::new(QuotaGate::new(
            entitlement_store.clone(),
            Arc::clone(&rate_limiter),
            config.quota.free_scan_cap,
        ));
        let prices = PriceTable::new(&config.payment);
        let policy = ReconciliationPolicy::new(entitlement_store.clone());
        let checkout_reconciler = CheckoutReconciler::new(
            payment_client.clone(),
            prices.clone(),
            policy.clone(),
            entitlement_store.clone(),
        );
        let webhook_reconciler = WebhookReconciler::new(
            verifier,
            payment_client,
            prices,
            policy,
            entitlement_store.clone(),
        );

        Self {
            config,
            entitlement_store,
            rate_limiter,
            quota_gate,
            checkout_reconciler,
            webhook_reconciler,
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

pub async fn setup_entitlement_store(
    config: &Config,
    redis_url: Option<String>,
) -> Result<EntitlementStore, Error> {
    match redis_url {
        Some(url) => {
            let store =
                EntitlementStore::new_redis(&url, config.storage.redis_timeout()).await?;
            tracing::info!("Entitlement store connected to Redis");
            Ok(store)
        }
        None => {
            tracing::warn!(
                "QUOTAGATE_REDIS_URL is not set, entitlement state is in-memory and will not survive a restart"
            );
            Ok(EntitlementStore::new_memory())
        }
    }
}

pub fn setup_payment_client(
    config: &Config,
    api_key: Option<SecretString>,
) -> Result<PaymentClient, Error> {
    match api_key {
        Some(api_key) => {
            tracing::info!(
                base_url = config.payment.api_base_url,
                "Payment provider client initialized"
            );
            PaymentClient::new_production(&config.payment, api_key)
        }
        None => {
            tracing::warn!(
                "QUOTAGATE_PAYMENT_API_KEY is not set, using the mock payment client; checkout verification will fail for real sessions"
            );
            Ok(PaymentClient::new_mock())
        }
    }
}

/// Custom Axum extractor that validates the JSON body and deserializes it into a custom type
///
/// When this extractor is present, we don't check if the `Content-Type` header is `application/json`,
/// and instead simply assume that the request body is a JSON object.
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    #[instrument(skip_all, level = "trace", name = "StructuredJson::from_request")]
    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        // Retrieve the request body as Bytes before deserializing it
        let bytes = bytes::Bytes::from_request(req, state).await.map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: format!("{} ({})", e, e.status()),
            })
        })?;

        // Convert the entire body into `serde_json::Value`
        let value = Json::<serde_json::Value>::from_bytes(&bytes)
            .map_err(|e| {
                Error::new(ErrorDetails::JsonRequest {
                    message: format!("{} ({})", e, e.status()),
                })
            })?
            .0;

        // Now use `serde_path_to_error::deserialize` to attempt deserialization into `T`
        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: e.to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}
