//! Stripe client configuration and the Stripe-backed payment provider

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use stripe::{
    CheckoutSession, CheckoutSessionMode, Client, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData, CreateCustomer,
    Customer, CustomerId, ListCustomers, RequestStrategy, Subscription, SubscriptionId,
    UpdateSubscription,
};
use teamride_shared::TenantId;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    CheckoutMode, CheckoutSessionHandle, CheckoutSessionRequest, CreateCustomerRequest,
    PaymentProvider, METADATA_PLAN_ID, METADATA_TENANT_ID,
};

/// Maximum number of retries for transient provider failures
const MAX_RETRIES: usize = 3;

/// Initial backoff between retries
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Upper bound for a single backoff
const RETRY_MAX_DELAY: Duration = Duration::from_secs(3);

/// Environment variable prefix for per-plan price ids, e.g. `STRIPE_PRICE_CLUB`
const PRICE_ENV_PREFIX: &str = "STRIPE_PRICE_";

/// Configuration for Stripe billing
#[derive(Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price id per paid plan id
    pub price_ids: HashMap<String, String>,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"[redacted]")
            .field("webhook_secret", &"[redacted]")
            .field("price_ids", &self.price_ids)
            .finish()
    }
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let price_ids = std::env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix(PRICE_ENV_PREFIX)
                    .filter(|plan| !plan.is_empty() && !value.trim().is_empty())
                    .map(|plan| (plan.to_lowercase(), value.trim().to_string()))
            })
            .collect();

        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            price_ids,
        })
    }

    /// Get price ID for a plan
    pub fn price_id_for_plan(&self, plan_id: &str) -> Option<&str> {
        self.price_ids
            .get(&plan_id.to_lowercase())
            .map(String::as_str)
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: &StripeConfig) -> Self {
        Self {
            client: Client::new(&config.secret_key),
        }
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// A client whose mutating requests carry the given idempotency key
    fn idempotent(&self, key: &str) -> Client {
        self.client
            .clone()
            .with_strategy(RequestStrategy::Idempotent(key.to_string()))
    }
}

/// Customers are tagged with the tenant id when created
fn is_tenant_customer(customer: &Customer, tenant: &str) -> bool {
    customer
        .metadata
        .as_ref()
        .and_then(|metadata| metadata.get(METADATA_TENANT_ID))
        .is_some_and(|value| value == tenant)
}

fn retry_strategy() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
        .max_delay(RETRY_MAX_DELAY)
        .take(MAX_RETRIES)
        .map(jitter)
}

fn should_retry(operation: &'static str) -> impl FnMut(&BillingError) -> bool {
    move |e: &BillingError| {
        let retry = e.is_retryable();
        if retry {
            tracing::debug!(operation, error = %e, "Transient Stripe error - will retry");
        }
        retry
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn find_customer(&self, tenant_id: TenantId, email: &str) -> BillingResult<Option<String>> {
        let mut params = ListCustomers::new();
        params.email = Some(email);
        params.limit = Some(10);

        let customers = RetryIf::spawn(
            retry_strategy(),
            || {
                let client = self.client.clone();
                let params = params.clone();
                async move { Customer::list(&client, &params).await.map_err(BillingError::from) }
            },
            should_retry("list_customers"),
        )
        .await?;

        // The same email may be billing contact for several tenants
        let tenant = tenant_id.to_string();
        Ok(customers
            .data
            .into_iter()
            .find(|c| is_tenant_customer(c, &tenant))
            .map(|c| c.id.to_string()))
    }

    async fn create_customer(&self, request: CreateCustomerRequest) -> BillingResult<String> {
        let client = self.idempotent(&request.idempotency_key);

        let mut metadata = HashMap::new();
        metadata.insert(METADATA_TENANT_ID.to_string(), request.tenant_id.to_string());
        metadata.insert("platform".to_string(), "teamride".to_string());

        let params = CreateCustomer {
            email: Some(&request.email),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = RetryIf::spawn(
            retry_strategy(),
            || {
                let client = client.clone();
                let params = params.clone();
                async move { Customer::create(&client, params).await.map_err(BillingError::from) }
            },
            should_retry("create_customer"),
        )
        .await?;

        tracing::info!(
            tenant_id = %request.tenant_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer.id.to_string())
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<CheckoutSessionHandle> {
        let client = self.idempotent(&request.idempotency_key);

        let customer_id = request
            .customer_ref
            .parse::<CustomerId>()
            .map_err(|e| BillingError::PaymentProvider(format!("Invalid customer ID: {}", e)))?;

        let mut metadata = HashMap::new();
        metadata.insert(METADATA_TENANT_ID.to_string(), request.tenant_id.to_string());
        metadata.insert(METADATA_PLAN_ID.to_string(), request.plan_id.clone());

        let mode = match request.mode {
            CheckoutMode::Payment => CheckoutSessionMode::Payment,
            CheckoutMode::Subscription => CheckoutSessionMode::Subscription,
        };

        // Renewal invoices only carry the subscription's metadata, not the session's
        let subscription_data = match request.mode {
            CheckoutMode::Subscription => Some(CreateCheckoutSessionSubscriptionData {
                metadata: Some(metadata.clone()),
                ..Default::default()
            }),
            CheckoutMode::Payment => None,
        };

        let tenant_ref = request.tenant_id.to_string();
        let params = CreateCheckoutSession {
            customer: Some(customer_id),
            mode: Some(mode),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(request.price_ref.clone()),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(&request.success_url),
            cancel_url: Some(&request.cancel_url),
            client_reference_id: Some(&tenant_ref),
            metadata: Some(metadata),
            subscription_data,
            ..Default::default()
        };

        let session = RetryIf::spawn(
            retry_strategy(),
            || {
                let client = client.clone();
                let params = params.clone();
                async move {
                    CheckoutSession::create(&client, params)
                        .await
                        .map_err(BillingError::from)
                }
            },
            should_retry("create_checkout_session"),
        )
        .await?;

        let redirect_url = session.url.ok_or_else(|| {
            BillingError::PaymentProvider("Checkout session URL missing".to_string())
        })?;

        tracing::info!(
            tenant_id = %request.tenant_id,
            session_id = %session.id,
            plan_id = %request.plan_id,
            mode = ?request.mode,
            "Created checkout session"
        );

        Ok(CheckoutSessionHandle {
            session_ref: session.id.to_string(),
            redirect_url,
        })
    }

    async fn cancel_at_period_end(&self, subscription_ref: &str) -> BillingResult<()> {
        let subscription_id = subscription_ref
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::PaymentProvider(format!("Invalid subscription ID: {}", e)))?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(true),
            ..Default::default()
        };

        RetryIf::spawn(
            retry_strategy(),
            || {
                let client = self.client.clone();
                let subscription_id = subscription_id.clone();
                let params = params.clone();
                async move {
                    Subscription::update(&client, &subscription_id, params)
                        .await
                        .map_err(BillingError::from)
                }
            },
            should_retry("cancel_at_period_end"),
        )
        .await?;

        tracing::info!(subscription_id = %subscription_ref, "Scheduled Stripe subscription cancellation");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_lookup_is_case_insensitive() {
        let config = StripeConfig {
            secret_key: "sk_test_x".to_string(),
            webhook_secret: "whsec_x".to_string(),
            price_ids: HashMap::from([("club".to_string(), "price_club".to_string())]),
        };
        assert_eq!(config.price_id_for_plan("CLUB"), Some("price_club"));
        assert_eq!(config.price_id_for_plan("league"), None);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = StripeConfig {
            secret_key: "sk_live_secret".to_string(),
            webhook_secret: "whsec_secret".to_string(),
            price_ids: HashMap::new(),
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk_live_secret"));
        assert!(!debug.contains("whsec_secret"));
    }

    #[test]
    fn test_customer_matched_by_tenant_metadata() {
        let tenant = TenantId::new().to_string();
        let tagged = Customer {
            metadata: Some(HashMap::from([(METADATA_TENANT_ID.to_string(), tenant.clone())])),
            ..Default::default()
        };
        let other = Customer {
            metadata: Some(HashMap::from([(
                METADATA_TENANT_ID.to_string(),
                TenantId::new().to_string(),
            )])),
            ..Default::default()
        };

        assert!(is_tenant_customer(&tagged, &tenant));
        assert!(!is_tenant_customer(&other, &tenant));
        assert!(!is_tenant_customer(&Customer::default(), &tenant));
    }

    #[test]
    fn test_retry_strategy_is_bounded() {
        let delays: Vec<Duration> = retry_strategy().collect();
        assert_eq!(delays.len(), MAX_RETRIES);
        assert!(delays.iter().all(|d| *d <= RETRY_MAX_DELAY));
    }
}
