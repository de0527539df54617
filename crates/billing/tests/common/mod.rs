//! Shared fixtures for billing integration tests
//!
//! In-memory stores, a recording payment provider and helpers to sign provider events.

#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use teamride_billing::webhooks::signature_header;
use teamride_billing::{
    BillingComponents, BillingConfig, BillingError, BillingResult, BillingService,
    BroadcastNotifier, CheckoutSessionHandle, CheckoutSessionRequest, CreateCustomerRequest,
    InMemoryQuotaStore, InMemorySubscriptionStore, PaymentProvider, PlanCatalog, StripeConfig,
    SubscriptionChange, WebhookOutcome,
};
use teamride_shared::TenantId;
use time::OffsetDateTime;
use tokio::sync::broadcast;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Payment provider double that records every call
#[derive(Default)]
pub struct RecordingProvider {
    customers_by_key: Mutex<HashMap<String, String>>,
    existing_customers: Mutex<HashMap<TenantId, String>>,
    customers_created: AtomicUsize,
    lookups: AtomicUsize,
    sessions: Mutex<Vec<CheckoutSessionRequest>>,
    cancellations: Mutex<Vec<String>>,
    unavailable: AtomicBool,
}

impl RecordingProvider {
    /// Simulate an outage: every call fails as unavailable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Pretend the provider already knows a customer for this tenant
    pub fn seed_customer(&self, tenant_id: TenantId, customer_ref: &str) {
        self.existing_customers
            .lock()
            .unwrap()
            .insert(tenant_id, customer_ref.to_string());
    }

    pub fn customers_created(&self) -> usize {
        self.customers_created.load(Ordering::SeqCst)
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<CheckoutSessionRequest> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn cancellations(&self) -> Vec<String> {
        self.cancellations.lock().unwrap().clone()
    }

    fn check_available(&self) -> BillingResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::PaymentProviderUnavailable(
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProvider for RecordingProvider {
    async fn find_customer(&self, tenant_id: TenantId, _email: &str) -> BillingResult<Option<String>> {
        self.check_available()?;
        self.lookups.fetch_add(1, Ordering::SeqCst);
        // Give concurrent checkouts a chance to interleave
        tokio::task::yield_now().await;
        Ok(self.existing_customers.lock().unwrap().get(&tenant_id).cloned())
    }

    async fn create_customer(&self, request: CreateCustomerRequest) -> BillingResult<String> {
        self.check_available()?;
        tokio::task::yield_now().await;

        let mut by_key = self.customers_by_key.lock().unwrap();
        if let Some(existing) = by_key.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }
        let n = self.customers_created.fetch_add(1, Ordering::SeqCst) + 1;
        let customer_ref = format!("cus_test_{}", n);
        by_key.insert(request.idempotency_key, customer_ref.clone());
        Ok(customer_ref)
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<CheckoutSessionHandle> {
        self.check_available()?;
        let mut sessions = self.sessions.lock().unwrap();
        let session_ref = format!("cs_test_{}", sessions.len() + 1);
        sessions.push(request);
        Ok(CheckoutSessionHandle {
            redirect_url: format!("https://checkout.stripe.test/pay/{}", session_ref),
            session_ref,
        })
    }

    async fn cancel_at_period_end(&self, subscription_ref: &str) -> BillingResult<()> {
        self.check_available()?;
        self.cancellations
            .lock()
            .unwrap()
            .push(subscription_ref.to_string());
        Ok(())
    }
}

pub struct Harness {
    pub billing: BillingService,
    pub provider: Arc<RecordingProvider>,
    pub subscription_store: Arc<InMemorySubscriptionStore>,
    pub quota_store: Arc<InMemoryQuotaStore>,
    pub notifications: broadcast::Receiver<SubscriptionChange>,
}

pub fn config() -> BillingConfig {
    let mut config = BillingConfig::new(StripeConfig {
        secret_key: "sk_test_unused".to_string(),
        webhook_secret: WEBHOOK_SECRET.to_string(),
        price_ids: HashMap::from([
            ("club".to_string(), "price_club_monthly".to_string()),
            ("league".to_string(), "price_league_yearly".to_string()),
            ("season_pass".to_string(), "price_season_pass".to_string()),
        ]),
    });
    config.app_base_url = "https://app.teamride.test".to_string();
    config
}

pub fn harness() -> Harness {
    let provider = Arc::new(RecordingProvider::default());
    let subscription_store = Arc::new(InMemorySubscriptionStore::new());
    let quota_store = Arc::new(InMemoryQuotaStore::new());
    let notifier = BroadcastNotifier::new(64);
    let notifications = notifier.subscribe();

    let billing = BillingService::new(
        &config(),
        PlanCatalog::default_catalog(),
        BillingComponents {
            subscription_store: subscription_store.clone(),
            quota_store: quota_store.clone(),
            provider: provider.clone(),
            notifier: Arc::new(notifier),
        },
    );

    Harness {
        billing,
        provider,
        subscription_store,
        quota_store,
        notifications,
    }
}

impl Harness {
    /// Register a fresh tenant on the free plan
    pub async fn tenant(&self) -> TenantId {
        let tenant_id = TenantId::new();
        self.billing
            .subscriptions
            .ensure_subscription(tenant_id, &format!("coach+{}@example.com", tenant_id))
            .await
            .unwrap();
        tenant_id
    }

    /// Sign and deliver an event as received at `now`
    pub async fn deliver_at(&self, event: &Value, now: OffsetDateTime) -> WebhookOutcome {
        let payload = serde_json::to_vec(event).unwrap();
        let header = signature_header(WEBHOOK_SECRET, now.unix_timestamp(), &payload).unwrap();
        self.billing
            .webhooks
            .handle_webhook_at(&payload, &header, now)
            .await
    }

    pub async fn deliver(&self, event: &Value) -> WebhookOutcome {
        self.deliver_at(event, OffsetDateTime::now_utc()).await
    }

    /// Activate a recurring plan the way a completed checkout does
    pub async fn subscribe(&self, tenant_id: TenantId, plan_id: &str, subscription_ref: &str) {
        let event = checkout_completed(
            &format!("evt_checkout_{}_{}", tenant_id, plan_id),
            tenant_id,
            plan_id,
            Some(subscription_ref),
        );
        let outcome = self.deliver(&event).await;
        assert!(
            matches!(outcome, WebhookOutcome::Accepted(_)),
            "activation failed: {:?}",
            outcome
        );
    }

    /// Drain pending change notifications
    pub fn drain_notifications(&mut self) -> Vec<SubscriptionChange> {
        let mut changes = Vec::new();
        while let Ok(change) = self.notifications.try_recv() {
            changes.push(change);
        }
        changes
    }
}

/// Provider customer id used in synthetic events for a tenant
pub fn customer_for(tenant_id: TenantId) -> String {
    format!("cus_{}", tenant_id.as_uuid().simple())
}

/// `checkout.session.completed`; a subscription ref means subscription mode
pub fn checkout_completed(
    event_id: &str,
    tenant_id: TenantId,
    plan_id: &str,
    subscription_ref: Option<&str>,
) -> Value {
    let mode = if subscription_ref.is_some() {
        "subscription"
    } else {
        "payment"
    };
    json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": {
            "object": {
                "id": format!("cs_{}", event_id),
                "object": "checkout.session",
                "mode": mode,
                "payment_status": "paid",
                "customer": customer_for(tenant_id),
                "subscription": subscription_ref,
                "client_reference_id": tenant_id.to_string(),
                "metadata": { "tenant_id": tenant_id.to_string(), "plan_id": plan_id }
            }
        }
    })
}

/// `invoice.paid` or `invoice.payment_failed` for a subscription renewal
pub fn renewal_invoice(
    event_id: &str,
    event_type: &str,
    tenant_id: Option<TenantId>,
    subscription_ref: &str,
) -> Value {
    let (metadata, customer) = match tenant_id {
        Some(tenant_id) => (
            json!({ "tenant_id": tenant_id.to_string() }),
            Value::String(customer_for(tenant_id)),
        ),
        None => (json!({}), Value::Null),
    };
    json!({
        "id": event_id,
        "type": event_type,
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": {
            "object": {
                "id": format!("in_{}", event_id),
                "object": "invoice",
                "billing_reason": "subscription_cycle",
                "customer": customer,
                "subscription": subscription_ref,
                "subscription_details": { "metadata": metadata }
            }
        }
    })
}

/// `customer.subscription.updated` or `customer.subscription.deleted`
pub fn subscription_event(
    event_id: &str,
    event_type: &str,
    tenant_id: TenantId,
    subscription_ref: &str,
    cancel_at_period_end: bool,
) -> Value {
    json!({
        "id": event_id,
        "type": event_type,
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": {
            "object": {
                "id": subscription_ref,
                "object": "subscription",
                "customer": customer_for(tenant_id),
                "cancel_at_period_end": cancel_at_period_end,
                "metadata": { "tenant_id": tenant_id.to_string() }
            }
        }
    })
}
