// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! TeamRide Billing Core
//!
//! Subscription and usage-quota reconciliation for TeamRide tenants.
//!
//! ## Features
//!
//! - **Plan Catalog**: Free, recurring and one-time plans with per-period limits
//! - **Quota Ledger**: Atomic check-and-increment of event and invitation counters
//! - **Subscriptions**: Per-tenant state machine, effective limits
//! - **Checkout**: Free-plan switch or Stripe hosted checkout
//! - **Webhooks**: Signed, idempotent reconciliation of Stripe events
//! - **Maintenance**: Lapse sweeps, quota rollover, event ledger pruning

use std::sync::Arc;

use sqlx::PgPool;

pub mod catalog;
pub mod checkout;
pub mod client;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod notify;
pub mod provider;
pub mod quota;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

// Catalog
pub use catalog::{Plan, PlanCatalog};

// Checkout
pub use checkout::{CheckoutOutcome, CheckoutService};

// Client
pub use client::{StripeClient, StripeConfig};

// Config
pub use config::BillingConfig;

// Error
pub use error::{BillingError, BillingResult};

// Maintenance
pub use maintenance::{MaintenanceService, SweepReport};

// Notifications
pub use notify::{BroadcastNotifier, SubscriptionChange, SubscriptionNotifier, TracingNotifier};

// Provider
pub use provider::{
    CheckoutMode, CheckoutSessionHandle, CheckoutSessionRequest, CreateCustomerRequest,
    PaymentProvider,
};

// Quota
pub use quota::{QuotaDecision, QuotaLedger, QuotaUsage};

// Stores
pub use store::{
    InMemoryQuotaStore, InMemorySubscriptionStore, PgQuotaStore, PgSubscriptionStore,
    ProcessedEvent, QuotaStore, SubscriptionStore,
};

// Subscriptions
pub use subscriptions::{EffectiveLimits, SubscriptionService, TenantSubscription};

// Webhooks
pub use webhooks::{
    WebhookDisposition, WebhookOutcome, WebhookReconciler, WebhookRejection,
};

/// Storage, provider and notification backends for [`BillingService`]
pub struct BillingComponents {
    pub subscription_store: Arc<dyn SubscriptionStore>,
    pub quota_store: Arc<dyn QuotaStore>,
    pub provider: Arc<dyn PaymentProvider>,
    pub notifier: Arc<dyn SubscriptionNotifier>,
}

/// All billing services wired to the same stores
#[derive(Clone)]
pub struct BillingService {
    pub catalog: Arc<PlanCatalog>,
    pub subscriptions: SubscriptionService,
    pub quota: QuotaLedger,
    pub checkout: CheckoutService,
    pub webhooks: WebhookReconciler,
    pub maintenance: MaintenanceService,
}

impl BillingService {
    pub fn new(config: &BillingConfig, catalog: PlanCatalog, components: BillingComponents) -> Self {
        for plan in catalog.plans().iter().filter(|p| !p.is_free()) {
            if config.stripe.price_id_for_plan(&plan.plan_id).is_none() {
                tracing::warn!(plan_id = %plan.plan_id, "No Stripe price configured, checkout for this plan will fail");
            }
        }

        let catalog = Arc::new(catalog);
        let subscriptions = SubscriptionService::new(
            components.subscription_store,
            Arc::clone(&catalog),
            components.notifier,
        );
        let quota = QuotaLedger::new(components.quota_store, subscriptions.clone());
        let checkout = CheckoutService::new(
            subscriptions.clone(),
            components.provider,
            config.stripe.price_ids.clone(),
            config.app_base_url.clone(),
        );
        let webhooks = WebhookReconciler::new(
            subscriptions.clone(),
            config.stripe.webhook_secret.clone(),
            config.webhook_tolerance,
        );
        let maintenance = MaintenanceService::new(
            subscriptions.clone(),
            quota.clone(),
            config.past_due_grace,
            config.event_retention,
        );

        Self {
            catalog,
            subscriptions,
            quota,
            checkout,
            webhooks,
            maintenance,
        }
    }

    /// Production wiring: PostgreSQL stores, Stripe, log-only notifications
    pub fn postgres(config: &BillingConfig, catalog: PlanCatalog, pool: PgPool) -> Self {
        Self::new(
            config,
            catalog,
            BillingComponents {
                subscription_store: Arc::new(PgSubscriptionStore::new(pool.clone())),
                quota_store: Arc::new(PgQuotaStore::new(pool)),
                provider: Arc::new(StripeClient::new(&config.stripe)),
                notifier: Arc::new(TracingNotifier),
            },
        )
    }
}
