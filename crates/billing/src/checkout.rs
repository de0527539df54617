//! Checkout orchestration
//!
//! Turns "tenant wants plan X" into either an immediate free-plan switch or a
//! redirect to the provider's hosted checkout. The paid path never changes the
//! subscription status; only a confirmed payment webhook does that.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use teamride_shared::{SubscriptionStatus, TenantId};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    CheckoutMode, CheckoutSessionRequest, CreateCustomerRequest, PaymentProvider,
};
use crate::subscriptions::{SubscriptionService, TenantSubscription};

/// Result of starting a checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckoutOutcome {
    FreePlanApplied { subscription: TenantSubscription },
    ExternalRedirect { redirect_url: String, session_ref: String },
}

/// Checkout service for creating provider checkout sessions
#[derive(Clone)]
pub struct CheckoutService {
    subscriptions: SubscriptionService,
    provider: Arc<dyn PaymentProvider>,
    price_ids: HashMap<String, String>,
    app_base_url: String,
}

impl CheckoutService {
    pub fn new(
        subscriptions: SubscriptionService,
        provider: Arc<dyn PaymentProvider>,
        price_ids: HashMap<String, String>,
        app_base_url: impl Into<String>,
    ) -> Self {
        let price_ids = price_ids
            .into_iter()
            .map(|(plan, price)| (plan.to_lowercase(), price))
            .collect();
        Self {
            subscriptions,
            provider,
            price_ids,
            app_base_url: app_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Start moving a tenant to `plan_id`
    pub async fn start_checkout(
        &self,
        tenant_id: TenantId,
        plan_id: &str,
    ) -> BillingResult<CheckoutOutcome> {
        let plan = self.subscriptions.catalog().require(plan_id)?.clone();

        // Also valid for tenants without a record yet
        if plan.is_free() {
            let subscription = self
                .subscriptions
                .apply_plan_change(tenant_id, &plan.plan_id, None)
                .await?;
            tracing::info!(tenant_id = %tenant_id, "Free plan applied");
            return Ok(CheckoutOutcome::FreePlanApplied { subscription });
        }

        let current = self.subscriptions.get_subscription(tenant_id).await?;

        if plan.billing_interval.is_recurring()
            && current.plan_id == plan.plan_id
            && current.status == SubscriptionStatus::Active
            && !current.cancel_at_period_end
        {
            return Err(BillingError::InvalidTransition(format!(
                "tenant already subscribed to {}",
                plan.plan_id
            )));
        }

        let mode = CheckoutMode::for_interval(plan.billing_interval)
            .ok_or_else(|| BillingError::InvalidPlan(plan.plan_id.clone()))?;
        let price_ref = self
            .price_ids
            .get(&plan.plan_id.to_lowercase())
            .cloned()
            .ok_or_else(|| {
                BillingError::Config(format!("no provider price configured for plan {}", plan.plan_id))
            })?;

        let customer_ref = self.ensure_customer(&current).await?;

        let request = CheckoutSessionRequest {
            tenant_id,
            plan_id: plan.plan_id.clone(),
            customer_ref,
            price_ref,
            mode,
            success_url: format!(
                "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
                self.app_base_url
            ),
            cancel_url: format!("{}/billing/cancel", self.app_base_url),
            idempotency_key: format!("checkout-{}-{}-{}", tenant_id, plan.plan_id, Uuid::new_v4()),
        };

        let session = self.provider.create_checkout_session(request).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            plan_id = %plan.plan_id,
            session_ref = %session.session_ref,
            "Checkout started"
        );

        Ok(CheckoutOutcome::ExternalRedirect {
            redirect_url: session.redirect_url,
            session_ref: session.session_ref,
        })
    }

    /// Ask the provider to stop renewing, then flag the local record
    pub async fn cancel_subscription(&self, tenant_id: TenantId) -> BillingResult<TenantSubscription> {
        let current = self.subscriptions.get_subscription(tenant_id).await?;

        if current.cancel_at_period_end {
            return Ok(current);
        }
        if current.status != SubscriptionStatus::Active {
            return Err(BillingError::InvalidTransition(format!(
                "cannot cancel a {} subscription",
                current.status
            )));
        }
        let subscription_ref = current.external_subscription_ref.as_deref().ok_or_else(|| {
            BillingError::InvalidTransition("only recurring plans can be cancelled".to_string())
        })?;

        self.provider.cancel_at_period_end(subscription_ref).await?;
        let updated = self.subscriptions.request_cancellation(tenant_id).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            plan_id = %updated.plan_id,
            period_end = ?updated.period_end,
            "Cancellation scheduled at period end"
        );
        Ok(updated)
    }

    /// Resolve the tenant's provider customer, creating it at most once.
    ///
    /// Creation uses a per-tenant idempotency key, and attaching only succeeds when no
    /// customer is stored yet, so concurrent checkouts converge on one customer.
    async fn ensure_customer(&self, current: &TenantSubscription) -> BillingResult<String> {
        if let Some(customer_ref) = &current.external_customer_ref {
            return Ok(customer_ref.clone());
        }

        let tenant_id = current.tenant_id;
        let email = current.billing_email.as_deref().ok_or_else(|| {
            BillingError::InvalidInput(format!("tenant {} has no billing email", tenant_id))
        })?;

        let candidate = match self.provider.find_customer(tenant_id, email).await? {
            Some(existing) => {
                tracing::debug!(tenant_id = %tenant_id, customer_ref = %existing, "Reusing provider customer");
                existing
            }
            None => {
                self.provider
                    .create_customer(CreateCustomerRequest {
                        tenant_id,
                        email: email.to_string(),
                        idempotency_key: format!("customer-create-{}", tenant_id),
                    })
                    .await?
            }
        };

        let record = self.subscriptions.attach_customer(tenant_id, &candidate).await?;
        let winner = record.external_customer_ref.ok_or_else(|| {
            BillingError::Internal(format!("customer not attached for tenant {}", tenant_id))
        })?;

        if winner != candidate {
            tracing::warn!(
                tenant_id = %tenant_id,
                kept = %winner,
                discarded = %candidate,
                "Concurrent checkout attached another customer"
            );
        }
        Ok(winner)
    }
}
