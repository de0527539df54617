//! Payment provider seam
//!
//! The checkout orchestrator only talks to the provider through this trait.
//! [`crate::client::StripeClient`] is the production implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use teamride_shared::{BillingInterval, TenantId};

use crate::error::BillingResult;

/// Metadata keys attached to provider objects so webhooks can be correlated
pub const METADATA_TENANT_ID: &str = "tenant_id";
pub const METADATA_PLAN_ID: &str = "plan_id";

/// How the hosted checkout charges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutMode {
    /// Single payment
    Payment,
    /// Recurring subscription
    Subscription,
}

impl CheckoutMode {
    /// Mode for a paid billing interval; `None` for the free plan
    pub fn for_interval(interval: BillingInterval) -> Option<Self> {
        match interval {
            BillingInterval::OneTime => Some(Self::Payment),
            BillingInterval::Monthly | BillingInterval::Yearly => Some(Self::Subscription),
            BillingInterval::None => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCustomerRequest {
    pub tenant_id: TenantId,
    pub email: String,
    /// Repeated calls with the same key return the same customer
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionRequest {
    pub tenant_id: TenantId,
    pub plan_id: String,
    pub customer_ref: String,
    pub price_ref: String,
    pub mode: CheckoutMode,
    pub success_url: String,
    pub cancel_url: String,
    pub idempotency_key: String,
}

/// A hosted checkout page the user is redirected to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSessionHandle {
    pub session_ref: String,
    pub redirect_url: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Customer previously created for this tenant under this email, if any
    async fn find_customer(&self, tenant_id: TenantId, email: &str) -> BillingResult<Option<String>>;

    async fn create_customer(&self, request: CreateCustomerRequest) -> BillingResult<String>;

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<CheckoutSessionHandle>;

    /// Ask the provider to stop renewing once the current period ends
    async fn cancel_at_period_end(&self, subscription_ref: &str) -> BillingResult<()>;
}
