//! Billing error types

use teamride_shared::{QuotaKind, TenantId};
use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Unknown tenant: {0}")]
    UnknownTenant(TenantId),

    #[error("Quota exceeded for {kind}: {remaining} remaining this period")]
    QuotaExceeded { kind: QuotaKind, remaining: u64 },

    #[error("Webhook signature verification failed")]
    InvalidSignature,

    #[error("Payment provider unavailable: {0}")]
    PaymentProviderUnavailable(String),

    #[error("Payment provider rejected the request: {0}")]
    PaymentProvider(String),

    #[error("Webhook reconciliation failed: {0}")]
    ReconciliationFailed(String),

    #[error("Invalid subscription transition: {0}")]
    InvalidTransition(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::PaymentProviderUnavailable(_) | BillingError::Database(_)
        )
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match &err {
            stripe::StripeError::Stripe(request)
                if request.http_status == 429 || request.http_status >= 500 =>
            {
                BillingError::PaymentProviderUnavailable(err.to_string())
            }
            stripe::StripeError::ClientError(_) | stripe::StripeError::Timeout => {
                BillingError::PaymentProviderUnavailable(err.to_string())
            }
            _ => BillingError::PaymentProvider(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
