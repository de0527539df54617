//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use teamride_billing::BillingError;
use teamride_shared::{QuotaKind, TenantId};

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unknown plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    // Resource errors
    #[error("Unknown tenant: {0}")]
    UnknownTenant(TenantId),
    #[error("{0}")]
    Conflict(String),

    // Billing errors
    #[error("{kind} quota exceeded")]
    QuotaExceeded { kind: QuotaKind, remaining: u64 },
    #[error("Payment provider unavailable")]
    PaymentProviderUnavailable,
    #[error("Payment provider error")]
    PaymentProvider,

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut remaining = None;
        let (status, code, message) = match &self {
            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::InvalidPlan(_) => (StatusCode::BAD_REQUEST, "INVALID_PLAN", self.to_string()),
            ApiError::InvalidSignature => (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE", self.to_string()),

            // Resources
            ApiError::UnknownTenant(_) => (StatusCode::NOT_FOUND, "UNKNOWN_TENANT", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Billing
            ApiError::QuotaExceeded { remaining: left, .. } => {
                remaining = Some(*left);
                (StatusCode::PAYMENT_REQUIRED, "QUOTA_EXCEEDED", self.to_string())
            }
            ApiError::PaymentProviderUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "PAYMENT_PROVIDER_UNAVAILABLE", "Payment provider is temporarily unavailable, please retry".to_string()),
            ApiError::PaymentProvider => (StatusCode::BAD_GATEWAY, "PAYMENT_PROVIDER_ERROR", self.to_string()),

            // Internal
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
        };

        let mut error = json!({
            "code": code,
            "message": message,
        });
        if let Some(remaining) = remaining {
            error["remaining"] = json!(remaining);
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidPlan(plan) => ApiError::InvalidPlan(plan),
            BillingError::UnknownTenant(tenant_id) => ApiError::UnknownTenant(tenant_id),
            BillingError::QuotaExceeded { kind, remaining } => {
                ApiError::QuotaExceeded { kind, remaining }
            }
            BillingError::InvalidSignature => ApiError::InvalidSignature,
            BillingError::PaymentProviderUnavailable(msg) => {
                tracing::warn!(error = %msg, "Payment provider unavailable");
                ApiError::PaymentProviderUnavailable
            }
            BillingError::PaymentProvider(msg) => {
                tracing::error!(error = %msg, "Payment provider rejected request");
                ApiError::PaymentProvider
            }
            BillingError::InvalidTransition(msg) => ApiError::Conflict(msg),
            BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            BillingError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                ApiError::Database(msg)
            }
            e @ (BillingError::ReconciliationFailed(_)
            | BillingError::Config(_)
            | BillingError::Internal(_)) => {
                tracing::error!(error = %e, "Billing error");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
