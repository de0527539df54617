//! Billing routes: plans, checkout, subscription state and the Stripe webhook

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use teamride_billing::{
    CheckoutOutcome, EffectiveLimits, Plan, TenantSubscription, WebhookOutcome, WebhookRejection,
};
use teamride_shared::TenantId;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Header carrying the Stripe webhook signature
pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub plans: Vec<Plan>,
}

/// Request to move a tenant to another plan
#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub tenant_id: TenantId,
    pub plan_id: String,
}

/// Acknowledgement returned to the webhook sender
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub disposition: String,
}

/// List the plan catalog
pub async fn list_plans(State(state): State<AppState>) -> Json<PlansResponse> {
    Json(PlansResponse {
        plans: state.billing.catalog.plans().to_vec(),
    })
}

/// Start a checkout; free plans apply immediately, paid plans return a redirect
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutOutcome>> {
    let outcome = state
        .billing
        .checkout
        .start_checkout(req.tenant_id, &req.plan_id)
        .await?;
    Ok(Json(outcome))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(tenant_id): Path<TenantId>,
) -> ApiResult<Json<TenantSubscription>> {
    let subscription = state
        .billing
        .subscriptions
        .get_subscription(tenant_id)
        .await?;
    Ok(Json(subscription))
}

/// Limits currently enforced for the tenant, next to the plan it displays
pub async fn get_limits(
    State(state): State<AppState>,
    Path(tenant_id): Path<TenantId>,
) -> ApiResult<Json<EffectiveLimits>> {
    let limits = state
        .billing
        .subscriptions
        .get_effective_limits(tenant_id)
        .await?;
    Ok(Json(limits))
}

/// Cancel the tenant's recurring plan at the end of the current period
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(tenant_id): Path<TenantId>,
) -> ApiResult<Json<TenantSubscription>> {
    let subscription = state.billing.checkout.cancel_subscription(tenant_id).await?;
    Ok(Json(subscription))
}

/// Handle Stripe webhook events.
///
/// Any non-2xx response makes Stripe redeliver the event, so only failures that
/// a retry can fix return 500.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<WebhookAck>)> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    match state.billing.webhooks.handle_webhook(&body, signature).await {
        WebhookOutcome::Accepted(disposition) => Ok((
            StatusCode::OK,
            Json(WebhookAck {
                received: true,
                disposition: disposition.to_string(),
            }),
        )),
        WebhookOutcome::Rejected(WebhookRejection::InvalidSignature) => {
            Err(ApiError::InvalidSignature)
        }
        WebhookOutcome::Rejected(WebhookRejection::MalformedPayload(msg)) => {
            Err(ApiError::BadRequest(format!("Malformed webhook payload: {}", msg)))
        }
        WebhookOutcome::Rejected(WebhookRejection::ReconciliationFailed(_)) => {
            Err(ApiError::Internal)
        }
    }
}
