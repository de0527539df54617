//! Tenant provisioning hook

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use teamride_billing::TenantSubscription;
use teamride_shared::TenantId;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ProvisionTenantRequest {
    pub tenant_id: TenantId,
    pub billing_email: String,
}

/// Put a new tenant on the free plan. Repeating the call returns the existing record.
pub async fn provision(
    State(state): State<AppState>,
    Json(req): Json<ProvisionTenantRequest>,
) -> ApiResult<(StatusCode, Json<TenantSubscription>)> {
    let subscription = state
        .billing
        .subscriptions
        .ensure_subscription(req.tenant_id, &req.billing_email)
        .await?;

    tracing::info!(
        tenant_id = %req.tenant_id,
        plan_id = %subscription.plan_id,
        "Tenant provisioned"
    );
    Ok((StatusCode::CREATED, Json(subscription)))
}
