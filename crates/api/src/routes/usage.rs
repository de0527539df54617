//! Usage quota routes

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use teamride_billing::{QuotaDecision, QuotaUsage};
use teamride_shared::{QuotaKind, TenantId};

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    pub tenant_id: TenantId,
    pub kind: QuotaKind,
    #[serde(default = "default_amount")]
    pub amount: u64,
}

fn default_amount() -> u64 {
    1
}

/// Count usage against the tenant's quota.
///
/// A denial is a normal answer (`"decision": "denied"`), not an error.
pub async fn consume(
    State(state): State<AppState>,
    Json(req): Json<ConsumeRequest>,
) -> ApiResult<Json<QuotaDecision>> {
    let decision = state
        .billing
        .quota
        .try_consume(req.tenant_id, req.kind, req.amount)
        .await?;
    Ok(Json(decision))
}

/// Current-period usage and limits
pub async fn get_usage(
    State(state): State<AppState>,
    Path(tenant_id): Path<TenantId>,
) -> ApiResult<Json<QuotaUsage>> {
    let usage = state.billing.quota.usage(tenant_id).await?;
    Ok(Json(usage))
}
