//! Quota ledger
//!
//! Per-tenant, per-period counters for created events and sent invitations.
//! `try_consume` checks and increments in one atomic step; two concurrent calls
//! can never both pass a limit that only one of them fits under.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use teamride_shared::{PeriodKey, QuotaKind, TenantId};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::store::{ConsumeOutcome, QuotaStore};
use crate::subscriptions::{EffectiveLimits, SubscriptionService};

/// Answer to a consumption request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum QuotaDecision {
    /// Counted; `remaining` is `None` on unlimited plans
    Allowed { used: u64, remaining: Option<u64> },
    /// Nothing was counted
    Denied { remaining: u64 },
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Usage of the current period next to the limits being enforced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub tenant_id: TenantId,
    pub period_key: PeriodKey,
    pub events_created: u64,
    pub invitations_sent: u64,
    pub limits: EffectiveLimits,
}

impl QuotaUsage {
    pub fn used(&self, kind: QuotaKind) -> u64 {
        match kind {
            QuotaKind::Events => self.events_created,
            QuotaKind::Invitations => self.invitations_sent,
        }
    }

    pub fn remaining(&self, kind: QuotaKind) -> Option<u64> {
        self.limits.limit_for(kind).remaining(self.used(kind))
    }
}

/// Usage ledger enforcing the tenant's effective limits
#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    subscriptions: SubscriptionService,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, subscriptions: SubscriptionService) -> Self {
        Self {
            store,
            subscriptions,
        }
    }

    /// Count `amount` units of `kind` if the tenant's effective limit allows it
    pub async fn try_consume(
        &self,
        tenant_id: TenantId,
        kind: QuotaKind,
        amount: u64,
    ) -> BillingResult<QuotaDecision> {
        if amount == 0 {
            return Err(BillingError::InvalidInput(
                "amount must be positive".to_string(),
            ));
        }

        let limits = self.subscriptions.get_effective_limits(tenant_id).await?;
        let limit = limits.limit_for(kind);

        let outcome = self
            .store
            .try_consume(tenant_id, kind, amount, limit, &PeriodKey::current())
            .await?;

        let decision = match outcome {
            ConsumeOutcome::Consumed { period_key, used } => {
                tracing::debug!(
                    tenant_id = %tenant_id,
                    kind = %kind,
                    amount,
                    used,
                    limit = %limit,
                    period = %period_key,
                    "Quota consumed"
                );
                QuotaDecision::Allowed {
                    used,
                    remaining: limit.remaining(used),
                }
            }
            ConsumeOutcome::Rejected { period_key, used } => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    kind = %kind,
                    amount,
                    used,
                    limit = %limit,
                    period = %period_key,
                    enforced_plan = %limits.enforced_plan_id,
                    "Quota denied"
                );
                QuotaDecision::Denied {
                    remaining: limit.remaining(used).unwrap_or(0),
                }
            }
        };

        Ok(decision)
    }

    /// Like [`Self::try_consume`] but turns a denial into `QuotaExceeded`
    pub async fn consume(
        &self,
        tenant_id: TenantId,
        kind: QuotaKind,
        amount: u64,
    ) -> BillingResult<u64> {
        match self.try_consume(tenant_id, kind, amount).await? {
            QuotaDecision::Allowed { used, .. } => Ok(used),
            QuotaDecision::Denied { remaining } => {
                Err(BillingError::QuotaExceeded { kind, remaining })
            }
        }
    }

    /// Current-period usage report
    pub async fn usage(&self, tenant_id: TenantId) -> BillingResult<QuotaUsage> {
        let limits = self.subscriptions.get_effective_limits(tenant_id).await?;
        let counters = self.store.current(tenant_id).await?;

        Ok(match counters {
            Some(counters) => QuotaUsage {
                tenant_id,
                period_key: counters.period_key,
                events_created: counters.events_created,
                invitations_sent: counters.invitations_sent,
                limits,
            },
            None => QuotaUsage {
                tenant_id,
                period_key: PeriodKey::current(),
                events_created: 0,
                invitations_sent: 0,
                limits,
            },
        })
    }

    /// Start a new period for every tenant still counting an older one
    pub async fn roll_periods(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let period = PeriodKey::for_time(now);
        let rolled = self.store.roll_periods(&period).await?;
        if rolled > 0 {
            tracing::info!(period = %period, tenants = rolled, "Quota periods rolled over");
        }
        Ok(rolled)
    }
}
