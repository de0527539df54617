//! Scheduled lifecycle maintenance
//!
//! Time-driven transitions that no provider event announces: lapsed cancellations,
//! exhausted one-time packages, past-due grace expiry. Also opens new quota periods
//! and prunes the processed-event ledger.

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::error::BillingResult;
use crate::quota::QuotaLedger;
use crate::store::UpdateOutcome;
use crate::subscriptions::{SubscriptionCommand, SubscriptionService};

/// Counts from one subscription sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub transitioned: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct MaintenanceService {
    subscriptions: SubscriptionService,
    quota: QuotaLedger,
    past_due_grace: Duration,
    event_retention: Duration,
}

impl MaintenanceService {
    pub fn new(
        subscriptions: SubscriptionService,
        quota: QuotaLedger,
        past_due_grace: Duration,
        event_retention: Duration,
    ) -> Self {
        Self {
            subscriptions,
            quota,
            past_due_grace,
            event_retention,
        }
    }

    /// Apply every time-driven transition due at `now`.
    ///
    /// Each tenant is re-checked under its lock, so a webhook racing the sweep wins
    /// cleanly. One tenant failing does not stop the others.
    pub async fn sweep_subscriptions(&self, now: OffsetDateTime) -> BillingResult<SweepReport> {
        let cutoff = now - self.past_due_grace;
        let candidates = self
            .subscriptions
            .store()
            .sweep_candidates(now, cutoff)
            .await?;

        let mut report = SweepReport {
            examined: candidates.len(),
            ..Default::default()
        };

        for tenant_id in candidates {
            let command = SubscriptionCommand::Sweep {
                past_due_grace: self.past_due_grace,
            };
            match self.subscriptions.execute(tenant_id, command, None, now).await {
                Ok(UpdateOutcome::Applied { after, .. }) => {
                    report.transitioned += 1;
                    tracing::info!(
                        tenant_id = %tenant_id,
                        plan_id = %after.plan_id,
                        status = %after.status,
                        "Subscription lapsed"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(tenant_id = %tenant_id, error = %e, "Subscription sweep failed");
                }
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                transitioned = report.transitioned,
                failed = report.failed,
                "Subscription sweep complete"
            );
        }
        Ok(report)
    }

    pub async fn roll_quota_periods(&self, now: OffsetDateTime) -> BillingResult<u64> {
        self.quota.roll_periods(now).await
    }

    /// Drop processed-event records older than the retention window
    pub async fn purge_processed_events(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let purged = self
            .subscriptions
            .store()
            .purge_processed_events(now - self.event_retention)
            .await?;
        if purged > 0 {
            tracing::info!(purged, "Purged processed webhook events");
        }
        Ok(purged)
    }
}
