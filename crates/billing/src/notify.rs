//! Subscription change notifications
//!
//! Fired after a transition has been committed whenever the tenant's plan or status
//! changed. Delivery is best effort and never fails the transition that caused it.

use async_trait::async_trait;
use serde::Serialize;
use teamride_shared::TenantId;
use tokio::sync::broadcast;

use crate::subscriptions::TenantSubscription;

/// A committed change of plan or status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionChange {
    pub tenant_id: TenantId,
    pub old_state: TenantSubscription,
    pub new_state: TenantSubscription,
}

impl SubscriptionChange {
    /// Build a change record if the plan or status differ
    pub fn between(old_state: &TenantSubscription, new_state: &TenantSubscription) -> Option<Self> {
        if old_state.plan_id == new_state.plan_id && old_state.status == new_state.status {
            return None;
        }
        Some(Self {
            tenant_id: new_state.tenant_id,
            old_state: old_state.clone(),
            new_state: new_state.clone(),
        })
    }
}

#[async_trait]
pub trait SubscriptionNotifier: Send + Sync {
    async fn subscription_changed(&self, change: &SubscriptionChange);
}

/// Logs every change; the default when nothing else listens
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl SubscriptionNotifier for TracingNotifier {
    async fn subscription_changed(&self, change: &SubscriptionChange) {
        tracing::info!(
            tenant_id = %change.tenant_id,
            old_plan = %change.old_state.plan_id,
            new_plan = %change.new_state.plan_id,
            old_status = %change.old_state.status,
            new_status = %change.new_state.status,
            "Subscription changed"
        );
    }
}

/// Fans changes out to in-process subscribers (cache invalidation, UI pushes)
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<SubscriptionChange>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SubscriptionChange> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl SubscriptionNotifier for BroadcastNotifier {
    async fn subscription_changed(&self, change: &SubscriptionChange) {
        // No receivers is not an error
        if self.sender.send(change.clone()).is_err() {
            tracing::debug!(tenant_id = %change.tenant_id, "No subscribers for subscription change");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teamride_shared::SubscriptionStatus;
    use time::OffsetDateTime;

    fn record(plan: &str, status: SubscriptionStatus) -> TenantSubscription {
        let mut sub = TenantSubscription::new_free(
            TenantId::new(),
            "coach@example.com",
            "free",
            OffsetDateTime::now_utc(),
        );
        sub.plan_id = plan.to_string();
        sub.status = status;
        sub
    }

    #[test]
    fn test_change_only_for_plan_or_status() {
        let old = record("club", SubscriptionStatus::Active);
        let mut same = old.clone();
        same.cancel_at_period_end = true;
        assert!(SubscriptionChange::between(&old, &same).is_none());

        let mut lapsed = old.clone();
        lapsed.status = SubscriptionStatus::PastDue;
        let change = SubscriptionChange::between(&old, &lapsed).unwrap();
        assert_eq!(change.tenant_id, old.tenant_id);
        assert_eq!(change.new_state.status, SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();

        let old = record("free", SubscriptionStatus::Active);
        let mut new = old.clone();
        new.plan_id = "league".to_string();
        let change = SubscriptionChange::between(&old, &new).unwrap();

        notifier.subscription_changed(&change).await;
        assert_eq!(rx.recv().await.unwrap(), change);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_silent() {
        let notifier = BroadcastNotifier::new(1);
        let old = record("free", SubscriptionStatus::Active);
        let mut new = old.clone();
        new.status = SubscriptionStatus::Expired;
        let change = SubscriptionChange::between(&old, &new).unwrap();
        notifier.subscription_changed(&change).await;
    }
}
