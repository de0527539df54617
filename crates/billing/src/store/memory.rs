//! In-memory stores for development and tests
//!
//! Each store keeps its state behind a single async mutex, so every operation is
//! atomic with respect to every other one.

use std::collections::HashMap;

use async_trait::async_trait;
use teamride_shared::{PeriodKey, QuotaKind, QuotaLimit, SubscriptionStatus, TenantId};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::{
    ConsumeOutcome, Mutation, ProcessedEvent, QuotaCounters, QuotaStore, SubscriptionStore,
    UpdateOutcome,
};
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::{TenantSubscription, Transition};

#[derive(Default)]
struct SubscriptionState {
    subscriptions: HashMap<TenantId, TenantSubscription>,
    processed_events: HashMap<String, ProcessedEvent>,
}

/// In-memory subscription store (not shared between processes)
#[derive(Default)]
pub struct InMemorySubscriptionStore {
    state: Mutex<SubscriptionState>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded provider events
    pub async fn processed_event_count(&self) -> usize {
        self.state.lock().await.processed_events.len()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn insert_if_absent(&self, record: TenantSubscription) -> BillingResult<TenantSubscription> {
        let mut state = self.state.lock().await;
        let stored = state
            .subscriptions
            .entry(record.tenant_id)
            .or_insert(record);
        Ok(stored.clone())
    }

    async fn get(&self, tenant_id: TenantId) -> BillingResult<Option<TenantSubscription>> {
        Ok(self.state.lock().await.subscriptions.get(&tenant_id).cloned())
    }

    async fn find_by_subscription_ref(&self, subscription_ref: &str) -> BillingResult<Option<TenantId>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.external_subscription_ref.as_deref() == Some(subscription_ref))
            .map(|s| s.tenant_id))
    }

    async fn find_by_customer_ref(&self, customer_ref: &str) -> BillingResult<Option<TenantId>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.external_customer_ref.as_deref() == Some(customer_ref))
            .map(|s| s.tenant_id))
    }

    async fn update(
        &self,
        tenant_id: TenantId,
        mutation: &Mutation<'_>,
        event: Option<&ProcessedEvent>,
    ) -> BillingResult<UpdateOutcome> {
        let mut state = self.state.lock().await;

        if let Some(event) = event {
            if state.processed_events.contains_key(&event.event_id) {
                return Ok(UpdateOutcome::DuplicateEvent);
            }
        }

        let current = state
            .subscriptions
            .get(&tenant_id)
            .cloned()
            .ok_or(BillingError::UnknownTenant(tenant_id))?;

        // Nothing is written unless the mutation succeeds
        let transition = mutation(&current)?;

        if let Some(event) = event {
            state
                .processed_events
                .insert(event.event_id.clone(), event.clone());
        }

        match transition {
            Transition::Changed(next) => {
                state.subscriptions.insert(tenant_id, next.clone());
                Ok(UpdateOutcome::Applied {
                    before: current,
                    after: next,
                })
            }
            Transition::Unchanged => Ok(UpdateOutcome::Unchanged(current)),
        }
    }

    async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool> {
        Ok(self
            .state
            .lock()
            .await
            .processed_events
            .contains_key(event_id))
    }

    async fn sweep_candidates(
        &self,
        now: OffsetDateTime,
        past_due_cutoff: OffsetDateTime,
    ) -> BillingResult<Vec<TenantId>> {
        let state = self.state.lock().await;
        let mut due: Vec<TenantId> = state
            .subscriptions
            .values()
            .filter(|s| match s.status {
                SubscriptionStatus::Active => {
                    s.period_end.is_some_and(|end| end <= now)
                        && (s.cancel_at_period_end || s.external_subscription_ref.is_none())
                }
                SubscriptionStatus::PastDue => {
                    s.past_due_since.is_some_and(|since| since <= past_due_cutoff)
                }
                SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => false,
            })
            .map(|s| s.tenant_id)
            .collect();
        due.sort();
        Ok(due)
    }

    async fn purge_processed_events(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.processed_events.len();
        state
            .processed_events
            .retain(|_, event| event.processed_at >= cutoff);
        Ok((before - state.processed_events.len()) as u64)
    }
}

#[derive(Default)]
struct QuotaState {
    current: HashMap<TenantId, QuotaCounters>,
    history: Vec<QuotaCounters>,
}

/// In-memory quota counters
#[derive(Default)]
pub struct InMemoryQuotaStore {
    state: Mutex<QuotaState>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Closed periods of a tenant, oldest first
    pub async fn history(&self, tenant_id: TenantId) -> Vec<QuotaCounters> {
        let state = self.state.lock().await;
        state
            .history
            .iter()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn try_consume(
        &self,
        tenant_id: TenantId,
        kind: QuotaKind,
        amount: u64,
        limit: QuotaLimit,
        period: &PeriodKey,
    ) -> BillingResult<ConsumeOutcome> {
        let mut state = self.state.lock().await;
        let counters = state
            .current
            .entry(tenant_id)
            .or_insert_with(|| QuotaCounters {
                tenant_id,
                period_key: period.clone(),
                events_created: 0,
                invitations_sent: 0,
            });

        let used = counters.used(kind);
        let proposed = used.checked_add(amount).ok_or_else(|| {
            BillingError::InvalidInput(format!("amount out of range: {}", amount))
        })?;

        if let QuotaLimit::Limited(max) = limit {
            if proposed > max {
                return Ok(ConsumeOutcome::Rejected {
                    period_key: counters.period_key.clone(),
                    used,
                });
            }
        }

        match kind {
            QuotaKind::Events => counters.events_created = proposed,
            QuotaKind::Invitations => counters.invitations_sent = proposed,
        }

        Ok(ConsumeOutcome::Consumed {
            period_key: counters.period_key.clone(),
            used: proposed,
        })
    }

    async fn current(&self, tenant_id: TenantId) -> BillingResult<Option<QuotaCounters>> {
        Ok(self.state.lock().await.current.get(&tenant_id).cloned())
    }

    async fn roll_periods(&self, period: &PeriodKey) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let QuotaState { current, history } = &mut *state;

        let mut rolled = 0;
        for counters in current.values_mut() {
            if counters.period_key < *period {
                let fresh = QuotaCounters {
                    tenant_id: counters.tenant_id,
                    period_key: period.clone(),
                    events_created: 0,
                    invitations_sent: 0,
                };
                history.push(std::mem::replace(counters, fresh));
                rolled += 1;
            }
        }
        Ok(rolled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> PeriodKey {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_consume_stops_at_limit() {
        let store = InMemoryQuotaStore::new();
        let tenant = TenantId::new();
        let period = key("2026-05");

        for expected in 1..=3 {
            let outcome = store
                .try_consume(tenant, QuotaKind::Events, 1, QuotaLimit::Limited(3), &period)
                .await
                .unwrap();
            assert_eq!(
                outcome,
                ConsumeOutcome::Consumed {
                    period_key: period.clone(),
                    used: expected
                }
            );
        }

        let outcome = store
            .try_consume(tenant, QuotaKind::Events, 1, QuotaLimit::Limited(3), &period)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ConsumeOutcome::Rejected {
                period_key: period.clone(),
                used: 3
            }
        );
    }

    #[tokio::test]
    async fn test_unlimited_still_counts() {
        let store = InMemoryQuotaStore::new();
        let tenant = TenantId::new();
        let period = key("2026-05");
        store
            .try_consume(tenant, QuotaKind::Invitations, 250, QuotaLimit::Unlimited, &period)
            .await
            .unwrap();
        let counters = store.current(tenant).await.unwrap().unwrap();
        assert_eq!(counters.invitations_sent, 250);
        assert_eq!(counters.events_created, 0);
    }

    #[tokio::test]
    async fn test_roll_periods_resets_and_keeps_history() {
        let store = InMemoryQuotaStore::new();
        let tenant = TenantId::new();
        store
            .try_consume(tenant, QuotaKind::Events, 2, QuotaLimit::Limited(3), &key("2026-04"))
            .await
            .unwrap();

        assert_eq!(store.roll_periods(&key("2026-05")).await.unwrap(), 1);
        // Rolling again to the same period is a no-op
        assert_eq!(store.roll_periods(&key("2026-05")).await.unwrap(), 0);

        let counters = store.current(tenant).await.unwrap().unwrap();
        assert_eq!(counters.period_key, key("2026-05"));
        assert_eq!(counters.events_created, 0);

        let history = store.history(tenant).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].events_created, 2);
    }

    #[tokio::test]
    async fn test_failed_mutation_does_not_record_event() {
        let store = InMemorySubscriptionStore::new();
        let tenant = TenantId::new();
        let now = OffsetDateTime::now_utc();
        store
            .insert_if_absent(TenantSubscription::new_free(tenant, "a@example.com", "free", now))
            .await
            .unwrap();

        let event = ProcessedEvent {
            event_id: "evt_1".to_string(),
            event_type: "invoice.paid".to_string(),
            tenant_id: Some(tenant),
            processed_at: now,
        };
        let failing = |_: &TenantSubscription| -> BillingResult<Transition> {
            Err(BillingError::ReconciliationFailed("boom".to_string()))
        };
        assert!(store.update(tenant, &failing, Some(&event)).await.is_err());
        assert!(!store.is_event_processed("evt_1").await.unwrap());

        let unchanged = |_: &TenantSubscription| -> BillingResult<Transition> { Ok(Transition::Unchanged) };
        assert!(matches!(
            store.update(tenant, &unchanged, Some(&event)).await.unwrap(),
            UpdateOutcome::Unchanged(_)
        ));
        assert!(matches!(
            store.update(tenant, &unchanged, Some(&event)).await.unwrap(),
            UpdateOutcome::DuplicateEvent
        ));
        assert_eq!(store.processed_event_count().await, 1);
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_first_record() {
        let store = InMemorySubscriptionStore::new();
        let tenant = TenantId::new();
        let now = OffsetDateTime::now_utc();
        store
            .insert_if_absent(TenantSubscription::new_free(tenant, "first@example.com", "free", now))
            .await
            .unwrap();
        let stored = store
            .insert_if_absent(TenantSubscription::new_free(tenant, "second@example.com", "free", now))
            .await
            .unwrap();
        assert_eq!(stored.billing_email.as_deref(), Some("first@example.com"));
    }

    #[tokio::test]
    async fn test_purge_processed_events() {
        let store = InMemorySubscriptionStore::new();
        let tenant = TenantId::new();
        let now = OffsetDateTime::now_utc();
        store
            .insert_if_absent(TenantSubscription::new_free(tenant, "a@example.com", "free", now))
            .await
            .unwrap();
        let unchanged = |_: &TenantSubscription| -> BillingResult<Transition> { Ok(Transition::Unchanged) };

        for (id, age_days) in [("evt_old", 40), ("evt_new", 1)] {
            let event = ProcessedEvent {
                event_id: id.to_string(),
                event_type: "invoice.paid".to_string(),
                tenant_id: Some(tenant),
                processed_at: now - time::Duration::days(age_days),
            };
            store.update(tenant, &unchanged, Some(&event)).await.unwrap();
        }

        let purged = store
            .purge_processed_events(now - time::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.is_event_processed("evt_new").await.unwrap());
        assert!(!store.is_event_processed("evt_old").await.unwrap());
    }
}
