//! Persistence seams for subscriptions, quota counters and processed webhook events
//!
//! Every mutation of a subscription goes through [`SubscriptionStore::update`], which
//! holds the tenant's row exclusively while a pure transition closure decides the next
//! state. When a webhook event id is supplied it is claimed inside the same unit of
//! work, so either both the effects and the event id persist or neither does.

mod memory;
mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use teamride_shared::{PeriodKey, QuotaKind, QuotaLimit, TenantId};
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::subscriptions::{TenantSubscription, Transition};

pub use memory::{InMemoryQuotaStore, InMemorySubscriptionStore};
pub use postgres::{PgQuotaStore, PgSubscriptionStore};

/// Transition function evaluated while the tenant's record is locked
pub type Mutation<'a> =
    dyn Fn(&TenantSubscription) -> BillingResult<Transition> + Send + Sync + 'a;

/// A provider event that has been (or is being) applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub event_type: String,
    pub tenant_id: Option<TenantId>,
    #[serde(with = "time::serde::rfc3339")]
    pub processed_at: OffsetDateTime,
}

/// Result of a locked read-modify-write on a subscription
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Applied {
        before: TenantSubscription,
        after: TenantSubscription,
    },
    Unchanged(TenantSubscription),
    /// The supplied event id was already recorded; nothing was written
    DuplicateEvent,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert the record unless the tenant already has one; returns the stored record
    async fn insert_if_absent(&self, record: TenantSubscription) -> BillingResult<TenantSubscription>;

    async fn get(&self, tenant_id: TenantId) -> BillingResult<Option<TenantSubscription>>;

    async fn find_by_subscription_ref(&self, subscription_ref: &str) -> BillingResult<Option<TenantId>>;

    async fn find_by_customer_ref(&self, customer_ref: &str) -> BillingResult<Option<TenantId>>;

    /// Lock the tenant's record, evaluate `mutation` and persist the result.
    ///
    /// A mutation error aborts the unit of work; the event id, if any, is not recorded.
    async fn update(
        &self,
        tenant_id: TenantId,
        mutation: &Mutation<'_>,
        event: Option<&ProcessedEvent>,
    ) -> BillingResult<UpdateOutcome>;

    async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool>;

    /// Tenants whose period or grace window may have elapsed at `now`
    async fn sweep_candidates(
        &self,
        now: OffsetDateTime,
        past_due_cutoff: OffsetDateTime,
    ) -> BillingResult<Vec<TenantId>>;

    /// Delete processed-event records older than `cutoff`
    async fn purge_processed_events(&self, cutoff: OffsetDateTime) -> BillingResult<u64>;
}

/// Counter values of one quota period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaCounters {
    pub tenant_id: TenantId,
    pub period_key: PeriodKey,
    pub events_created: u64,
    pub invitations_sent: u64,
}

impl QuotaCounters {
    pub fn used(&self, kind: QuotaKind) -> u64 {
        match kind {
            QuotaKind::Events => self.events_created,
            QuotaKind::Invitations => self.invitations_sent,
        }
    }
}

/// Result of a conditional increment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed { period_key: PeriodKey, used: u64 },
    Rejected { period_key: PeriodKey, used: u64 },
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Atomically add `amount` to the tenant's current counter when the result stays
    /// within `limit`. A tenant without a current period starts one at `period`.
    async fn try_consume(
        &self,
        tenant_id: TenantId,
        kind: QuotaKind,
        amount: u64,
        limit: QuotaLimit,
        period: &PeriodKey,
    ) -> BillingResult<ConsumeOutcome>;

    /// Counters of the tenant's current period, if any usage was ever recorded
    async fn current(&self, tenant_id: TenantId) -> BillingResult<Option<QuotaCounters>>;

    /// Close every current period older than `period` and open a zeroed one in its place
    async fn roll_periods(&self, period: &PeriodKey) -> BillingResult<u64>;
}
