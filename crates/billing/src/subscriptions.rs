//! Subscription state store
//!
//! One record per tenant. Every change is expressed as a [`SubscriptionCommand`]
//! evaluated against the locked current record, so concurrent writers (webhooks,
//! checkout, sweeps) serialize per tenant.
//!
//! ```text
//!            user cancel, period elapsed
//!   active ──────────────────────────────▶ cancelled
//!     │  ▲
//!     │  │ renewal paid
//!     ▼  │
//!   past_due ──── grace elapsed ─────────▶ expired
//!
//!   any ── provider deletion ──▶ expired     any ── free plan ──▶ active
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use teamride_shared::{QuotaKind, QuotaLimit, SubscriptionStatus, TenantId};
use time::{Duration, OffsetDateTime};

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::notify::{SubscriptionChange, SubscriptionNotifier};
use crate::store::{ProcessedEvent, SubscriptionStore, UpdateOutcome};

// =============================================================================
// Records
// =============================================================================

/// Billing state of one tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TenantSubscription {
    pub tenant_id: TenantId,
    /// Unset for tenants that picked the free plan before being provisioned
    pub billing_email: Option<String>,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub external_customer_ref: Option<String>,
    pub external_subscription_ref: Option<String>,
    pub last_external_session_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub past_due_since: Option<OffsetDateTime>,
    /// Creation time of the newest provider event applied to this record
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_provider_event_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl TenantSubscription {
    /// A fresh tenant on the free plan with no provider references
    pub fn new_free(
        tenant_id: TenantId,
        billing_email: &str,
        free_plan_id: &str,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            billing_email: Some(billing_email.trim().to_string()),
            ..Self::default_free(tenant_id, free_plan_id, now)
        }
    }

    /// The free, active, perpetual record a tenant has before anything else happens
    pub fn default_free(tenant_id: TenantId, free_plan_id: &str, now: OffsetDateTime) -> Self {
        Self {
            tenant_id,
            billing_email: None,
            plan_id: free_plan_id.to_string(),
            status: SubscriptionStatus::Active,
            external_customer_ref: None,
            external_subscription_ref: None,
            last_external_session_ref: None,
            period_start: None,
            period_end: None,
            cancel_at_period_end: false,
            past_due_since: None,
            last_provider_event_at: None,
            updated_at: now,
        }
    }

    fn tracks_subscription(&self, subscription_ref: &str) -> bool {
        self.external_subscription_ref.as_deref() == Some(subscription_ref)
    }

    /// True when a newer provider event has already been applied
    fn is_newer_than(&self, occurred_at: Option<OffsetDateTime>) -> bool {
        matches!(
            (self.last_provider_event_at, occurred_at),
            (Some(latest), Some(at)) if at < latest
        )
    }

    fn observe_provider_event(&mut self, occurred_at: Option<OffsetDateTime>) {
        if let Some(at) = occurred_at {
            if self.last_provider_event_at.map_or(true, |latest| at > latest) {
                self.last_provider_event_at = Some(at);
            }
        }
    }
}

/// Limits that quota enforcement applies right now.
///
/// `displayed_plan_id` is what the tenant subscribed to; `enforced_plan_id` is the
/// plan whose limits apply, which falls back to the free plan whenever the
/// subscription is not active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveLimits {
    pub tenant_id: TenantId,
    pub displayed_plan_id: String,
    pub enforced_plan_id: String,
    pub status: SubscriptionStatus,
    pub max_events_per_period: QuotaLimit,
    pub max_invitations_per_period: QuotaLimit,
}

impl EffectiveLimits {
    pub fn limit_for(&self, kind: QuotaKind) -> QuotaLimit {
        match kind {
            QuotaKind::Events => self.max_events_per_period,
            QuotaKind::Invitations => self.max_invitations_per_period,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.displayed_plan_id != self.enforced_plan_id
    }
}

/// Provider-confirmed activation of a paid plan.
///
/// Only constructed from verified payment events, which keeps paid plans from
/// being applied without a confirmed payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaidActivation {
    pub(crate) plan_id: String,
    pub(crate) customer_ref: Option<String>,
    pub(crate) subscription_ref: Option<String>,
    pub(crate) session_ref: Option<String>,
    pub(crate) occurred_at: Option<OffsetDateTime>,
}

impl PaidActivation {
    pub(crate) fn new(
        plan_id: impl Into<String>,
        customer_ref: Option<String>,
        subscription_ref: Option<String>,
        session_ref: Option<String>,
    ) -> Self {
        Self {
            plan_id: plan_id.into(),
            customer_ref,
            subscription_ref,
            session_ref,
            occurred_at: None,
        }
    }

    /// Provider creation time of the confirming event
    pub(crate) fn occurred_at(mut self, occurred_at: Option<OffsetDateTime>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }
}

// =============================================================================
// State machine
// =============================================================================

/// Outcome of evaluating a command against the current record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Changed(TenantSubscription),
    Unchanged,
}

/// Every way a subscription record can change.
///
/// Provider-driven commands carry the provider's creation time of the event
/// (`occurred_at`), since deliveries may arrive out of order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionCommand {
    SelectFreePlan,
    ActivatePaidPlan(PaidActivation),
    AttachCustomer { customer_ref: String },
    AttachBillingEmail { email: String },
    RenewalSucceeded {
        subscription_ref: String,
        occurred_at: Option<OffsetDateTime>,
    },
    RenewalFailed {
        subscription_ref: String,
        occurred_at: Option<OffsetDateTime>,
    },
    ProviderDeleted {
        subscription_ref: String,
        occurred_at: Option<OffsetDateTime>,
    },
    ProviderUpdated {
        subscription_ref: String,
        cancel_at_period_end: bool,
        occurred_at: Option<OffsetDateTime>,
    },
    RequestCancellation,
    Sweep { past_due_grace: Duration },
}

impl SubscriptionCommand {
    /// Compute the next record. Pure; persistence is the caller's job.
    ///
    /// Events that refer to a provider subscription other than the tenant's current
    /// one are stale and leave the record unchanged.
    pub fn apply(
        &self,
        current: &TenantSubscription,
        catalog: &PlanCatalog,
        now: OffsetDateTime,
    ) -> BillingResult<Transition> {
        let mut next = current.clone();

        match self {
            Self::SelectFreePlan => {
                next.plan_id = catalog.free_plan().plan_id.clone();
                next.status = SubscriptionStatus::Active;
                next.external_customer_ref = None;
                next.external_subscription_ref = None;
                next.last_external_session_ref = None;
                next.period_start = None;
                next.period_end = None;
                next.cancel_at_period_end = false;
                next.past_due_since = None;
            }

            Self::ActivatePaidPlan(activation) => {
                let plan = catalog.require(&activation.plan_id)?;
                let length = plan.billing_interval.period_length().ok_or_else(|| {
                    BillingError::InvalidTransition(format!(
                        "plan {} cannot be activated by payment",
                        plan.plan_id
                    ))
                })?;
                let recurring = plan.billing_interval.is_recurring();
                if recurring && activation.subscription_ref.is_none() {
                    return Err(BillingError::InvalidTransition(format!(
                        "recurring plan {} confirmed without a provider subscription",
                        plan.plan_id
                    )));
                }

                next.plan_id = plan.plan_id.clone();
                next.status = SubscriptionStatus::Active;
                if activation.customer_ref.is_some() {
                    next.external_customer_ref = activation.customer_ref.clone();
                }
                next.external_subscription_ref = if recurring {
                    activation.subscription_ref.clone()
                } else {
                    None
                };
                next.last_external_session_ref = activation.session_ref.clone();
                next.period_start = Some(now);
                next.period_end = Some(now + length);
                next.cancel_at_period_end = false;
                next.past_due_since = None;
                next.observe_provider_event(activation.occurred_at);
            }

            Self::AttachCustomer { customer_ref } => {
                if current.external_customer_ref.is_some() {
                    return Ok(Transition::Unchanged);
                }
                next.external_customer_ref = Some(customer_ref.clone());
            }

            Self::AttachBillingEmail { email } => {
                if current.billing_email.is_some() {
                    return Ok(Transition::Unchanged);
                }
                next.billing_email = Some(email.clone());
            }

            Self::RenewalSucceeded {
                subscription_ref,
                occurred_at,
            } => {
                // Lapsed records only come back through a new checkout
                if !current.tracks_subscription(subscription_ref)
                    || !matches!(
                        current.status,
                        SubscriptionStatus::Active | SubscriptionStatus::PastDue
                    )
                {
                    return Ok(Transition::Unchanged);
                }
                let plan = catalog.require(&current.plan_id)?;
                let length = plan.billing_interval.period_length().ok_or_else(|| {
                    BillingError::InvalidTransition(format!(
                        "plan {} does not renew",
                        plan.plan_id
                    ))
                })?;
                let base = current.period_end.unwrap_or(now);
                next.period_start = Some(base);
                next.period_end = Some(base + length);
                // A late payment still pays its period, but a newer failure keeps the
                // record past due
                if !current.is_newer_than(*occurred_at) {
                    next.status = SubscriptionStatus::Active;
                    next.past_due_since = None;
                }
                next.observe_provider_event(*occurred_at);
            }

            Self::RenewalFailed {
                subscription_ref,
                occurred_at,
            } => {
                if !current.tracks_subscription(subscription_ref)
                    || current.status != SubscriptionStatus::Active
                    || current.is_newer_than(*occurred_at)
                {
                    return Ok(Transition::Unchanged);
                }
                next.status = SubscriptionStatus::PastDue;
                next.past_due_since = Some(now);
                next.observe_provider_event(*occurred_at);
            }

            Self::ProviderDeleted {
                subscription_ref,
                occurred_at,
            } => {
                // Deletion is final on the provider side, whatever order it arrives in
                if !current.tracks_subscription(subscription_ref)
                    || current.status == SubscriptionStatus::Expired
                {
                    return Ok(Transition::Unchanged);
                }
                next.status = SubscriptionStatus::Expired;
                next.cancel_at_period_end = false;
                next.past_due_since = None;
                next.observe_provider_event(*occurred_at);
            }

            Self::ProviderUpdated {
                subscription_ref,
                cancel_at_period_end,
                occurred_at,
            } => {
                if !current.tracks_subscription(subscription_ref)
                    || current.status != SubscriptionStatus::Active
                    || current.is_newer_than(*occurred_at)
                {
                    return Ok(Transition::Unchanged);
                }
                next.cancel_at_period_end = *cancel_at_period_end;
                next.observe_provider_event(*occurred_at);
            }

            Self::RequestCancellation => {
                if current.status != SubscriptionStatus::Active {
                    return Err(BillingError::InvalidTransition(format!(
                        "cannot cancel a {} subscription",
                        current.status
                    )));
                }
                if current.external_subscription_ref.is_none() {
                    return Err(BillingError::InvalidTransition(
                        "only recurring plans can be cancelled".to_string(),
                    ));
                }
                next.cancel_at_period_end = true;
            }

            Self::Sweep { past_due_grace } => match current.status {
                SubscriptionStatus::Active => match current.period_end {
                    Some(end) if end <= now => {
                        if current.cancel_at_period_end {
                            next.status = SubscriptionStatus::Cancelled;
                        } else if current.external_subscription_ref.is_none() {
                            // One-time package ran out
                            next.status = SubscriptionStatus::Expired;
                        } else {
                            // Recurring: the renewal event decides
                            return Ok(Transition::Unchanged);
                        }
                    }
                    _ => return Ok(Transition::Unchanged),
                },
                SubscriptionStatus::PastDue => match current.past_due_since {
                    Some(since) if since + *past_due_grace <= now => {
                        next.status = SubscriptionStatus::Expired;
                    }
                    _ => return Ok(Transition::Unchanged),
                },
                SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => {
                    return Ok(Transition::Unchanged)
                }
            },
        }

        if next == *current {
            return Ok(Transition::Unchanged);
        }
        next.updated_at = now;
        Ok(Transition::Changed(next))
    }
}

// =============================================================================
// Service
// =============================================================================

/// Reads and mutates tenant subscriptions
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    catalog: Arc<PlanCatalog>,
    notifier: Arc<dyn SubscriptionNotifier>,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        catalog: Arc<PlanCatalog>,
        notifier: Arc<dyn SubscriptionNotifier>,
    ) -> Self {
        Self {
            store,
            catalog,
            notifier,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Create the tenant's record on the free plan if it does not exist yet
    pub async fn ensure_subscription(
        &self,
        tenant_id: TenantId,
        billing_email: &str,
    ) -> BillingResult<TenantSubscription> {
        let email = billing_email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(BillingError::InvalidInput(format!(
                "invalid billing email: {}",
                billing_email
            )));
        }

        let record = TenantSubscription::new_free(
            tenant_id,
            email,
            &self.catalog.free_plan().plan_id,
            OffsetDateTime::now_utc(),
        );
        let mut stored = self.store.insert_if_absent(record).await?;

        // Created earlier by a free-plan checkout, before signup completed
        if stored.billing_email.is_none() {
            stored = self
                .execute_expecting_record(
                    tenant_id,
                    SubscriptionCommand::AttachBillingEmail {
                        email: email.to_string(),
                    },
                )
                .await?;
        }

        tracing::debug!(tenant_id = %tenant_id, plan_id = %stored.plan_id, "Tenant subscription ensured");
        Ok(stored)
    }

    pub async fn get_subscription(&self, tenant_id: TenantId) -> BillingResult<TenantSubscription> {
        self.store
            .get(tenant_id)
            .await?
            .ok_or(BillingError::UnknownTenant(tenant_id))
    }

    pub async fn get_effective_limits(&self, tenant_id: TenantId) -> BillingResult<EffectiveLimits> {
        let subscription = self.get_subscription(tenant_id).await?;
        Ok(self.limits_for(&subscription))
    }

    /// Limits for a record: the subscribed plan's while active, the free plan's otherwise
    pub fn limits_for(&self, subscription: &TenantSubscription) -> EffectiveLimits {
        let free = self.catalog.free_plan();
        let enforced = match self.catalog.get(&subscription.plan_id) {
            Some(plan) if subscription.status.enforces_plan_limits() => plan,
            Some(_) => free,
            None => {
                tracing::warn!(
                    tenant_id = %subscription.tenant_id,
                    plan_id = %subscription.plan_id,
                    "Subscribed plan missing from catalog, enforcing free limits"
                );
                free
            }
        };

        EffectiveLimits {
            tenant_id: subscription.tenant_id,
            displayed_plan_id: subscription.plan_id.clone(),
            enforced_plan_id: enforced.plan_id.clone(),
            status: subscription.status,
            max_events_per_period: enforced.max_events_per_period,
            max_invitations_per_period: enforced.max_invitations_per_period,
        }
    }

    /// Move a tenant to another plan.
    ///
    /// The free plan applies immediately, creating the tenant's record if it has
    /// none yet. Paid plans need a provider-confirmed [`PaidActivation`] for the
    /// same plan.
    pub async fn apply_plan_change(
        &self,
        tenant_id: TenantId,
        plan_id: &str,
        activation: Option<PaidActivation>,
    ) -> BillingResult<TenantSubscription> {
        let plan = self.catalog.require(plan_id)?;

        let command = if plan.is_free() {
            let default = TenantSubscription::default_free(
                tenant_id,
                &plan.plan_id,
                OffsetDateTime::now_utc(),
            );
            self.store.insert_if_absent(default).await?;
            SubscriptionCommand::SelectFreePlan
        } else {
            match activation {
                Some(activation) if activation.plan_id.eq_ignore_ascii_case(&plan.plan_id) => {
                    SubscriptionCommand::ActivatePaidPlan(activation)
                }
                Some(activation) => {
                    return Err(BillingError::InvalidInput(format!(
                        "activation for plan {} cannot apply plan {}",
                        activation.plan_id, plan.plan_id
                    )))
                }
                None => {
                    return Err(BillingError::InvalidTransition(format!(
                        "plan {} requires a confirmed payment",
                        plan.plan_id
                    )))
                }
            }
        };

        self.execute_expecting_record(tenant_id, command).await
    }

    /// Flag the tenant's recurring subscription to end with the current period
    pub async fn request_cancellation(&self, tenant_id: TenantId) -> BillingResult<TenantSubscription> {
        self.execute_expecting_record(tenant_id, SubscriptionCommand::RequestCancellation)
            .await
    }

    /// Store the provider customer unless one is already attached; returns the winner's record
    pub(crate) async fn attach_customer(
        &self,
        tenant_id: TenantId,
        customer_ref: &str,
    ) -> BillingResult<TenantSubscription> {
        self.execute_expecting_record(
            tenant_id,
            SubscriptionCommand::AttachCustomer {
                customer_ref: customer_ref.to_string(),
            },
        )
        .await
    }

    pub(crate) async fn find_tenant(
        &self,
        subscription_ref: Option<&str>,
        customer_ref: Option<&str>,
    ) -> BillingResult<Option<TenantId>> {
        if let Some(subscription_ref) = subscription_ref {
            if let Some(tenant_id) = self.store.find_by_subscription_ref(subscription_ref).await? {
                return Ok(Some(tenant_id));
            }
        }
        if let Some(customer_ref) = customer_ref {
            return self.store.find_by_customer_ref(customer_ref).await;
        }
        Ok(None)
    }

    pub(crate) fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    /// Evaluate a command against the locked record and persist the result.
    ///
    /// With an event, the event id is recorded in the same unit of work.
    pub(crate) async fn execute(
        &self,
        tenant_id: TenantId,
        command: SubscriptionCommand,
        event: Option<&ProcessedEvent>,
        now: OffsetDateTime,
    ) -> BillingResult<UpdateOutcome> {
        let catalog = Arc::clone(&self.catalog);
        let mutation =
            move |current: &TenantSubscription| command.apply(current, &catalog, now);

        let outcome = self.store.update(tenant_id, &mutation, event).await?;

        if let UpdateOutcome::Applied { before, after } = &outcome {
            tracing::info!(
                tenant_id = %tenant_id,
                plan_id = %after.plan_id,
                status = %after.status,
                "Subscription updated"
            );
            if let Some(change) = SubscriptionChange::between(before, after) {
                self.notifier.subscription_changed(&change).await;
            }
        }

        Ok(outcome)
    }

    async fn execute_expecting_record(
        &self,
        tenant_id: TenantId,
        command: SubscriptionCommand,
    ) -> BillingResult<TenantSubscription> {
        match self
            .execute(tenant_id, command, None, OffsetDateTime::now_utc())
            .await?
        {
            UpdateOutcome::Applied { after, .. } => Ok(after),
            UpdateOutcome::Unchanged(current) => Ok(current),
            UpdateOutcome::DuplicateEvent => Err(BillingError::Internal(
                "duplicate event reported for an update without an event".to_string(),
            )),
        }
    }
}
