//! Payment provider webhook reconciliation
//!
//! Verifies the `Stripe-Signature` header before the body is parsed, ignores event
//! ids that were already applied, maps the event onto a [`SubscriptionCommand`] and
//! applies it together with the event id in one unit of work. Failed events are not
//! recorded, so the provider's redelivery gets another chance.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use teamride_shared::TenantId;
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::provider::{CheckoutMode, METADATA_PLAN_ID, METADATA_TENANT_ID};
use crate::store::{ProcessedEvent, UpdateOutcome};
use crate::subscriptions::{PaidActivation, SubscriptionCommand, SubscriptionService};

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted age of a signed payload
pub const DEFAULT_SIGNATURE_TOLERANCE: Duration = Duration::seconds(300);

// =============================================================================
// Signatures
// =============================================================================

/// Hex HMAC-SHA256 of `"{timestamp}.{payload}"`
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Build a `t=...,v1=...` header for a payload
pub fn signature_header(secret: &str, timestamp: i64, payload: &[u8]) -> BillingResult<String> {
    Ok(format!(
        "t={},v1={}",
        timestamp,
        compute_signature(secret, timestamp, payload)?
    ))
}

/// Check a `t=...,v1=...` header against the raw payload.
///
/// Any of several `v1` entries may match (secret rotation). Comparison is constant time.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance: Duration,
    now: OffsetDateTime,
) -> BillingResult<()> {
    if secret.is_empty() {
        return Err(BillingError::InvalidSignature);
    }

    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::InvalidSignature)?;
    if candidates.is_empty() {
        return Err(BillingError::InvalidSignature);
    }

    let age = (now.unix_timestamp() - timestamp).abs();
    if age > tolerance.whole_seconds() {
        tracing::warn!(timestamp, age, "Webhook timestamp outside tolerance");
        return Err(BillingError::InvalidSignature);
    }

    let expected = compute_signature(secret, timestamp, payload)?;
    let matched = candidates
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));

    if matched {
        Ok(())
    } else {
        Err(BillingError::InvalidSignature)
    }
}

// =============================================================================
// Event parsing
// =============================================================================

/// Outer shape shared by every provider event
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds at which the provider created the event
    #[serde(default)]
    pub created: Option<i64>,
    pub data: EnvelopeData,
}

impl WebhookEnvelope {
    /// Creation time, used to order deliveries that arrive out of sequence
    pub fn occurred_at(&self) -> Option<OffsetDateTime> {
        self.created
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeData {
    pub object: serde_json::Value,
}

/// A reference that the provider sends either as an id or as an expanded object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    fn into_id(self) -> String {
        match self {
            Self::Id(id) | Self::Object { id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    id: String,
    mode: Option<String>,
    payment_status: Option<String>,
    customer: Option<Expandable>,
    subscription: Option<Expandable>,
    client_reference_id: Option<String>,
    metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    billing_reason: Option<String>,
    customer: Option<Expandable>,
    subscription: Option<Expandable>,
    subscription_details: Option<SubscriptionDetails>,
    parent: Option<InvoiceParent>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionDetails {
    subscription: Option<Expandable>,
    metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct InvoiceParent {
    subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: Option<Expandable>,
    #[serde(default)]
    cancel_at_period_end: bool,
    metadata: Option<HashMap<String, String>>,
}

fn tenant_from_metadata(metadata: Option<&HashMap<String, String>>) -> Option<TenantId> {
    metadata?.get(METADATA_TENANT_ID)?.parse().ok()
}

/// A confirmed checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutCompletion {
    pub session_ref: String,
    pub mode: CheckoutMode,
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub tenant_hint: Option<TenantId>,
    pub plan_id: Option<String>,
}

/// Identifies the tenant a subscription-level event belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionLink {
    pub subscription_ref: String,
    pub customer_ref: Option<String>,
    pub tenant_hint: Option<TenantId>,
}

/// Provider events the reconciler understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    CheckoutCompleted(CheckoutCompletion),
    RenewalSucceeded(SubscriptionLink),
    RenewalFailed(SubscriptionLink),
    SubscriptionDeleted(SubscriptionLink),
    SubscriptionUpdated {
        link: SubscriptionLink,
        cancel_at_period_end: bool,
    },
    Ignored { reason: &'static str },
}

impl ProviderEvent {
    /// Dispatch on the event type and decode its object
    pub fn parse(envelope: &WebhookEnvelope) -> BillingResult<Self> {
        match envelope.event_type.as_str() {
            "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
                Self::parse_checkout(&envelope.data.object)
            }
            // Sent alongside invoice.paid for the same invoice; handling both would
            // extend the period twice
            "invoice.payment_succeeded" => Ok(Self::Ignored {
                reason: "handled through invoice.paid",
            }),
            "invoice.paid" => {
                let invoice: InvoiceObject = decode(&envelope.data.object)?;
                if invoice.billing_reason.as_deref() != Some("subscription_cycle") {
                    return Ok(Self::Ignored {
                        reason: "invoice is not a renewal",
                    });
                }
                Ok(match Self::invoice_link(invoice) {
                    Some(link) => Self::RenewalSucceeded(link),
                    None => Self::Ignored {
                        reason: "invoice without subscription",
                    },
                })
            }
            "invoice.payment_failed" => {
                let invoice: InvoiceObject = decode(&envelope.data.object)?;
                // A failed first invoice never completes checkout
                if invoice.billing_reason.as_deref() == Some("subscription_create") {
                    return Ok(Self::Ignored {
                        reason: "initial invoice failure",
                    });
                }
                Ok(match Self::invoice_link(invoice) {
                    Some(link) => Self::RenewalFailed(link),
                    None => Self::Ignored {
                        reason: "invoice without subscription",
                    },
                })
            }
            "customer.subscription.deleted" => {
                let subscription: SubscriptionObject = decode(&envelope.data.object)?;
                Ok(Self::SubscriptionDeleted(Self::subscription_link(subscription).0))
            }
            "customer.subscription.updated" => {
                let subscription: SubscriptionObject = decode(&envelope.data.object)?;
                let (link, cancel_at_period_end) = Self::subscription_link(subscription);
                Ok(Self::SubscriptionUpdated {
                    link,
                    cancel_at_period_end,
                })
            }
            _ => Ok(Self::Ignored {
                reason: "unhandled event type",
            }),
        }
    }

    fn parse_checkout(object: &serde_json::Value) -> BillingResult<Self> {
        let session: CheckoutSessionObject = decode(object)?;

        let mode = match session.mode.as_deref() {
            Some("payment") => CheckoutMode::Payment,
            Some("subscription") => CheckoutMode::Subscription,
            _ => {
                return Ok(Self::Ignored {
                    reason: "checkout mode not billed",
                })
            }
        };
        if !matches!(
            session.payment_status.as_deref(),
            Some("paid") | Some("no_payment_required")
        ) {
            return Ok(Self::Ignored {
                reason: "checkout payment not settled",
            });
        }

        let tenant_hint = tenant_from_metadata(session.metadata.as_ref()).or_else(|| {
            session
                .client_reference_id
                .as_deref()
                .and_then(|id| id.parse().ok())
        });
        let plan_id = session
            .metadata
            .as_ref()
            .and_then(|m| m.get(METADATA_PLAN_ID))
            .cloned();

        Ok(Self::CheckoutCompleted(CheckoutCompletion {
            session_ref: session.id,
            mode,
            customer_ref: session.customer.map(Expandable::into_id),
            subscription_ref: session.subscription.map(Expandable::into_id),
            tenant_hint,
            plan_id,
        }))
    }

    fn invoice_link(invoice: InvoiceObject) -> Option<SubscriptionLink> {
        let parent_details = invoice.parent.and_then(|p| p.subscription_details);
        let tenant_hint = tenant_from_metadata(
            invoice
                .subscription_details
                .as_ref()
                .and_then(|d| d.metadata.as_ref()),
        )
        .or_else(|| tenant_from_metadata(parent_details.as_ref().and_then(|d| d.metadata.as_ref())));

        // Newer API versions moved the subscription under `parent`
        let subscription_ref = invoice
            .subscription
            .or_else(|| parent_details.and_then(|d| d.subscription))
            .or_else(|| invoice.subscription_details.and_then(|d| d.subscription))?
            .into_id();

        Some(SubscriptionLink {
            subscription_ref,
            customer_ref: invoice.customer.map(Expandable::into_id),
            tenant_hint,
        })
    }

    fn subscription_link(subscription: SubscriptionObject) -> (SubscriptionLink, bool) {
        let link = SubscriptionLink {
            tenant_hint: tenant_from_metadata(subscription.metadata.as_ref()),
            subscription_ref: subscription.id,
            customer_ref: subscription.customer.map(Expandable::into_id),
        };
        (link, subscription.cancel_at_period_end)
    }
}

fn decode<T: serde::de::DeserializeOwned>(object: &serde_json::Value) -> BillingResult<T> {
    T::deserialize(object)
        .map_err(|e| BillingError::ReconciliationFailed(format!("unexpected event object: {}", e)))
}

// =============================================================================
// Reconciler
// =============================================================================

/// How an accepted event was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookDisposition {
    /// The subscription changed
    Applied,
    /// Recorded without changing the subscription (stale or already in that state)
    Unchanged,
    /// Already processed earlier
    Duplicate,
    /// Event type or content the core does not act on; not recorded
    Ignored,
}

impl std::fmt::Display for WebhookDisposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Applied => write!(f, "applied"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Duplicate => write!(f, "duplicate"),
            Self::Ignored => write!(f, "ignored"),
        }
    }
}

/// Why an event was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookRejection {
    InvalidSignature,
    MalformedPayload(String),
    /// Effects could not be applied; the provider should redeliver
    ReconciliationFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Accepted(WebhookDisposition),
    Rejected(WebhookRejection),
}

/// Applies provider events to tenant subscriptions
#[derive(Clone)]
pub struct WebhookReconciler {
    subscriptions: SubscriptionService,
    webhook_secret: String,
    tolerance: Duration,
}

impl WebhookReconciler {
    pub fn new(
        subscriptions: SubscriptionService,
        webhook_secret: impl Into<String>,
        tolerance: Duration,
    ) -> Self {
        Self {
            subscriptions,
            webhook_secret: webhook_secret.into(),
            tolerance,
        }
    }

    pub async fn handle_webhook(&self, payload: &[u8], signature: &str) -> WebhookOutcome {
        self.handle_webhook_at(payload, signature, OffsetDateTime::now_utc())
            .await
    }

    /// Handle a delivery as if received at `now`
    pub async fn handle_webhook_at(
        &self,
        payload: &[u8],
        signature: &str,
        now: OffsetDateTime,
    ) -> WebhookOutcome {
        if verify_signature(payload, signature, &self.webhook_secret, self.tolerance, now).is_err() {
            tracing::warn!(payload_len = payload.len(), "Webhook signature verification failed");
            return WebhookOutcome::Rejected(WebhookRejection::InvalidSignature);
        }

        let envelope: WebhookEnvelope = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed webhook payload");
                return WebhookOutcome::Rejected(WebhookRejection::MalformedPayload(e.to_string()));
            }
        };

        match self.subscriptions.store().is_event_processed(&envelope.id).await {
            Ok(true) => {
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    "Webhook event already processed, skipping"
                );
                return WebhookOutcome::Accepted(WebhookDisposition::Duplicate);
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(event_id = %envelope.id, error = %e, "Failed to check processed events");
                return WebhookOutcome::Rejected(WebhookRejection::ReconciliationFailed(e.to_string()));
            }
        }

        let result = match ProviderEvent::parse(&envelope) {
            Ok(event) => self.reconcile(&envelope, event, now).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(disposition) => {
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    disposition = %disposition,
                    "Webhook event handled"
                );
                WebhookOutcome::Accepted(disposition)
            }
            Err(e) => {
                tracing::error!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Webhook reconciliation failed"
                );
                WebhookOutcome::Rejected(WebhookRejection::ReconciliationFailed(e.to_string()))
            }
        }
    }

    async fn reconcile(
        &self,
        envelope: &WebhookEnvelope,
        event: ProviderEvent,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookDisposition> {
        let occurred_at = envelope.occurred_at();
        let (tenant_id, command) = match event {
            ProviderEvent::Ignored { reason } => {
                tracing::debug!(event_id = %envelope.id, event_type = %envelope.event_type, reason, "Webhook event ignored");
                return Ok(WebhookDisposition::Ignored);
            }
            ProviderEvent::CheckoutCompleted(completion) => {
                let tenant_id = self
                    .resolve_tenant(completion.tenant_hint, None, completion.customer_ref.as_deref())
                    .await?;
                let plan_id = completion.plan_id.ok_or_else(|| {
                    BillingError::ReconciliationFailed(format!(
                        "checkout {} carries no plan",
                        completion.session_ref
                    ))
                })?;

                let plan = self.subscriptions.catalog().require(&plan_id)?;
                let expected = CheckoutMode::for_interval(plan.billing_interval);
                if expected != Some(completion.mode) {
                    // Acknowledged so the provider stops retrying; needs manual follow-up
                    tracing::warn!(
                        event_id = %envelope.id,
                        tenant_id = %tenant_id,
                        plan_id = %plan.plan_id,
                        session_ref = %completion.session_ref,
                        mode = ?completion.mode,
                        expected = ?expected,
                        "Checkout mode does not match plan billing interval, not activating"
                    );
                    return Ok(WebhookDisposition::Ignored);
                }

                let activation = PaidActivation::new(
                    plan_id,
                    completion.customer_ref,
                    completion.subscription_ref,
                    Some(completion.session_ref),
                )
                .occurred_at(occurred_at);
                (tenant_id, SubscriptionCommand::ActivatePaidPlan(activation))
            }
            ProviderEvent::RenewalSucceeded(link) => (
                self.resolve_link(&link).await?,
                SubscriptionCommand::RenewalSucceeded {
                    subscription_ref: link.subscription_ref,
                    occurred_at,
                },
            ),
            ProviderEvent::RenewalFailed(link) => (
                self.resolve_link(&link).await?,
                SubscriptionCommand::RenewalFailed {
                    subscription_ref: link.subscription_ref,
                    occurred_at,
                },
            ),
            ProviderEvent::SubscriptionDeleted(link) => (
                self.resolve_link(&link).await?,
                SubscriptionCommand::ProviderDeleted {
                    subscription_ref: link.subscription_ref,
                    occurred_at,
                },
            ),
            ProviderEvent::SubscriptionUpdated {
                link,
                cancel_at_period_end,
            } => (
                self.resolve_link(&link).await?,
                SubscriptionCommand::ProviderUpdated {
                    subscription_ref: link.subscription_ref,
                    cancel_at_period_end,
                    occurred_at,
                },
            ),
        };

        let record = ProcessedEvent {
            event_id: envelope.id.clone(),
            event_type: envelope.event_type.clone(),
            tenant_id: Some(tenant_id),
            processed_at: now,
        };

        let outcome = self
            .subscriptions
            .execute(tenant_id, command, Some(&record), now)
            .await?;

        Ok(match outcome {
            UpdateOutcome::Applied { .. } => WebhookDisposition::Applied,
            UpdateOutcome::Unchanged(_) => WebhookDisposition::Unchanged,
            UpdateOutcome::DuplicateEvent => WebhookDisposition::Duplicate,
        })
    }

    async fn resolve_link(&self, link: &SubscriptionLink) -> BillingResult<TenantId> {
        self.resolve_tenant(
            link.tenant_hint,
            Some(&link.subscription_ref),
            link.customer_ref.as_deref(),
        )
        .await
    }

    async fn resolve_tenant(
        &self,
        hint: Option<TenantId>,
        subscription_ref: Option<&str>,
        customer_ref: Option<&str>,
    ) -> BillingResult<TenantId> {
        if let Some(tenant_id) = hint {
            return Ok(tenant_id);
        }
        self.subscriptions
            .find_tenant(subscription_ref, customer_ref)
            .await?
            .ok_or_else(|| {
                BillingError::ReconciliationFailed(
                    "event cannot be correlated with a tenant".to_string(),
                )
            })
    }
}
