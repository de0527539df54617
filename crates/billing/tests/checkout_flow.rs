//! Checkout Orchestration Integration Tests
//!
//! ## Test Coverage
//!
//! - Free plan applies without touching the payment provider, also before provisioning
//! - Paid plans redirect and leave the subscription untouched
//! - One provider customer per tenant, also under concurrent checkouts
//! - Provider outages surface as `PaymentProviderUnavailable`
//! - Cancellation at period end
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p teamride-billing --test checkout_flow
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use teamride_billing::{BillingError, CheckoutMode, CheckoutOutcome};
use teamride_shared::{SubscriptionStatus, TenantId};
use tokio::sync::Barrier;

use common::{customer_for, harness};

// =============================================================================
// Free plan
// =============================================================================

#[tokio::test]
async fn test_free_plan_applies_immediately() {
    let h = harness();
    let tenant = h.tenant().await;

    let outcome = h.billing.checkout.start_checkout(tenant, "free").await.unwrap();

    match outcome {
        CheckoutOutcome::FreePlanApplied { subscription } => {
            assert_eq!(subscription.plan_id, "free");
            assert_eq!(subscription.status, SubscriptionStatus::Active);
        }
        other => panic!("expected free plan, got {:?}", other),
    }
    assert_eq!(h.provider.lookups(), 0);
    assert_eq!(h.provider.customers_created(), 0);
    assert!(h.provider.sessions().is_empty());
}

#[tokio::test]
async fn test_free_plan_for_unprovisioned_tenant_creates_record() {
    let h = harness();
    let tenant = TenantId::new();

    let outcome = h.billing.checkout.start_checkout(tenant, "free").await.unwrap();
    let CheckoutOutcome::FreePlanApplied { subscription } = outcome else {
        panic!("expected free plan");
    };
    assert_eq!(subscription.tenant_id, tenant);
    assert_eq!(subscription.plan_id, "free");
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert!(subscription.period_end.is_none());
    assert!(subscription.billing_email.is_none());

    // Paid checkout needs an email for the provider customer
    let err = h.billing.checkout.start_checkout(tenant, "club").await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidInput(_)));
    assert!(h.provider.sessions().is_empty());

    // Signup completing later fills the email in
    let provisioned = h
        .billing
        .subscriptions
        .ensure_subscription(tenant, "coach@example.com")
        .await
        .unwrap();
    assert_eq!(provisioned.billing_email.as_deref(), Some("coach@example.com"));
    assert_eq!(provisioned.plan_id, "free");
}

#[tokio::test]
async fn test_downgrade_to_free_clears_provider_refs() {
    let mut h = harness();
    let tenant = h.tenant().await;
    h.subscribe(tenant, "club", "sub_club_1").await;
    h.drain_notifications();

    let outcome = h.billing.checkout.start_checkout(tenant, "FREE").await.unwrap();
    let CheckoutOutcome::FreePlanApplied { subscription } = outcome else {
        panic!("expected free plan");
    };

    assert_eq!(subscription.plan_id, "free");
    assert!(subscription.external_subscription_ref.is_none());
    assert!(subscription.period_end.is_none());
    assert!(h.provider.cancellations().is_empty());

    let changes = h.drain_notifications();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].old_state.plan_id, "club");
    assert_eq!(changes[0].new_state.plan_id, "free");
}

// =============================================================================
// Paid plans
// =============================================================================

#[tokio::test]
async fn test_paid_plan_redirects_without_changing_subscription() {
    let h = harness();
    let tenant = h.tenant().await;
    let before = h.billing.subscriptions.get_subscription(tenant).await.unwrap();

    let outcome = h.billing.checkout.start_checkout(tenant, "club").await.unwrap();

    let CheckoutOutcome::ExternalRedirect {
        redirect_url,
        session_ref,
    } = outcome
    else {
        panic!("expected redirect");
    };
    assert!(redirect_url.starts_with("https://checkout.stripe.test/pay/"));
    assert!(redirect_url.ends_with(&session_ref));

    let after = h.billing.subscriptions.get_subscription(tenant).await.unwrap();
    assert_eq!(after.plan_id, before.plan_id);
    assert_eq!(after.status, SubscriptionStatus::Active);
    assert_eq!(after.external_customer_ref.as_deref(), Some("cus_test_1"));

    let sessions = h.provider.sessions();
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(session.tenant_id, tenant);
    assert_eq!(session.plan_id, "club");
    assert_eq!(session.price_ref, "price_club_monthly");
    assert_eq!(session.mode, CheckoutMode::Subscription);
    assert_eq!(session.customer_ref, "cus_test_1");
    assert!(session
        .success_url
        .starts_with("https://app.teamride.test/billing/success"));
    assert_eq!(session.cancel_url, "https://app.teamride.test/billing/cancel");
}

#[tokio::test]
async fn test_one_time_plan_uses_payment_mode() {
    let h = harness();
    let tenant = h.tenant().await;

    h.billing
        .checkout
        .start_checkout(tenant, "season_pass")
        .await
        .unwrap();

    let sessions = h.provider.sessions();
    assert_eq!(sessions[0].mode, CheckoutMode::Payment);
    assert_eq!(sessions[0].price_ref, "price_season_pass");
}

#[tokio::test]
async fn test_repeated_checkout_reuses_customer() {
    let h = harness();
    let tenant = h.tenant().await;

    for plan in ["club", "club", "league"] {
        h.billing.checkout.start_checkout(tenant, plan).await.unwrap();
    }

    assert_eq!(h.provider.customers_created(), 1);
    // Only the first checkout had to look the customer up
    assert_eq!(h.provider.lookups(), 1);
    assert_eq!(h.provider.sessions().len(), 3);

    let idempotency_keys: std::collections::HashSet<_> = h
        .provider
        .sessions()
        .into_iter()
        .map(|s| s.idempotency_key)
        .collect();
    assert_eq!(idempotency_keys.len(), 3, "each session is a distinct request");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checkouts_create_one_customer() {
    let h = harness();
    let tenant = h.tenant().await;

    let barrier = Arc::new(Barrier::new(5));
    let mut handles = Vec::new();
    for _ in 0..5 {
        let checkout = h.billing.checkout.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            checkout.start_checkout(tenant, "club").await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(h.provider.customers_created(), 1);
    let stored = h.billing.subscriptions.get_subscription(tenant).await.unwrap();
    assert_eq!(stored.external_customer_ref.as_deref(), Some("cus_test_1"));
    assert!(h
        .provider
        .sessions()
        .iter()
        .all(|s| s.customer_ref == "cus_test_1"));
}

#[tokio::test]
async fn test_existing_provider_customer_is_adopted() {
    let h = harness();
    let tenant = h.tenant().await;
    h.provider.seed_customer(tenant, "cus_from_earlier_plan");

    h.billing.checkout.start_checkout(tenant, "club").await.unwrap();

    assert_eq!(h.provider.customers_created(), 0);
    let stored = h.billing.subscriptions.get_subscription(tenant).await.unwrap();
    assert_eq!(
        stored.external_customer_ref.as_deref(),
        Some("cus_from_earlier_plan")
    );
}

#[tokio::test]
async fn test_upgrade_uses_customer_from_activation() {
    let h = harness();
    let tenant = h.tenant().await;
    h.subscribe(tenant, "club", "sub_club_1").await;

    h.billing.checkout.start_checkout(tenant, "league").await.unwrap();

    assert_eq!(h.provider.lookups(), 0);
    assert_eq!(h.provider.sessions()[0].customer_ref, customer_for(tenant));
}

// =============================================================================
// Errors
// =============================================================================

#[tokio::test]
async fn test_unknown_plan_is_invalid() {
    let h = harness();
    let tenant = h.tenant().await;

    let err = h
        .billing
        .checkout
        .start_checkout(tenant, "platinum")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidPlan(plan) if plan == "platinum"));
    assert!(h.provider.sessions().is_empty());
}

#[tokio::test]
async fn test_unknown_tenant_is_rejected() {
    let h = harness();

    let err = h
        .billing
        .checkout
        .start_checkout(TenantId::new(), "club")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::UnknownTenant(_)));
}

#[tokio::test]
async fn test_provider_outage_leaves_state_untouched() {
    let h = harness();
    let tenant = h.tenant().await;
    let before = h.billing.subscriptions.get_subscription(tenant).await.unwrap();
    h.provider.set_unavailable(true);

    let err = h
        .billing
        .checkout
        .start_checkout(tenant, "club")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::PaymentProviderUnavailable(_)));
    assert!(err.is_retryable());

    let after = h.billing.subscriptions.get_subscription(tenant).await.unwrap();
    assert_eq!(after, before);

    // Recovers once the provider is back
    h.provider.set_unavailable(false);
    let outcome = h.billing.checkout.start_checkout(tenant, "club").await.unwrap();
    assert!(matches!(outcome, CheckoutOutcome::ExternalRedirect { .. }));
}

#[tokio::test]
async fn test_checkout_for_current_plan_is_refused() {
    let h = harness();
    let tenant = h.tenant().await;
    h.subscribe(tenant, "club", "sub_club_1").await;

    let err = h
        .billing
        .checkout
        .start_checkout(tenant, "club")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition(_)));
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancel_schedules_end_of_period() {
    let h = harness();
    let tenant = h.tenant().await;
    h.subscribe(tenant, "club", "sub_club_1").await;

    let updated = h.billing.checkout.cancel_subscription(tenant).await.unwrap();

    assert!(updated.cancel_at_period_end);
    assert_eq!(updated.status, SubscriptionStatus::Active);
    assert_eq!(updated.plan_id, "club");
    assert_eq!(h.provider.cancellations(), vec!["sub_club_1".to_string()]);

    // Cancelling twice does not call the provider again
    h.billing.checkout.cancel_subscription(tenant).await.unwrap();
    assert_eq!(h.provider.cancellations().len(), 1);
}

#[tokio::test]
async fn test_cancel_free_plan_is_invalid() {
    let h = harness();
    let tenant = h.tenant().await;

    let err = h
        .billing
        .checkout
        .cancel_subscription(tenant)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition(_)));
    assert!(h.provider.cancellations().is_empty());
}

#[tokio::test]
async fn test_cancel_during_outage_keeps_subscription_renewing() {
    let h = harness();
    let tenant = h.tenant().await;
    h.subscribe(tenant, "club", "sub_club_1").await;
    h.provider.set_unavailable(true);

    let err = h
        .billing
        .checkout
        .cancel_subscription(tenant)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::PaymentProviderUnavailable(_)));

    let stored = h.billing.subscriptions.get_subscription(tenant).await.unwrap();
    assert!(!stored.cancel_at_period_end);
}
