//! API routes

pub mod billing;
pub mod health;
pub mod tenants;
pub mod usage;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Stripe event payloads stay well below this
const WEBHOOK_BODY_LIMIT: usize = 256 * 1024;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let billing_routes = Router::new()
        .route("/plans", get(billing::list_plans))
        .route("/checkout", post(billing::create_checkout))
        .route("/subscription/:tenant_id", get(billing::get_subscription))
        .route("/limits/:tenant_id", get(billing::get_limits))
        .route("/cancel/:tenant_id", post(billing::cancel_subscription))
        .route(
            "/webhook",
            post(billing::webhook).layer(DefaultBodyLimit::max(WEBHOOK_BODY_LIMIT)),
        );

    let usage_routes = Router::new()
        .route("/consume", post(usage::consume))
        .route("/:tenant_id", get(usage::get_usage));

    let api_routes = Router::new()
        .nest("/billing", billing_routes)
        .nest("/usage", usage_routes)
        .route("/tenants", post(tenants::provision));

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_routes)
        .with_state(state)
}
