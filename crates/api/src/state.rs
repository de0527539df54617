//! Application state

use std::sync::Arc;

use sqlx::PgPool;
use teamride_billing::BillingService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// `None` when running on in-memory stores
    pub pool: Option<PgPool>,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, billing: BillingService) -> Self {
        Self {
            pool: Some(pool),
            billing: Arc::new(billing),
        }
    }

    /// State without a database, for tests and local demos
    pub fn in_memory(billing: BillingService) -> Self {
        Self {
            pool: None,
            billing: Arc::new(billing),
        }
    }
}
