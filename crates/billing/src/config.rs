//! Billing core configuration

use std::path::PathBuf;

use time::Duration;

use crate::catalog::PlanCatalog;
use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::webhooks::DEFAULT_SIGNATURE_TOLERANCE;

/// Default grace period before a past-due subscription expires
pub const DEFAULT_PAST_DUE_GRACE_DAYS: i64 = 7;

/// Default retention of processed webhook event ids
pub const DEFAULT_EVENT_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub stripe: StripeConfig,
    /// Base URL for checkout success/cancel redirects
    pub app_base_url: String,
    pub webhook_tolerance: Duration,
    pub past_due_grace: Duration,
    pub event_retention: Duration,
    /// JSON plan catalog; the built-in catalog is used when unset
    pub catalog_path: Option<PathBuf>,
}

impl BillingConfig {
    /// Defaults for everything except the Stripe credentials
    pub fn new(stripe: StripeConfig) -> Self {
        Self {
            stripe,
            app_base_url: "http://localhost:3000".to_string(),
            webhook_tolerance: DEFAULT_SIGNATURE_TOLERANCE,
            past_due_grace: Duration::days(DEFAULT_PAST_DUE_GRACE_DAYS),
            event_retention: Duration::days(DEFAULT_EVENT_RETENTION_DAYS),
            catalog_path: None,
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let mut config = Self::new(StripeConfig::from_env()?);

        if let Ok(url) = std::env::var("APP_BASE_URL") {
            config.app_base_url = url;
        }
        if let Some(seconds) = env_i64("WEBHOOK_TOLERANCE_SECS")? {
            config.webhook_tolerance = Duration::seconds(seconds);
        }
        if let Some(days) = env_i64("PAST_DUE_GRACE_DAYS")? {
            config.past_due_grace = Duration::days(days);
        }
        if let Some(days) = env_i64("WEBHOOK_RETENTION_DAYS")? {
            config.event_retention = Duration::days(days);
        }
        config.catalog_path = std::env::var("PLAN_CATALOG_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Ok(config)
    }

    /// Load the configured catalog, or the built-in one
    pub fn load_catalog(&self) -> BillingResult<PlanCatalog> {
        match &self.catalog_path {
            Some(path) => PlanCatalog::from_file(path),
            None => Ok(PlanCatalog::default_catalog()),
        }
    }
}

fn env_i64(name: &str) -> BillingResult<Option<i64>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|v| *v > 0)
            .map(Some)
            .ok_or_else(|| BillingError::Config(format!("{} must be a positive integer", name))),
        Err(_) => Ok(None),
    }
}
