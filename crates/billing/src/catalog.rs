//! Plan catalog
//!
//! Immutable set of plan tiers, built once at startup and shared by `Arc`.
//! Plans can come from the built-in defaults or from a JSON file.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use teamride_shared::{BillingInterval, QuotaKind, QuotaLimit};

use crate::error::{BillingError, BillingResult};

/// A subscription tier with its price and usage limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub display_name: String,
    pub price_minor_units: i64,
    pub currency: String,
    pub billing_interval: BillingInterval,
    pub max_events_per_period: QuotaLimit,
    pub max_invitations_per_period: QuotaLimit,
    #[serde(default)]
    pub features: Vec<String>,
}

impl Plan {
    /// The free plan is perpetual and costs nothing
    pub fn is_free(&self) -> bool {
        self.billing_interval == BillingInterval::None && self.price_minor_units == 0
    }

    pub fn limit_for(&self, kind: QuotaKind) -> QuotaLimit {
        match kind {
            QuotaKind::Events => self.max_events_per_period,
            QuotaKind::Invitations => self.max_invitations_per_period,
        }
    }
}

/// Validated, read-only plan catalog
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
    free_index: usize,
}

impl PlanCatalog {
    /// Build a catalog, rejecting duplicate ids and requiring exactly one free plan
    pub fn new(plans: Vec<Plan>) -> BillingResult<Self> {
        let mut seen = HashSet::new();
        for plan in &plans {
            if plan.plan_id.trim().is_empty() {
                return Err(BillingError::Config("plan with empty plan_id".to_string()));
            }
            if !seen.insert(plan.plan_id.to_lowercase()) {
                return Err(BillingError::Config(format!(
                    "duplicate plan_id in catalog: {}",
                    plan.plan_id
                )));
            }
            if plan.price_minor_units < 0 {
                return Err(BillingError::Config(format!(
                    "negative price for plan {}",
                    plan.plan_id
                )));
            }
            if plan.billing_interval == BillingInterval::None && !plan.is_free() {
                return Err(BillingError::Config(format!(
                    "plan {} has a price but no billing interval",
                    plan.plan_id
                )));
            }
        }

        let free: Vec<usize> = plans
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_free())
            .map(|(i, _)| i)
            .collect();
        let free_index = match free.as_slice() {
            [index] => *index,
            [] => return Err(BillingError::Config("catalog has no free plan".to_string())),
            _ => {
                return Err(BillingError::Config(
                    "catalog has more than one free plan".to_string(),
                ))
            }
        };

        Ok(Self { plans, free_index })
    }

    /// Parse a catalog from its JSON representation (an array of plans)
    pub fn from_json_str(json: &str) -> BillingResult<Self> {
        let plans: Vec<Plan> = serde_json::from_str(json)
            .map_err(|e| BillingError::Config(format!("invalid plan catalog JSON: {}", e)))?;
        Self::new(plans)
    }

    pub fn from_file(path: &Path) -> BillingResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            BillingError::Config(format!(
                "failed to read plan catalog {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&json)
    }

    /// Built-in catalog used when no catalog file is configured
    pub fn default_catalog() -> Self {
        let plans = vec![
            Plan {
                plan_id: "free".to_string(),
                display_name: "Free".to_string(),
                price_minor_units: 0,
                currency: "eur".to_string(),
                billing_interval: BillingInterval::None,
                max_events_per_period: QuotaLimit::Limited(3),
                max_invitations_per_period: QuotaLimit::Limited(30),
                features: vec![
                    "Carpool matching".to_string(),
                    "Event chat".to_string(),
                ],
            },
            Plan {
                plan_id: "club".to_string(),
                display_name: "Club".to_string(),
                price_minor_units: 990,
                currency: "eur".to_string(),
                billing_interval: BillingInterval::Monthly,
                max_events_per_period: QuotaLimit::Limited(30),
                max_invitations_per_period: QuotaLimit::Limited(600),
                features: vec![
                    "Carpool matching".to_string(),
                    "Event chat".to_string(),
                    "Recurring events".to_string(),
                    "Email reminders".to_string(),
                ],
            },
            Plan {
                plan_id: "league".to_string(),
                display_name: "League".to_string(),
                price_minor_units: 9900,
                currency: "eur".to_string(),
                billing_interval: BillingInterval::Yearly,
                max_events_per_period: QuotaLimit::Unlimited,
                max_invitations_per_period: QuotaLimit::Unlimited,
                features: vec![
                    "Carpool matching".to_string(),
                    "Event chat".to_string(),
                    "Recurring events".to_string(),
                    "Email reminders".to_string(),
                    "Multiple teams".to_string(),
                    "Priority support".to_string(),
                ],
            },
            Plan {
                plan_id: "season_pass".to_string(),
                display_name: "Season Pass".to_string(),
                price_minor_units: 4900,
                currency: "eur".to_string(),
                billing_interval: BillingInterval::OneTime,
                max_events_per_period: QuotaLimit::Limited(50),
                max_invitations_per_period: QuotaLimit::Limited(1000),
                features: vec![
                    "Carpool matching".to_string(),
                    "Event chat".to_string(),
                    "Recurring events".to_string(),
                ],
            },
        ];

        // The literal above always has exactly one free plan and unique ids
        Self {
            plans,
            free_index: 0,
        }
    }

    pub fn get(&self, plan_id: &str) -> Option<&Plan> {
        self.plans
            .iter()
            .find(|p| p.plan_id.eq_ignore_ascii_case(plan_id.trim()))
    }

    /// Look up a plan, failing with `InvalidPlan` when it does not exist
    pub fn require(&self, plan_id: &str) -> BillingResult<&Plan> {
        self.get(plan_id)
            .ok_or_else(|| BillingError::InvalidPlan(plan_id.to_string()))
    }

    pub fn free_plan(&self) -> &Plan {
        &self.plans[self.free_index]
    }

    /// Plans in catalog order
    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_passes_validation() {
        let catalog = PlanCatalog::default_catalog();
        let rebuilt = PlanCatalog::new(catalog.plans().to_vec()).unwrap();
        assert_eq!(rebuilt.free_plan().plan_id, "free");
        assert_eq!(catalog.free_plan().plan_id, "free");
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let catalog = PlanCatalog::default_catalog();
        assert_eq!(catalog.get("CLUB").unwrap().plan_id, "club");
        assert!(matches!(
            catalog.require("platinum"),
            Err(BillingError::InvalidPlan(id)) if id == "platinum"
        ));
    }

    #[test]
    fn test_catalog_requires_exactly_one_free_plan() {
        let catalog = PlanCatalog::default_catalog();
        let paid_only: Vec<Plan> = catalog
            .plans()
            .iter()
            .filter(|p| !p.is_free())
            .cloned()
            .collect();
        assert!(matches!(
            PlanCatalog::new(paid_only),
            Err(BillingError::Config(_))
        ));

        let mut two_free = catalog.plans().to_vec();
        let mut extra = catalog.free_plan().clone();
        extra.plan_id = "starter".to_string();
        two_free.push(extra);
        assert!(PlanCatalog::new(two_free).is_err());
    }

    #[test]
    fn test_duplicate_plan_ids_rejected() {
        let mut plans = PlanCatalog::default_catalog().plans().to_vec();
        let mut dup = plans[1].clone();
        dup.plan_id = "Club".to_string();
        plans.push(dup);
        assert!(PlanCatalog::new(plans).is_err());
    }

    #[test]
    fn test_from_json_with_unlimited_limits() {
        let json = r#"[
            {"plan_id": "free", "display_name": "Free", "price_minor_units": 0,
             "currency": "eur", "billing_interval": "none",
             "max_events_per_period": 2, "max_invitations_per_period": 10},
            {"plan_id": "pro", "display_name": "Pro", "price_minor_units": 1500,
             "currency": "eur", "billing_interval": "monthly",
             "max_events_per_period": null, "max_invitations_per_period": 500,
             "features": ["Everything"]}
        ]"#;
        let catalog = PlanCatalog::from_json_str(json).unwrap();
        let pro = catalog.require("pro").unwrap();
        assert!(pro.limit_for(QuotaKind::Events).is_unlimited());
        assert_eq!(pro.limit_for(QuotaKind::Invitations), QuotaLimit::Limited(500));
        assert_eq!(pro.features, vec!["Everything".to_string()]);
        assert!(catalog.free_plan().features.is_empty());
    }

    #[test]
    fn test_priced_plan_without_interval_rejected() {
        let json = r#"[
            {"plan_id": "free", "display_name": "Free", "price_minor_units": 0,
             "currency": "eur", "billing_interval": "none",
             "max_events_per_period": 2, "max_invitations_per_period": 10},
            {"plan_id": "odd", "display_name": "Odd", "price_minor_units": 100,
             "currency": "eur", "billing_interval": "none",
             "max_events_per_period": 2, "max_invitations_per_period": 10}
        ]"#;
        assert!(PlanCatalog::from_json_str(json).is_err());
    }
}
