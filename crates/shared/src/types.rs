//! Common types used across TeamRide

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::ParseError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Tenant (organization account) ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TenantId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| ParseError::TenantId(s.to_string()))
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Subscription lifecycle status
///
/// `active → cancelled` happens only once a period marked `cancel_at_period_end`
/// has actually elapsed. `past_due → expired` is applied by the scheduled sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    PastDue,
    Expired,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl SubscriptionStatus {
    /// Whether quota enforcement uses the subscribed plan's limits.
    /// Every other status degrades to free-plan limits.
    pub fn enforces_plan_limits(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::PastDue => write!(f, "past_due"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "past_due" => Ok(Self::PastDue),
            "expired" => Ok(Self::Expired),
            _ => Err(ParseError::SubscriptionStatus(s.to_string())),
        }
    }
}

/// How a plan is billed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    /// Single payment granting a bounded validity period
    OneTime,
    Monthly,
    Yearly,
    /// Perpetual plan with no billing (the free plan)
    None,
}

impl BillingInterval {
    /// Length of one paid period, `None` for perpetual plans
    pub fn period_length(&self) -> Option<Duration> {
        match self {
            Self::OneTime => Some(Duration::days(365)),
            Self::Monthly => Some(Duration::days(30)),
            Self::Yearly => Some(Duration::days(365)),
            Self::None => None,
        }
    }

    /// Whether the provider renews this plan on its own
    pub fn is_recurring(&self) -> bool {
        matches!(self, Self::Monthly | Self::Yearly)
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OneTime => write!(f, "one_time"),
            Self::Monthly => write!(f, "monthly"),
            Self::Yearly => write!(f, "yearly"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Kind of metered usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    Events,
    Invitations,
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Events => write!(f, "events"),
            Self::Invitations => write!(f, "invitations"),
        }
    }
}

impl std::str::FromStr for QuotaKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "events" | "event" => Ok(Self::Events),
            "invitations" | "invitation" => Ok(Self::Invitations),
            _ => Err(ParseError::QuotaKind(s.to_string())),
        }
    }
}

/// Per-period allowance; serialized as a number, or `null` for unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<u64>", into = "Option<u64>")]
pub enum QuotaLimit {
    Limited(u64),
    Unlimited,
}

impl QuotaLimit {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    pub fn as_option(&self) -> Option<u64> {
        match self {
            Self::Limited(n) => Some(*n),
            Self::Unlimited => None,
        }
    }

    /// Remaining allowance given current usage, `None` if unlimited
    pub fn remaining(&self, used: u64) -> Option<u64> {
        self.as_option().map(|max| max.saturating_sub(used))
    }
}

impl From<Option<u64>> for QuotaLimit {
    fn from(value: Option<u64>) -> Self {
        match value {
            Some(n) => Self::Limited(n),
            None => Self::Unlimited,
        }
    }
}

impl From<QuotaLimit> for Option<u64> {
    fn from(value: QuotaLimit) -> Self {
        value.as_option()
    }
}

impl std::fmt::Display for QuotaLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{}", n),
            Self::Unlimited => write!(f, "unlimited"),
        }
    }
}

// =============================================================================
// Quota periods
// =============================================================================

/// Calendar-month quota period, formatted `YYYY-MM`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct PeriodKey(String);

impl PeriodKey {
    /// Period containing the given instant (UTC calendar month)
    pub fn for_time(at: OffsetDateTime) -> Self {
        let at = at.to_offset(time::UtcOffset::UTC);
        Self(format!("{:04}-{:02}", at.year(), u8::from(at.month())))
    }

    pub fn current() -> Self {
        Self::for_time(OffsetDateTime::now_utc())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for PeriodKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::PeriodKey(s.to_string());
        let (year, month) = s.split_once('-').ok_or_else(invalid)?;
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u8 = month.parse().map_err(|_| invalid())?;
        if year < 1970 || month == 0 || month > 12 {
            return Err(invalid());
        }
        Ok(Self(format!("{:04}-{:02}", year, month)))
    }
}

// =============================================================================
// Tests
// =============================================================================
