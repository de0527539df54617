//! Error types for TeamRide shared types

use thiserror::Error;

/// Failure to parse one of the shared value types from a string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Invalid tenant id: {0}")]
    TenantId(String),

    #[error("Invalid subscription status: {0}")]
    SubscriptionStatus(String),

    #[error("Invalid quota kind: {0}")]
    QuotaKind(String),

    #[error("Invalid quota period key: {0}")]
    PeriodKey(String),
}
