//! Scheduled maintenance jobs
//!
//! Each job runs one maintenance pass and logs its outcome. Errors are logged and
//! left for the next run; the scheduler never stops on a failed pass.

use std::time::Instant;

use teamride_billing::MaintenanceService;
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// Lapse cancelled and exhausted subscriptions, expire past-due ones after grace
pub async fn sweep_subscriptions(maintenance: &MaintenanceService) {
    let started = Instant::now();
    match maintenance
        .sweep_subscriptions(OffsetDateTime::now_utc())
        .await
    {
        Ok(report) if report.failed > 0 => warn!(
            examined = report.examined,
            transitioned = report.transitioned,
            failed = report.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Subscription sweep finished with failures"
        ),
        Ok(report) => info!(
            examined = report.examined,
            transitioned = report.transitioned,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Subscription sweep finished"
        ),
        Err(e) => error!(error = %e, "Subscription sweep failed"),
    }
}

/// Open the current quota period for tenants still counting an older one
pub async fn roll_quota_periods(maintenance: &MaintenanceService) {
    match maintenance.roll_quota_periods(OffsetDateTime::now_utc()).await {
        Ok(rolled) => info!(tenants = rolled, "Quota period rollover finished"),
        Err(e) => error!(error = %e, "Quota period rollover failed"),
    }
}

/// Forget processed webhook event ids past retention
pub async fn purge_processed_events(maintenance: &MaintenanceService) {
    match maintenance
        .purge_processed_events(OffsetDateTime::now_utc())
        .await
    {
        Ok(purged) => info!(purged, "Processed event purge finished"),
        Err(e) => error!(error = %e, "Processed event purge failed"),
    }
}
