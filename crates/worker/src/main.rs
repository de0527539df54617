//! TeamRide Background Worker
//!
//! Handles scheduled jobs including:
//! - Subscription lifecycle sweep (every 15 minutes)
//! - Quota period rollover (daily at 00:05 UTC, and once at startup)
//! - Processed webhook event purge (daily at 03:30 UTC)
//! - Heartbeat (every 5 minutes)

mod jobs;

use std::time::Duration;

use teamride_billing::{BillingConfig, BillingService};
use teamride_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting TeamRide Worker v{}", env!("CARGO_PKG_VERSION"));

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let max_connections = match std::env::var("WORKER_DATABASE_MAX_CONNECTIONS") {
        Ok(v) => v.parse()?,
        Err(_) => DEFAULT_MAX_CONNECTIONS,
    };
    let pool = create_pool(&database_url, max_connections).await?;
    info!("Database pool created");

    let config = BillingConfig::from_env()?;
    let catalog = config.load_catalog()?;
    let billing = BillingService::postgres(&config, catalog, pool);
    let maintenance = billing.maintenance;

    // Counters for a month that started while the worker was down
    jobs::roll_quota_periods(&maintenance).await;

    let scheduler = JobScheduler::new().await?;

    // Job 1: Subscription sweep
    // Cron: every 15 minutes
    let sweep = maintenance.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let maintenance = sweep.clone();
            Box::pin(async move {
                jobs::sweep_subscriptions(&maintenance).await;
            })
        })?)
        .await?;
    info!("Scheduled: Subscription sweep (every 15 minutes)");

    // Job 2: Quota period rollover
    // Cron: 00:05 UTC daily, shortly after a new month can begin
    let rollover = maintenance.clone();
    scheduler
        .add(Job::new_async("0 5 0 * * *", move |_uuid, _l| {
            let maintenance = rollover.clone();
            Box::pin(async move {
                jobs::roll_quota_periods(&maintenance).await;
            })
        })?)
        .await?;
    info!("Scheduled: Quota period rollover (00:05 UTC)");

    // Job 3: Processed event purge
    // Cron: 03:30 UTC daily
    let purge = maintenance.clone();
    scheduler
        .add(Job::new_async("0 30 3 * * *", move |_uuid, _l| {
            let maintenance = purge.clone();
            Box::pin(async move {
                jobs::purge_processed_events(&maintenance).await;
            })
        })?)
        .await?;
    info!("Scheduled: Processed webhook event purge (03:30 UTC)");

    // Job 4: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    scheduler.start().await?;

    info!("TeamRide Worker started successfully with {} scheduled jobs", 4);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
