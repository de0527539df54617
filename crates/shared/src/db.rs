//! PostgreSQL pools and schema migrations for the billing tables

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::{str::FromStr, time::Duration};

/// Pool timing for one kind of workload
struct PoolProfile {
    max_connections: u32,
    acquire_timeout: Duration,
    idle_timeout: Duration,
    max_lifetime: Duration,
}

impl PoolProfile {
    /// Request handlers and the worker: short acquire waits, recycled often
    fn service(max_connections: u32) -> Self {
        Self {
            max_connections: max_connections.max(1),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(300),
        }
    }

    /// Migrations run one statement at a time and may wait on table locks
    fn migration() -> Self {
        Self {
            max_connections: 1,
            acquire_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(180),
        }
    }

    async fn connect(self, database_url: &str) -> Result<PgPool, sqlx::Error> {
        // Prepared statements break behind transaction-mode PgBouncer
        let options = PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);

        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(0)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(self.idle_timeout)
            .max_lifetime(self.max_lifetime)
            .connect_with(options)
            .await
    }
}

/// Pool used by the API server and the worker
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PoolProfile::service(max_connections).connect(database_url).await
}

/// Single-connection pool for applying migrations, ideally on a direct (non-pooled) URL
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PoolProfile::migration().connect(database_url).await
}

/// Apply `tenant_subscriptions`, `quota_counters` and `processed_webhook_events`
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}
