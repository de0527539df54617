//! PostgreSQL-backed stores

use async_trait::async_trait;
use sqlx::PgPool;
use teamride_shared::{PeriodKey, QuotaKind, QuotaLimit, TenantId};
use time::OffsetDateTime;

use super::{
    ConsumeOutcome, Mutation, ProcessedEvent, QuotaCounters, QuotaStore, SubscriptionStore,
    UpdateOutcome,
};
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::{TenantSubscription, Transition};

const SUBSCRIPTION_COLUMNS: &str = r#"
    tenant_id, billing_email, plan_id, status, external_customer_ref,
    external_subscription_ref, last_external_session_ref, period_start, period_end,
    cancel_at_period_end, past_due_since, last_provider_event_at, updated_at
"#;

/// Subscription store on the `tenant_subscriptions` and `processed_webhook_events` tables
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn insert_if_absent(&self, record: TenantSubscription) -> BillingResult<TenantSubscription> {
        sqlx::query(
            r#"
            INSERT INTO tenant_subscriptions (
                tenant_id, billing_email, plan_id, status, cancel_at_period_end, updated_at
            ) VALUES ($1, $2, $3, $4, FALSE, $5)
            ON CONFLICT (tenant_id) DO NOTHING
            "#,
        )
        .bind(record.tenant_id)
        .bind(&record.billing_email)
        .bind(&record.plan_id)
        .bind(record.status)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        self.get(record.tenant_id)
            .await?
            .ok_or(BillingError::UnknownTenant(record.tenant_id))
    }

    async fn get(&self, tenant_id: TenantId) -> BillingResult<Option<TenantSubscription>> {
        let query = format!(
            "SELECT {} FROM tenant_subscriptions WHERE tenant_id = $1",
            SUBSCRIPTION_COLUMNS
        );
        let record = sqlx::query_as::<_, TenantSubscription>(&query)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn find_by_subscription_ref(&self, subscription_ref: &str) -> BillingResult<Option<TenantId>> {
        let row: Option<(TenantId,)> = sqlx::query_as(
            "SELECT tenant_id FROM tenant_subscriptions WHERE external_subscription_ref = $1 LIMIT 1",
        )
        .bind(subscription_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn find_by_customer_ref(&self, customer_ref: &str) -> BillingResult<Option<TenantId>> {
        let row: Option<(TenantId,)> = sqlx::query_as(
            "SELECT tenant_id FROM tenant_subscriptions WHERE external_customer_ref = $1 LIMIT 1",
        )
        .bind(customer_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn update(
        &self,
        tenant_id: TenantId,
        mutation: &Mutation<'_>,
        event: Option<&ProcessedEvent>,
    ) -> BillingResult<UpdateOutcome> {
        let mut tx = self.pool.begin().await?;

        // Claim the event first: a concurrent delivery of the same id blocks on the
        // primary key until this transaction ends, then sees the conflict.
        if let Some(event) = event {
            let claimed: Option<(String,)> = sqlx::query_as(
                r#"
                INSERT INTO processed_webhook_events (event_id, event_type, tenant_id, processed_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (event_id) DO NOTHING
                RETURNING event_id
                "#,
            )
            .bind(&event.event_id)
            .bind(&event.event_type)
            .bind(event.tenant_id)
            .bind(event.processed_at)
            .fetch_optional(&mut *tx)
            .await?;

            if claimed.is_none() {
                tx.rollback().await?;
                return Ok(UpdateOutcome::DuplicateEvent);
            }
        }

        let query = format!(
            "SELECT {} FROM tenant_subscriptions WHERE tenant_id = $1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        );
        let current = sqlx::query_as::<_, TenantSubscription>(&query)
            .bind(tenant_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(current) = current else {
            tx.rollback().await?;
            return Err(BillingError::UnknownTenant(tenant_id));
        };

        let next = match mutation(&current) {
            Ok(Transition::Changed(next)) => next,
            Ok(Transition::Unchanged) => {
                tx.commit().await?;
                return Ok(UpdateOutcome::Unchanged(current));
            }
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };

        sqlx::query(
            r#"
            UPDATE tenant_subscriptions SET
                billing_email = $2,
                plan_id = $3,
                status = $4,
                external_customer_ref = $5,
                external_subscription_ref = $6,
                last_external_session_ref = $7,
                period_start = $8,
                period_end = $9,
                cancel_at_period_end = $10,
                past_due_since = $11,
                last_provider_event_at = $12,
                updated_at = $13
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .bind(&next.billing_email)
        .bind(&next.plan_id)
        .bind(next.status)
        .bind(&next.external_customer_ref)
        .bind(&next.external_subscription_ref)
        .bind(&next.last_external_session_ref)
        .bind(next.period_start)
        .bind(next.period_end)
        .bind(next.cancel_at_period_end)
        .bind(next.past_due_since)
        .bind(next.last_provider_event_at)
        .bind(next.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(UpdateOutcome::Applied {
            before: current,
            after: next,
        })
    }

    async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT event_id FROM processed_webhook_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn sweep_candidates(
        &self,
        now: OffsetDateTime,
        past_due_cutoff: OffsetDateTime,
    ) -> BillingResult<Vec<TenantId>> {
        let rows: Vec<(TenantId,)> = sqlx::query_as(
            r#"
            SELECT tenant_id FROM tenant_subscriptions
            WHERE (status = 'active'
                   AND period_end IS NOT NULL
                   AND period_end <= $1
                   AND (cancel_at_period_end OR external_subscription_ref IS NULL))
               OR (status = 'past_due' AND past_due_since <= $2)
            ORDER BY tenant_id
            "#,
        )
        .bind(now)
        .bind(past_due_cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn purge_processed_events(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM processed_webhook_events WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Quota ledger storage on the `quota_counters` table
#[derive(Clone)]
pub struct PgQuotaStore {
    pool: PgPool,
}

impl PgQuotaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn counter_column(kind: QuotaKind) -> &'static str {
    match kind {
        QuotaKind::Events => "events_created",
        QuotaKind::Invitations => "invitations_sent",
    }
}

fn to_db_amount(value: u64) -> BillingResult<i64> {
    i64::try_from(value)
        .map_err(|_| BillingError::InvalidInput(format!("amount out of range: {}", value)))
}

fn from_db_amount(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl QuotaStore for PgQuotaStore {
    async fn try_consume(
        &self,
        tenant_id: TenantId,
        kind: QuotaKind,
        amount: u64,
        limit: QuotaLimit,
        period: &PeriodKey,
    ) -> BillingResult<ConsumeOutcome> {
        let amount = to_db_amount(amount)?;
        let limit = limit.as_option().map(to_db_amount).transpose()?;
        let column = counter_column(kind);

        // First usage ever: open the tenant's current period
        sqlx::query(
            r#"
            INSERT INTO quota_counters (tenant_id, period_key, is_current)
            SELECT $1, $2, TRUE
            WHERE NOT EXISTS (
                SELECT 1 FROM quota_counters WHERE tenant_id = $1 AND is_current
            )
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(period)
        .execute(&self.pool)
        .await?;

        // Check and increment in one statement; the row lock serializes concurrent callers
        let update = format!(
            r#"
            UPDATE quota_counters
            SET {col} = {col} + $2, updated_at = NOW()
            WHERE tenant_id = $1
              AND is_current
              AND ($3::BIGINT IS NULL OR {col} + $2 <= $3)
            RETURNING period_key, {col}
            "#,
            col = column
        );
        let consumed: Option<(PeriodKey, i64)> = sqlx::query_as(&update)
            .bind(tenant_id)
            .bind(amount)
            .bind(limit)
            .fetch_optional(&self.pool)
            .await?;

        if let Some((period_key, used)) = consumed {
            return Ok(ConsumeOutcome::Consumed {
                period_key,
                used: from_db_amount(used),
            });
        }

        let select = format!(
            "SELECT period_key, {} FROM quota_counters WHERE tenant_id = $1 AND is_current",
            column
        );
        let (period_key, used): (PeriodKey, i64) = sqlx::query_as(&select)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!("no current quota period for tenant {}", tenant_id))
            })?;

        Ok(ConsumeOutcome::Rejected {
            period_key,
            used: from_db_amount(used),
        })
    }

    async fn current(&self, tenant_id: TenantId) -> BillingResult<Option<QuotaCounters>> {
        let row: Option<(PeriodKey, i64, i64)> = sqlx::query_as(
            r#"
            SELECT period_key, events_created, invitations_sent
            FROM quota_counters
            WHERE tenant_id = $1 AND is_current
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(period_key, events, invitations)| QuotaCounters {
            tenant_id,
            period_key,
            events_created: from_db_amount(events),
            invitations_sent: from_db_amount(invitations),
        }))
    }

    async fn roll_periods(&self, period: &PeriodKey) -> BillingResult<u64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            WITH closed AS (
                UPDATE quota_counters
                SET is_current = FALSE, updated_at = NOW()
                WHERE is_current AND period_key < $1
                RETURNING tenant_id
            )
            INSERT INTO quota_counters (tenant_id, period_key, is_current)
            SELECT tenant_id, $1, TRUE FROM closed
            ON CONFLICT (tenant_id, period_key) DO UPDATE SET is_current = TRUE
            "#,
        )
        .bind(period)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }
}
