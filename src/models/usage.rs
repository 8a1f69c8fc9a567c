use crate::models::{Error, TenantId};
use crate::store::UsageStore;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Per-day delivery counters, upserted on the unique (tenant, day) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UsageDelta {
    pub sent: i64,
    pub delivered: i64,
    pub bounced: i64,
    pub complained: i64,
    pub opens: i64,
    pub clicks: i64,
}

impl UsageDelta {
    pub fn sent(n: i64) -> Self {
        Self {
            sent: n,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct UsageAggregate {
    pub tenant_id: TenantId,
    pub day: NaiveDate,
    pub sent: i64,
    pub delivered: i64,
    pub bounced: i64,
    pub complained: i64,
    pub opens: i64,
    pub clicks: i64,
}

/// First of the current month at 00:00 UTC, the rate-limit window anchor.
pub fn month_anchor(now: DateTime<Utc>) -> NaiveDate {
    NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .expect("first of month is always a valid date")
}

/// Rate-limit counter key for the monthly message window.
pub fn monthly_key(anchor: NaiveDate) -> String {
    format!("messages:month:{}", anchor.format("%Y-%m-01"))
}

#[derive(Debug, Clone)]
pub struct UsageRepository {
    pool: sqlx::PgPool,
}

impl UsageRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageStore for UsageRepository {
    async fn add_usage(
        &self,
        tenant: TenantId,
        day: NaiveDate,
        delta: UsageDelta,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO usage_aggregates
                (tenant_id, day, sent, delivered, bounced, complained, opens, clicks)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant_id, day)
            DO UPDATE SET sent = usage_aggregates.sent + EXCLUDED.sent,
                          delivered = usage_aggregates.delivered + EXCLUDED.delivered,
                          bounced = usage_aggregates.bounced + EXCLUDED.bounced,
                          complained = usage_aggregates.complained + EXCLUDED.complained,
                          opens = usage_aggregates.opens + EXCLUDED.opens,
                          clicks = usage_aggregates.clicks + EXCLUDED.clicks
            "#,
        )
        .bind(tenant)
        .bind(day)
        .bind(delta.sent)
        .bind(delta.delivered)
        .bind(delta.bounced)
        .bind(delta.complained)
        .bind(delta.opens)
        .bind(delta.clicks)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sent_on(&self, tenant: TenantId, day: NaiveDate) -> Result<i64, Error> {
        let sent: Option<i64> =
            sqlx::query_scalar("SELECT sent FROM usage_aggregates WHERE tenant_id = $1 AND day = $2")
                .bind(tenant)
                .bind(day)
                .fetch_optional(&self.pool)
                .await?;
        Ok(sent.unwrap_or(0))
    }

    async fn ensure_counter(
        &self,
        tenant: TenantId,
        key: &str,
        window_start: NaiveDate,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_counters (tenant_id, key, window_start, count)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (tenant_id, key, window_start) DO NOTHING
            "#,
        )
        .bind(tenant)
        .bind(key)
        .bind(window_start)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn incr_counter(
        &self,
        tenant: TenantId,
        key: &str,
        window_start: NaiveDate,
        n: i64,
    ) -> Result<(), Error> {
        debug_assert!(n >= 0);
        sqlx::query(
            r#"
            INSERT INTO rate_limit_counters (tenant_id, key, window_start, count)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, key, window_start)
            DO UPDATE SET count = rate_limit_counters.count + EXCLUDED.count
            "#,
        )
        .bind(tenant)
        .bind(key)
        .bind(window_start)
        .bind(n)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn counter(
        &self,
        tenant: TenantId,
        key: &str,
        window_start: NaiveDate,
    ) -> Result<i64, Error> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT count FROM rate_limit_counters \
             WHERE tenant_id = $1 AND key = $2 AND window_start = $3",
        )
        .bind(tenant)
        .bind(key)
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0))
    }
}
