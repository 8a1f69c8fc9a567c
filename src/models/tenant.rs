use crate::models::Error;
use crate::store::TenantStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, From,
    Display, Deref, FromStr, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct TenantId(i64);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, From, Display, Deref,
    FromStr, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct PlanId(i64);

/// A tenant owns every other tenant-scoped entity. Created externally,
/// never deleted by this core.
#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct Tenant {
    pub id: TenantId,
    pub plan_id: PlanId,
    pub daily_limit_override: Option<i64>,
    pub monthly_limit_override: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct Plan {
    pub id: PlanId,
    pub monthly_price_cents: i64,
    pub included_messages: i64,
    pub features: serde_json::Value,
}

impl Plan {
    fn quota(&self, key: &str) -> Option<i64> {
        self.features
            .get("quotas")
            .and_then(|q| q.get(key))
            .and_then(|v| v.as_i64())
    }

    pub fn emails_per_day(&self) -> Option<i64> {
        self.quota("emailsPerDay")
    }

    pub fn emails_per_month(&self) -> Option<i64> {
        self.quota("emailsPerMonth")
    }
}

#[derive(Debug, Clone)]
pub struct TenantRepository {
    pool: sqlx::PgPool,
}

impl TenantRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantStore for TenantRepository {
    async fn tenant(&self, id: TenantId) -> Result<Option<Tenant>, Error> {
        Ok(sqlx::query_as::<_, Tenant>(
            r#"
            SELECT id, plan_id, daily_limit_override, monthly_limit_override, created_at
            FROM tenants
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn plan(&self, id: PlanId) -> Result<Option<Plan>, Error> {
        Ok(sqlx::query_as::<_, Plan>(
            r#"
            SELECT id, monthly_price_cents, included_messages, features
            FROM plans
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn plan_quotas_read_from_feature_map() {
        let plan = Plan {
            id: 1.into(),
            monthly_price_cents: 2500,
            included_messages: 10_000,
            features: json!({"quotas": {"emailsPerDay": 500, "emailsPerMonth": 12_000}}),
        };
        assert_eq!(plan.emails_per_day(), Some(500));
        assert_eq!(plan.emails_per_month(), Some(12_000));

        let bare = Plan {
            id: 2.into(),
            monthly_price_cents: 0,
            included_messages: 100,
            features: json!({}),
        };
        assert_eq!(bare.emails_per_day(), None);
        assert_eq!(bare.emails_per_month(), None);
    }
}
