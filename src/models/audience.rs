use crate::models::{Error, TenantId};
use crate::store::AudienceStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, From,
    Display, Deref, FromStr, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct ContactId(i64);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, From, Display, Deref,
    FromStr, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct ListId(i64);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, From, Display, Deref,
    FromStr, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct SegmentId(i64);

#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct Contact {
    pub id: ContactId,
    pub tenant_id: TenantId,
    pub email: String,
    pub status: String,
    pub gdpr_consent_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub unsubscribed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct ListGroup {
    pub id: ListId,
    pub tenant_id: TenantId,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct Segment {
    pub id: SegmentId,
    pub tenant_id: TenantId,
    pub definition: serde_json::Value,
    pub materialized_count: i64,
    pub last_built_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct SegmentBuild {
    pub id: i64,
    pub segment_id: SegmentId,
    pub matches: i64,
    pub hash: Uuid,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct Suppression {
    pub tenant_id: TenantId,
    pub address: String,
    pub kind: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewSuppression {
    pub tenant_id: TenantId,
    pub address: String,
    pub kind: String,
    pub reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct AudienceRepository {
    pool: sqlx::PgPool,
}

impl AudienceRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AudienceStore for AudienceRepository {
    async fn contacts(&self, tenant: TenantId) -> Result<Vec<Contact>, Error> {
        Ok(sqlx::query_as::<_, Contact>(
            r#"
            SELECT id, tenant_id, email, status, gdpr_consent_at, bounced_at, unsubscribed_at
            FROM contacts
            WHERE tenant_id = $1
            ORDER BY id
            "#,
        )
        .bind(tenant)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn contact_ids_in_list(&self, list: ListId) -> Result<HashSet<ContactId>, Error> {
        let ids: Vec<ContactId> =
            sqlx::query_scalar("SELECT contact_id FROM list_contacts WHERE list_id = $1")
                .bind(list)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().collect())
    }

    async fn segment(&self, id: SegmentId) -> Result<Option<Segment>, Error> {
        Ok(sqlx::query_as::<_, Segment>(
            r#"
            SELECT id, tenant_id, definition, materialized_count, last_built_at
            FROM segments
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn record_build(
        &self,
        segment_id: SegmentId,
        matches: i64,
    ) -> Result<SegmentBuild, Error> {
        Ok(sqlx::query_as::<_, SegmentBuild>(
            r#"
            INSERT INTO segment_builds (segment_id, matches, hash)
            VALUES ($1, $2, $3)
            RETURNING id, segment_id, matches, hash, built_at
            "#,
        )
        .bind(segment_id)
        .bind(matches)
        .bind(Uuid::new_v4())
        .fetch_one(&self.pool)
        .await?)
    }

    async fn members(&self, segment: SegmentId) -> Result<HashSet<ContactId>, Error> {
        let ids: Vec<ContactId> =
            sqlx::query_scalar("SELECT contact_id FROM segment_members WHERE segment_id = $1")
                .bind(segment)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().collect())
    }

    async fn add_members(
        &self,
        segment: SegmentId,
        contacts: &[ContactId],
        built_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        if contacts.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = contacts.iter().map(|c| **c).collect();
        sqlx::query(
            r#"
            INSERT INTO segment_members (segment_id, contact_id, built_at)
            SELECT $1, contact_id, $3 FROM UNNEST($2::bigint[]) AS t(contact_id)
            ON CONFLICT (segment_id, contact_id) DO NOTHING
            "#,
        )
        .bind(segment)
        .bind(&ids)
        .bind(built_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_members(&self, segment: SegmentId, contacts: &[ContactId]) -> Result<(), Error> {
        if contacts.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = contacts.iter().map(|c| **c).collect();
        sqlx::query(
            "DELETE FROM segment_members WHERE segment_id = $1 AND contact_id = ANY($2::bigint[])",
        )
        .bind(segment)
        .bind(&ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_segment_counters(
        &self,
        segment: SegmentId,
        materialized_count: i64,
        built_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE segments SET materialized_count = $2, last_built_at = $3 WHERE id = $1",
        )
        .bind(segment)
        .bind(materialized_count)
        .bind(built_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn suppression(
        &self,
        tenant: TenantId,
        address: &str,
    ) -> Result<Option<Suppression>, Error> {
        Ok(sqlx::query_as::<_, Suppression>(
            r#"
            SELECT tenant_id, address, kind, reason, created_at, expires_at
            FROM suppressions
            WHERE tenant_id = $1 AND address = $2
              AND (expires_at IS NULL OR expires_at > NOW())
            LIMIT 1
            "#,
        )
        .bind(tenant)
        .bind(address)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn add_suppression(&self, new: NewSuppression) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO suppressions (tenant_id, address, kind, reason, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, address, kind) DO UPDATE SET
                reason = EXCLUDED.reason,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(new.tenant_id)
        .bind(&new.address)
        .bind(&new.kind)
        .bind(&new.reason)
        .bind(new.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
