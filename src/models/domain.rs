use crate::models::{Error, TenantId};
use crate::store::DomainStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, From, Display, Deref,
    FromStr, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct DomainId(i64);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, From, Display, Deref,
    FromStr, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct DkimKeyId(i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "domain_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DomainStatus {
    Pending,
    Active,
    Failed,
}

/// Expected DNS records for a domain, filled in when the domain is
/// provisioned and compared against live DNS by the verifier.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DomainExpectations {
    pub txt_name: Option<String>,
    pub txt_value: Option<String>,
    pub spf: Option<String>,
    pub dmarc: Option<String>,
    pub mx: Vec<MxRecord>,
    pub dkim_selector: Option<String>,
    pub dkim_txt: Option<String>,
    pub tls_rpt: Option<String>,
    pub mta_sts: Option<MtaStsExpectation>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct MxRecord {
    pub host: String,
    pub priority: u16,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MtaStsExpectation {
    pub txt: Option<String>,
    pub cname_target: Option<String>,
    pub acme_cname_target: Option<String>,
    pub mode: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Domain {
    pub id: DomainId,
    pub tenant_id: TenantId,
    pub name: String,
    pub status: DomainStatus,
    pub expectations: DomainExpectations,
    pub require_tls: bool,
    pub arc_sign: bool,
    pub bimi_enabled: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verification_report: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PgDomain {
    id: DomainId,
    tenant_id: TenantId,
    name: String,
    status: DomainStatus,
    expectations: serde_json::Value,
    require_tls: bool,
    arc_sign: bool,
    bimi_enabled: bool,
    last_checked_at: Option<DateTime<Utc>>,
    verified_at: Option<DateTime<Utc>>,
    verification_report: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PgDomain> for Domain {
    type Error = Error;

    fn try_from(pg: PgDomain) -> Result<Self, Self::Error> {
        let expectations = serde_json::from_value(pg.expectations)?;
        Ok(Self {
            id: pg.id,
            tenant_id: pg.tenant_id,
            name: pg.name,
            status: pg.status,
            expectations,
            require_tls: pg.require_tls,
            arc_sign: pg.arc_sign,
            bimi_enabled: pg.bimi_enabled,
            last_checked_at: pg.last_checked_at,
            verified_at: pg.verified_at,
            verification_report: pg.verification_report,
            created_at: pg.created_at,
        })
    }
}

/// At most one active key per (domain, selector); rotation deactivates the
/// previous key and stamps `rotated_at` on it.
#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct DkimKey {
    pub id: DkimKeyId,
    pub domain_id: DomainId,
    pub selector: String,
    pub public_pem: String,
    pub private_key_path: String,
    pub txt_value: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewDkimKey {
    pub domain_id: DomainId,
    pub selector: String,
    pub public_pem: String,
    pub private_key_path: String,
    pub txt_value: String,
}

#[derive(Debug, Clone)]
pub struct DomainRepository {
    pool: sqlx::PgPool,
}

impl DomainRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

const DOMAIN_COLUMNS: &str = r#"
    id, tenant_id, name, status, expectations, require_tls, arc_sign,
    bimi_enabled, last_checked_at, verified_at, verification_report, created_at
"#;

#[async_trait]
impl DomainStore for DomainRepository {
    async fn domain(&self, id: DomainId) -> Result<Option<Domain>, Error> {
        let pg = sqlx::query_as::<_, PgDomain>(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        pg.map(Domain::try_from).transpose()
    }

    async fn domains_with_status(&self, status: DomainStatus) -> Result<Vec<Domain>, Error> {
        let rows = sqlx::query_as::<_, PgDomain>(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains WHERE status = $1 ORDER BY id"
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Domain::try_from).collect()
    }

    async fn update_verification(
        &self,
        id: DomainId,
        status: DomainStatus,
        report: serde_json::Value,
        verified_at: Option<DateTime<Utc>>,
        checked_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE domains
            SET status = $2,
                verification_report = $3,
                verified_at = COALESCE(verified_at, $4),
                last_checked_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(report)
        .bind(verified_at)
        .bind(checked_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn active_dkim_key(
        &self,
        domain_id: DomainId,
        selector: &str,
    ) -> Result<Option<DkimKey>, Error> {
        Ok(sqlx::query_as::<_, DkimKey>(
            r#"
            SELECT id, domain_id, selector, public_pem, private_key_path, txt_value,
                   active, created_at, rotated_at
            FROM dkim_keys
            WHERE domain_id = $1 AND selector = $2 AND active
            "#,
        )
        .bind(domain_id)
        .bind(selector)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn active_dkim_keys(&self) -> Result<Vec<(String, DkimKey)>, Error> {
        #[derive(sqlx::FromRow)]
        struct Row {
            domain_name: String,
            #[sqlx(flatten)]
            key: DkimKey,
        }

        let rows = sqlx::query_as::<_, Row>(
            r#"
            SELECT d.name AS domain_name,
                   k.id, k.domain_id, k.selector, k.public_pem, k.private_key_path,
                   k.txt_value, k.active, k.created_at, k.rotated_at
            FROM dkim_keys k
                JOIN domains d ON d.id = k.domain_id
            WHERE k.active
            ORDER BY d.name, k.selector
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| (r.domain_name, r.key)).collect())
    }

    async fn insert_dkim_key(&self, new: NewDkimKey) -> Result<DkimKey, Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE dkim_keys
            SET active = FALSE, rotated_at = NOW()
            WHERE domain_id = $1 AND selector = $2 AND active
            "#,
        )
        .bind(new.domain_id)
        .bind(&new.selector)
        .execute(&mut *tx)
        .await?;

        let key = sqlx::query_as::<_, DkimKey>(
            r#"
            INSERT INTO dkim_keys
                (domain_id, selector, public_pem, private_key_path, txt_value, active)
            VALUES ($1, $2, $3, $4, $5, TRUE)
            RETURNING id, domain_id, selector, public_pem, private_key_path, txt_value,
                      active, created_at, rotated_at
            "#,
        )
        .bind(new.domain_id)
        .bind(&new.selector)
        .bind(&new.public_pem)
        .bind(&new.private_key_path)
        .bind(&new.txt_value)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(key)
    }
}
