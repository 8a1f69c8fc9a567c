use crate::models::{Error, TenantId};
use crate::store::WebhookStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, From, Display, Deref,
    FromStr, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct WebhookId(i64);

/// Default retry backoff, seconds per attempt: 1m, 5m, 30m, 2h, 6h.
pub const DEFAULT_BACKOFF: [i64; 5] = [60, 300, 1800, 7200, 21600];

#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct Webhook {
    pub id: WebhookId,
    pub tenant_id: TenantId,
    pub url: String,
    pub events: Vec<String>,
    pub secret: String,
    pub batch_size: i32,
    pub max_retries: i32,
    pub backoff: serde_json::Value,
    pub active: bool,
}

impl Webhook {
    /// Backoff schedule in seconds, deterministic per attempt number.
    pub fn backoff_schedule(&self) -> Vec<i64> {
        let parsed: Option<Vec<i64>> = serde_json::from_value(self.backoff.clone()).ok();
        match parsed {
            Some(schedule) if !schedule.is_empty() => schedule,
            _ => DEFAULT_BACKOFF.to_vec(),
        }
    }

    /// Delay before the next attempt. Attempts past the end of the schedule
    /// reuse the last entry.
    pub fn backoff_secs(&self, attempt: i32) -> i64 {
        let schedule = self.backoff_schedule();
        let idx = (attempt.max(1) as usize - 1).min(schedule.len() - 1);
        schedule[idx]
    }

    pub fn subscribes_to(&self, kind: &str) -> bool {
        self.events.iter().any(|e| e == kind || e == "*")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct WebhookDelivery {
    pub id: i64,
    pub webhook_id: WebhookId,
    pub event_id: Uuid,
    pub attempt: i32,
    pub http_code: Option<i32>,
    pub response_time_ms: Option<i64>,
    pub payload: serde_json::Value,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub webhook_id: WebhookId,
    pub event_id: Uuid,
    pub attempt: i32,
    pub http_code: Option<i32>,
    pub response_time_ms: Option<i64>,
    pub payload: serde_json::Value,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct WebhookRepository {
    pool: sqlx::PgPool,
}

impl WebhookRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

const WEBHOOK_COLUMNS: &str =
    "id, tenant_id, url, events, secret, batch_size, max_retries, backoff, active";

const DELIVERY_COLUMNS: &str = r#"
    id, webhook_id, event_id, attempt, http_code, response_time_ms,
    payload, next_retry_at, delivered_at, created_at
"#;

#[async_trait]
impl WebhookStore for WebhookRepository {
    async fn webhook(&self, id: WebhookId) -> Result<Option<Webhook>, Error> {
        Ok(sqlx::query_as::<_, Webhook>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn active_for(&self, tenant: TenantId, kind: &str) -> Result<Vec<Webhook>, Error> {
        Ok(sqlx::query_as::<_, Webhook>(&format!(
            r#"
            SELECT {WEBHOOK_COLUMNS}
            FROM webhooks
            WHERE tenant_id = $1 AND active AND ($2 = ANY(events) OR '*' = ANY(events))
            ORDER BY id
            "#
        ))
        .bind(tenant)
        .bind(kind)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn record_delivery(&self, new: NewDelivery) -> Result<WebhookDelivery, Error> {
        Ok(sqlx::query_as::<_, WebhookDelivery>(&format!(
            r#"
            INSERT INTO webhook_deliveries
                (webhook_id, event_id, attempt, http_code, response_time_ms,
                 payload, next_retry_at, delivered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {DELIVERY_COLUMNS}
            "#
        ))
        .bind(new.webhook_id)
        .bind(new.event_id)
        .bind(new.attempt)
        .bind(new.http_code)
        .bind(new.response_time_ms)
        .bind(&new.payload)
        .bind(new.next_retry_at)
        .bind(new.delivered_at)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>, Error> {
        Ok(sqlx::query_as::<_, WebhookDelivery>(&format!(
            r#"
            SELECT {DELIVERY_COLUMNS}
            FROM webhook_deliveries
            WHERE delivered_at IS NULL AND next_retry_at IS NOT NULL AND next_retry_at <= $1
            ORDER BY next_retry_at
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn clear_retry(&self, delivery_id: i64) -> Result<(), Error> {
        sqlx::query("UPDATE webhook_deliveries SET next_retry_at = NULL WHERE id = $1")
            .bind(delivery_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
