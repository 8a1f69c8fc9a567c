use crate::models::{DomainId, Error, TenantId};
use crate::store::MessageStore;
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
pub struct MessageId(i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "message_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Preview,
    Queued,
    QueueFailed,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "recipient_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RecipientKind {
    To,
    Cc,
    Bcc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "recipient_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RecipientStatus {
    Queued,
    Sent,
    Delivered,
    Bounced,
    Complained,
    Deferred,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "event_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Preview,
    Queued,
    QueueFailed,
    Sent,
    Failed,
    Delivered,
    Bounced,
    Complained,
    Opened,
    Clicked,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Preview => "preview",
            EventKind::Queued => "queued",
            EventKind::QueueFailed => "queue_failed",
            EventKind::Sent => "sent",
            EventKind::Failed => "failed",
            EventKind::Delivered => "delivered",
            EventKind::Bounced => "bounced",
            EventKind::Complained => "complained",
            EventKind::Opened => "opened",
            EventKind::Clicked => "clicked",
        }
    }

    pub fn from_state(state: MessageState) -> Self {
        match state {
            MessageState::Preview => EventKind::Preview,
            MessageState::Queued => EventKind::Queued,
            MessageState::QueueFailed => EventKind::QueueFailed,
            MessageState::Sent => EventKind::Sent,
            MessageState::Failed => EventKind::Failed,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct Message {
    pub id: MessageId,
    pub tenant_id: TenantId,
    pub domain_id: Option<DomainId>,
    pub external_id: Uuid,
    pub from_email: String,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub subject: Option<String>,
    pub html: Option<String>,
    pub text: Option<String>,
    pub headers: serde_json::Value,
    pub attachments: serde_json::Value,
    pub track_opens: bool,
    pub track_clicks: bool,
    pub provider_message_id: Option<String>,
    pub final_state: MessageState,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub tenant_id: TenantId,
    pub domain_id: Option<DomainId>,
    pub from_email: String,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub subject: Option<String>,
    pub html: Option<String>,
    pub text: Option<String>,
    pub headers: serde_json::Value,
    pub attachments: serde_json::Value,
    pub track_opens: bool,
    pub track_clicks: bool,
    pub final_state: MessageState,
}

#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct MessageRecipient {
    pub id: i64,
    pub message_id: MessageId,
    pub kind: RecipientKind,
    pub address: String,
    pub status: RecipientStatus,
    pub smtp_code: Option<i32>,
    pub smtp_text: Option<String>,
    pub tracking_token: Uuid,
    pub queued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewRecipient {
    pub kind: RecipientKind,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct MessageEvent {
    pub id: i64,
    pub message_id: MessageId,
    pub kind: EventKind,
    pub recipient: Option<String>,
    pub provider: Option<String>,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub message_id: MessageId,
    pub kind: EventKind,
    pub recipient: Option<String>,
    pub provider: Option<String>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct MessageRepository {
    pool: sqlx::PgPool,
}

impl MessageRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

const MESSAGE_COLUMNS: &str = r#"
    id, tenant_id, domain_id, external_id, from_email, from_name, reply_to,
    subject, html, text, headers, attachments, track_opens, track_clicks,
    provider_message_id, final_state, created_at, queued_at, sent_at
"#;

const RECIPIENT_COLUMNS: &str = r#"
    id, message_id, kind, address, status, smtp_code, smtp_text,
    tracking_token, queued_at, sent_at, delivered_at, failed_at
"#;

#[async_trait]
impl MessageStore for MessageRepository {
    async fn create_message(&self, new: NewMessage) -> Result<Message, Error> {
        let queued_at = match new.final_state {
            MessageState::Queued => Some(Utc::now()),
            _ => None,
        };

        Ok(sqlx::query_as::<_, Message>(&format!(
            r#"
            INSERT INTO messages
                (tenant_id, domain_id, external_id, from_email, from_name, reply_to,
                 subject, html, text, headers, attachments, track_opens, track_clicks,
                 final_state, queued_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(new.tenant_id)
        .bind(new.domain_id)
        .bind(Uuid::new_v4())
        .bind(&new.from_email)
        .bind(&new.from_name)
        .bind(&new.reply_to)
        .bind(&new.subject)
        .bind(&new.html)
        .bind(&new.text)
        .bind(&new.headers)
        .bind(&new.attachments)
        .bind(new.track_opens)
        .bind(new.track_clicks)
        .bind(new.final_state)
        .bind(queued_at)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn message(&self, id: MessageId) -> Result<Option<Message>, Error> {
        Ok(sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn add_recipients(
        &self,
        message_id: MessageId,
        recipients: Vec<NewRecipient>,
    ) -> Result<Vec<MessageRecipient>, Error> {
        let mut rows = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            rows.push(
                sqlx::query_as::<_, MessageRecipient>(&format!(
                    r#"
                    INSERT INTO message_recipients (message_id, kind, address, tracking_token)
                    VALUES ($1, $2, $3, $4)
                    RETURNING {RECIPIENT_COLUMNS}
                    "#
                ))
                .bind(message_id)
                .bind(recipient.kind)
                .bind(&recipient.address)
                .bind(Uuid::new_v4())
                .fetch_one(&self.pool)
                .await?,
            );
        }
        Ok(rows)
    }

    async fn recipients(&self, message_id: MessageId) -> Result<Vec<MessageRecipient>, Error> {
        Ok(sqlx::query_as::<_, MessageRecipient>(&format!(
            "SELECT {RECIPIENT_COLUMNS} FROM message_recipients WHERE message_id = $1 ORDER BY id"
        ))
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn recipient_by_address(
        &self,
        message_id: MessageId,
        address: &str,
    ) -> Result<Option<MessageRecipient>, Error> {
        Ok(sqlx::query_as::<_, MessageRecipient>(&format!(
            "SELECT {RECIPIENT_COLUMNS} FROM message_recipients \
             WHERE message_id = $1 AND address = $2"
        ))
        .bind(message_id)
        .bind(address)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn set_message_state(&self, id: MessageId, state: MessageState) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE messages
            SET final_state = $2,
                sent_at = CASE WHEN $2 = 'sent'::message_state THEN NOW() ELSE sent_at END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(state)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_provider_message_id(
        &self,
        id: MessageId,
        provider_message_id: &str,
    ) -> Result<(), Error> {
        sqlx::query("UPDATE messages SET provider_message_id = $2 WHERE id = $1")
            .bind(id)
            .bind(provider_message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_recipient_status(
        &self,
        message_id: MessageId,
        address: &str,
        status: RecipientStatus,
        smtp_code: Option<i32>,
        smtp_text: Option<String>,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE message_recipients
            SET status = $3,
                smtp_code = $4,
                smtp_text = $5,
                sent_at = CASE WHEN $3 = 'sent'::recipient_status THEN NOW() ELSE sent_at END,
                failed_at = CASE WHEN $3 = 'failed'::recipient_status THEN NOW() ELSE failed_at END
            WHERE message_id = $1 AND address = $2
            "#,
        )
        .bind(message_id)
        .bind(address)
        .bind(status)
        .bind(smtp_code)
        .bind(smtp_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_event(&self, event: NewEvent) -> Result<MessageEvent, Error> {
        Ok(sqlx::query_as::<_, MessageEvent>(
            r#"
            INSERT INTO message_events (message_id, kind, recipient, provider, payload)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, message_id, kind, recipient, provider, payload, occurred_at
            "#,
        )
        .bind(event.message_id)
        .bind(event.kind)
        .bind(&event.recipient)
        .bind(&event.provider)
        .bind(&event.payload)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn events(&self, message_id: MessageId) -> Result<Vec<MessageEvent>, Error> {
        Ok(sqlx::query_as::<_, MessageEvent>(
            r#"
            SELECT id, message_id, kind, recipient, provider, payload, occurred_at
            FROM message_events
            WHERE message_id = $1
            ORDER BY id
            "#,
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?)
    }
}
