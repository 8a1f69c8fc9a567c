//! Persistence ports. The Postgres repositories in `models/` implement these
//! per aggregate; `MemoryStore` implements all of them for development and
//! tests.

use crate::models::{
    Contact, ContactId, DkimKey, Domain, DomainId, DomainStatus, Error, ListId, Message,
    MessageEvent, MessageId, MessageRecipient, MessageState, NewDelivery, NewDkimKey, NewEvent,
    NewMessage, NewRecipient, NewSuppression, Plan, PlanId, RecipientStatus, Segment,
    SegmentBuild, SegmentId, Suppression, Tenant, TenantId, UsageDelta, Webhook, WebhookDelivery,
    WebhookId,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashSet;

mod memory;
pub use memory::MemoryStore;

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn tenant(&self, id: TenantId) -> Result<Option<Tenant>, Error>;
    async fn plan(&self, id: PlanId) -> Result<Option<Plan>, Error>;
}

#[async_trait]
pub trait DomainStore: Send + Sync {
    async fn domain(&self, id: DomainId) -> Result<Option<Domain>, Error>;
    async fn domains_with_status(&self, status: DomainStatus) -> Result<Vec<Domain>, Error>;
    async fn update_verification(
        &self,
        id: DomainId,
        status: DomainStatus,
        report: serde_json::Value,
        verified_at: Option<DateTime<Utc>>,
        checked_at: DateTime<Utc>,
    ) -> Result<(), Error>;
    async fn active_dkim_key(
        &self,
        domain_id: DomainId,
        selector: &str,
    ) -> Result<Option<DkimKey>, Error>;
    /// All active keys joined with their domain name, for table sync.
    async fn active_dkim_keys(&self) -> Result<Vec<(String, DkimKey)>, Error>;
    /// Deactivates any previous key for the same (domain, selector).
    async fn insert_dkim_key(&self, new: NewDkimKey) -> Result<DkimKey, Error>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(&self, new: NewMessage) -> Result<Message, Error>;
    async fn message(&self, id: MessageId) -> Result<Option<Message>, Error>;
    async fn add_recipients(
        &self,
        message_id: MessageId,
        recipients: Vec<NewRecipient>,
    ) -> Result<Vec<MessageRecipient>, Error>;
    async fn recipients(&self, message_id: MessageId) -> Result<Vec<MessageRecipient>, Error>;
    async fn recipient_by_address(
        &self,
        message_id: MessageId,
        address: &str,
    ) -> Result<Option<MessageRecipient>, Error>;
    async fn set_message_state(&self, id: MessageId, state: MessageState) -> Result<(), Error>;
    async fn set_provider_message_id(
        &self,
        id: MessageId,
        provider_message_id: &str,
    ) -> Result<(), Error>;
    async fn set_recipient_status(
        &self,
        message_id: MessageId,
        address: &str,
        status: RecipientStatus,
        smtp_code: Option<i32>,
        smtp_text: Option<String>,
    ) -> Result<(), Error>;
    async fn record_event(&self, event: NewEvent) -> Result<MessageEvent, Error>;
    async fn events(&self, message_id: MessageId) -> Result<Vec<MessageEvent>, Error>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn add_usage(
        &self,
        tenant: TenantId,
        day: NaiveDate,
        delta: UsageDelta,
    ) -> Result<(), Error>;
    async fn sent_on(&self, tenant: TenantId, day: NaiveDate) -> Result<i64, Error>;
    /// Idempotent: a no-op when the row already exists.
    async fn ensure_counter(
        &self,
        tenant: TenantId,
        key: &str,
        window_start: NaiveDate,
    ) -> Result<(), Error>;
    async fn incr_counter(
        &self,
        tenant: TenantId,
        key: &str,
        window_start: NaiveDate,
        n: i64,
    ) -> Result<(), Error>;
    /// Missing rows read as 0.
    async fn counter(
        &self,
        tenant: TenantId,
        key: &str,
        window_start: NaiveDate,
    ) -> Result<i64, Error>;
}

#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn webhook(&self, id: WebhookId) -> Result<Option<Webhook>, Error>;
    async fn active_for(&self, tenant: TenantId, kind: &str) -> Result<Vec<Webhook>, Error>;
    async fn record_delivery(&self, new: NewDelivery) -> Result<WebhookDelivery, Error>;
    async fn due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>, Error>;
    async fn clear_retry(&self, delivery_id: i64) -> Result<(), Error>;
}

#[async_trait]
pub trait AudienceStore: Send + Sync {
    async fn contacts(&self, tenant: TenantId) -> Result<Vec<Contact>, Error>;
    async fn contact_ids_in_list(&self, list: ListId) -> Result<HashSet<ContactId>, Error>;
    async fn segment(&self, id: SegmentId) -> Result<Option<Segment>, Error>;
    async fn record_build(
        &self,
        segment_id: SegmentId,
        matches: i64,
    ) -> Result<SegmentBuild, Error>;
    async fn members(&self, segment: SegmentId) -> Result<HashSet<ContactId>, Error>;
    async fn add_members(
        &self,
        segment: SegmentId,
        contacts: &[ContactId],
        built_at: DateTime<Utc>,
    ) -> Result<(), Error>;
    async fn remove_members(&self, segment: SegmentId, contacts: &[ContactId])
        -> Result<(), Error>;
    async fn update_segment_counters(
        &self,
        segment: SegmentId,
        materialized_count: i64,
        built_at: DateTime<Utc>,
    ) -> Result<(), Error>;
    async fn suppression(
        &self,
        tenant: TenantId,
        address: &str,
    ) -> Result<Option<Suppression>, Error>;
    async fn add_suppression(&self, new: NewSuppression) -> Result<(), Error>;
}
