//! In-memory implementation of every store port. Used by the development
//! environment and by the test suite; state lives behind a single mutex and
//! is lost on process exit.

use crate::models::*;
use crate::store::{
    AudienceStore, DomainStore, MessageStore, TenantStore, UsageStore, WebhookStore,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    tenants: HashMap<TenantId, Tenant>,
    plans: HashMap<PlanId, Plan>,
    domains: HashMap<DomainId, Domain>,
    dkim_keys: Vec<DkimKey>,
    next_dkim_key: i64,
    messages: HashMap<MessageId, Message>,
    next_message: i64,
    recipients: Vec<MessageRecipient>,
    next_recipient: i64,
    events: Vec<MessageEvent>,
    next_event: i64,
    usage: HashMap<(TenantId, NaiveDate), UsageDelta>,
    counters: HashMap<(TenantId, String, NaiveDate), i64>,
    webhooks: HashMap<WebhookId, Webhook>,
    deliveries: Vec<WebhookDelivery>,
    next_delivery: i64,
    contacts: HashMap<ContactId, Contact>,
    list_contacts: HashSet<(ListId, ContactId)>,
    segments: HashMap<SegmentId, Segment>,
    builds: Vec<SegmentBuild>,
    next_build: i64,
    members: HashMap<SegmentId, HashMap<ContactId, DateTime<Utc>>>,
    suppressions: Vec<Suppression>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tenant(&self, tenant: Tenant) {
        self.state.lock().unwrap().tenants.insert(tenant.id, tenant);
    }

    pub fn insert_plan(&self, plan: Plan) {
        self.state.lock().unwrap().plans.insert(plan.id, plan);
    }

    pub fn insert_domain(&self, domain: Domain) {
        self.state.lock().unwrap().domains.insert(domain.id, domain);
    }

    pub fn insert_webhook(&self, webhook: Webhook) {
        self.state
            .lock()
            .unwrap()
            .webhooks
            .insert(webhook.id, webhook);
    }

    pub fn insert_contact(&self, contact: Contact) {
        self.state
            .lock()
            .unwrap()
            .contacts
            .insert(contact.id, contact);
    }

    pub fn add_to_list(&self, list: ListId, contact: ContactId) {
        self.state.lock().unwrap().list_contacts.insert((list, contact));
    }

    pub fn insert_segment(&self, segment: Segment) {
        self.state
            .lock()
            .unwrap()
            .segments
            .insert(segment.id, segment);
    }

    pub fn deliveries(&self) -> Vec<WebhookDelivery> {
        self.state.lock().unwrap().deliveries.clone()
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn tenant(&self, id: TenantId) -> Result<Option<Tenant>, Error> {
        Ok(self.state.lock().unwrap().tenants.get(&id).cloned())
    }

    async fn plan(&self, id: PlanId) -> Result<Option<Plan>, Error> {
        Ok(self.state.lock().unwrap().plans.get(&id).cloned())
    }
}

#[async_trait]
impl DomainStore for MemoryStore {
    async fn domain(&self, id: DomainId) -> Result<Option<Domain>, Error> {
        Ok(self.state.lock().unwrap().domains.get(&id).cloned())
    }

    async fn domains_with_status(&self, status: DomainStatus) -> Result<Vec<Domain>, Error> {
        let state = self.state.lock().unwrap();
        let mut domains: Vec<Domain> = state
            .domains
            .values()
            .filter(|d| d.status == status)
            .cloned()
            .collect();
        domains.sort_by_key(|d| *d.id);
        Ok(domains)
    }

    async fn update_verification(
        &self,
        id: DomainId,
        status: DomainStatus,
        report: serde_json::Value,
        verified_at: Option<DateTime<Utc>>,
        checked_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let domain = state
            .domains
            .get_mut(&id)
            .ok_or(Error::NotFound("domain"))?;
        domain.status = status;
        domain.verification_report = Some(report);
        if domain.verified_at.is_none() {
            domain.verified_at = verified_at;
        }
        domain.last_checked_at = Some(checked_at);
        Ok(())
    }

    async fn active_dkim_key(
        &self,
        domain_id: DomainId,
        selector: &str,
    ) -> Result<Option<DkimKey>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .dkim_keys
            .iter()
            .find(|k| k.domain_id == domain_id && k.selector == selector && k.active)
            .cloned())
    }

    async fn active_dkim_keys(&self) -> Result<Vec<(String, DkimKey)>, Error> {
        let state = self.state.lock().unwrap();
        let mut keys: Vec<(String, DkimKey)> = state
            .dkim_keys
            .iter()
            .filter(|k| k.active)
            .filter_map(|k| {
                state
                    .domains
                    .get(&k.domain_id)
                    .map(|d| (d.name.clone(), k.clone()))
            })
            .collect();
        keys.sort_by(|a, b| (&a.0, &a.1.selector).cmp(&(&b.0, &b.1.selector)));
        Ok(keys)
    }

    async fn insert_dkim_key(&self, new: NewDkimKey) -> Result<DkimKey, Error> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        for key in state
            .dkim_keys
            .iter_mut()
            .filter(|k| k.domain_id == new.domain_id && k.selector == new.selector && k.active)
        {
            key.active = false;
            key.rotated_at = Some(now);
        }
        state.next_dkim_key += 1;
        let key = DkimKey {
            id: state.next_dkim_key.into(),
            domain_id: new.domain_id,
            selector: new.selector,
            public_pem: new.public_pem,
            private_key_path: new.private_key_path,
            txt_value: new.txt_value,
            active: true,
            created_at: now,
            rotated_at: None,
        };
        state.dkim_keys.push(key.clone());
        Ok(key)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_message(&self, new: NewMessage) -> Result<Message, Error> {
        let mut state = self.state.lock().unwrap();
        state.next_message += 1;
        let now = Utc::now();
        let message = Message {
            id: state.next_message.into(),
            tenant_id: new.tenant_id,
            domain_id: new.domain_id,
            external_id: Uuid::new_v4(),
            from_email: new.from_email,
            from_name: new.from_name,
            reply_to: new.reply_to,
            subject: new.subject,
            html: new.html,
            text: new.text,
            headers: new.headers,
            attachments: new.attachments,
            track_opens: new.track_opens,
            track_clicks: new.track_clicks,
            provider_message_id: None,
            final_state: new.final_state,
            created_at: now,
            queued_at: matches!(new.final_state, MessageState::Queued).then_some(now),
            sent_at: None,
        };
        state.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn message(&self, id: MessageId) -> Result<Option<Message>, Error> {
        Ok(self.state.lock().unwrap().messages.get(&id).cloned())
    }

    async fn add_recipients(
        &self,
        message_id: MessageId,
        recipients: Vec<NewRecipient>,
    ) -> Result<Vec<MessageRecipient>, Error> {
        let mut state = self.state.lock().unwrap();
        let mut rows = Vec::with_capacity(recipients.len());
        for new in recipients {
            state.next_recipient += 1;
            let row = MessageRecipient {
                id: state.next_recipient,
                message_id,
                kind: new.kind,
                address: new.address,
                status: RecipientStatus::Queued,
                smtp_code: None,
                smtp_text: None,
                tracking_token: Uuid::new_v4(),
                queued_at: Utc::now(),
                sent_at: None,
                delivered_at: None,
                failed_at: None,
            };
            state.recipients.push(row.clone());
            rows.push(row);
        }
        Ok(rows)
    }

    async fn recipients(&self, message_id: MessageId) -> Result<Vec<MessageRecipient>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .recipients
            .iter()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn recipient_by_address(
        &self,
        message_id: MessageId,
        address: &str,
    ) -> Result<Option<MessageRecipient>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .recipients
            .iter()
            .find(|r| r.message_id == message_id && r.address == address)
            .cloned())
    }

    async fn set_message_state(&self, id: MessageId, state: MessageState) -> Result<(), Error> {
        let mut guard = self.state.lock().unwrap();
        let message = guard.messages.get_mut(&id).ok_or(Error::NotFound("message"))?;
        message.final_state = state;
        if state == MessageState::Sent {
            message.sent_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_provider_message_id(
        &self,
        id: MessageId,
        provider_message_id: &str,
    ) -> Result<(), Error> {
        let mut guard = self.state.lock().unwrap();
        let message = guard.messages.get_mut(&id).ok_or(Error::NotFound("message"))?;
        message.provider_message_id = Some(provider_message_id.to_string());
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
        let mut guard = self.state.lock().unwrap();
        let now = Utc::now();
        for recipient in guard
            .recipients
            .iter_mut()
            .filter(|r| r.message_id == message_id && r.address == address)
        {
            recipient.status = status;
            recipient.smtp_code = smtp_code;
            recipient.smtp_text = smtp_text.clone();
            match status {
                RecipientStatus::Sent => recipient.sent_at = Some(now),
                RecipientStatus::Failed => recipient.failed_at = Some(now),
                _ => {}
            }
        }
        Ok(())
    }

    async fn record_event(&self, event: NewEvent) -> Result<MessageEvent, Error> {
        let mut state = self.state.lock().unwrap();
        state.next_event += 1;
        let row = MessageEvent {
            id: state.next_event,
            message_id: event.message_id,
            kind: event.kind,
            recipient: event.recipient,
            provider: event.provider,
            payload: event.payload,
            occurred_at: Utc::now(),
        };
        state.events.push(row.clone());
        Ok(row)
    }

    async fn events(&self, message_id: MessageId) -> Result<Vec<MessageEvent>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.message_id == message_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn add_usage(
        &self,
        tenant: TenantId,
        day: NaiveDate,
        delta: UsageDelta,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let entry = state.usage.entry((tenant, day)).or_default();
        entry.sent += delta.sent;
        entry.delivered += delta.delivered;
        entry.bounced += delta.bounced;
        entry.complained += delta.complained;
        entry.opens += delta.opens;
        entry.clicks += delta.clicks;
        Ok(())
    }

    async fn sent_on(&self, tenant: TenantId, day: NaiveDate) -> Result<i64, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .usage
            .get(&(tenant, day))
            .map(|u| u.sent)
            .unwrap_or(0))
    }

    async fn ensure_counter(
        &self,
        tenant: TenantId,
        key: &str,
        window_start: NaiveDate,
    ) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .counters
            .entry((tenant, key.to_string(), window_start))
            .or_insert(0);
        Ok(())
    }

    async fn incr_counter(
        &self,
        tenant: TenantId,
        key: &str,
        window_start: NaiveDate,
        n: i64,
    ) -> Result<(), Error> {
        *self
            .state
            .lock()
            .unwrap()
            .counters
            .entry((tenant, key.to_string(), window_start))
            .or_insert(0) += n;
        Ok(())
    }

    async fn counter(
        &self,
        tenant: TenantId,
        key: &str,
        window_start: NaiveDate,
    ) -> Result<i64, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .counters
            .get(&(tenant, key.to_string(), window_start))
            .copied()
            .unwrap_or(0))
    }
}

#[async_trait]
impl WebhookStore for MemoryStore {
    async fn webhook(&self, id: WebhookId) -> Result<Option<Webhook>, Error> {
        Ok(self.state.lock().unwrap().webhooks.get(&id).cloned())
    }

    async fn active_for(&self, tenant: TenantId, kind: &str) -> Result<Vec<Webhook>, Error> {
        let state = self.state.lock().unwrap();
        let mut hooks: Vec<Webhook> = state
            .webhooks
            .values()
            .filter(|w| w.tenant_id == tenant && w.active && w.subscribes_to(kind))
            .cloned()
            .collect();
        hooks.sort_by_key(|w| *w.id);
        Ok(hooks)
    }

    async fn record_delivery(&self, new: NewDelivery) -> Result<WebhookDelivery, Error> {
        let mut state = self.state.lock().unwrap();
        state.next_delivery += 1;
        let row = WebhookDelivery {
            id: state.next_delivery,
            webhook_id: new.webhook_id,
            event_id: new.event_id,
            attempt: new.attempt,
            http_code: new.http_code,
            response_time_ms: new.response_time_ms,
            payload: new.payload,
            next_retry_at: new.next_retry_at,
            delivered_at: new.delivered_at,
            created_at: Utc::now(),
        };
        state.deliveries.push(row.clone());
        Ok(row)
    }

    async fn due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>, Error> {
        let state = self.state.lock().unwrap();
        let mut due: Vec<WebhookDelivery> = state
            .deliveries
            .iter()
            .filter(|d| {
                d.delivered_at.is_none() && d.next_retry_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|d| d.next_retry_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn clear_retry(&self, delivery_id: i64) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(delivery) = state.deliveries.iter_mut().find(|d| d.id == delivery_id) {
            delivery.next_retry_at = None;
        }
        Ok(())
    }
}

#[async_trait]
impl AudienceStore for MemoryStore {
    async fn contacts(&self, tenant: TenantId) -> Result<Vec<Contact>, Error> {
        let state = self.state.lock().unwrap();
        let mut contacts: Vec<Contact> = state
            .contacts
            .values()
            .filter(|c| c.tenant_id == tenant)
            .cloned()
            .collect();
        contacts.sort_by_key(|c| c.id);
        Ok(contacts)
    }

    async fn contact_ids_in_list(&self, list: ListId) -> Result<HashSet<ContactId>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .list_contacts
            .iter()
            .filter(|(l, _)| *l == list)
            .map(|(_, c)| *c)
            .collect())
    }

    async fn segment(&self, id: SegmentId) -> Result<Option<Segment>, Error> {
        Ok(self.state.lock().unwrap().segments.get(&id).cloned())
    }

    async fn record_build(
        &self,
        segment_id: SegmentId,
        matches: i64,
    ) -> Result<SegmentBuild, Error> {
        let mut state = self.state.lock().unwrap();
        state.next_build += 1;
        let build = SegmentBuild {
            id: state.next_build,
            segment_id,
            matches,
            hash: Uuid::new_v4(),
            built_at: Utc::now(),
        };
        state.builds.push(build.clone());
        Ok(build)
    }

    async fn members(&self, segment: SegmentId) -> Result<HashSet<ContactId>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .members
            .get(&segment)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn add_members(
        &self,
        segment: SegmentId,
        contacts: &[ContactId],
        built_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let members = state.members.entry(segment).or_default();
        for contact in contacts {
            members.entry(*contact).or_insert(built_at);
        }
        Ok(())
    }

    async fn remove_members(
        &self,
        segment: SegmentId,
        contacts: &[ContactId],
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(members) = state.members.get_mut(&segment) {
            for contact in contacts {
                members.remove(contact);
            }
        }
        Ok(())
    }

    async fn update_segment_counters(
        &self,
        segment: SegmentId,
        materialized_count: i64,
        built_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let segment = state
            .segments
            .get_mut(&segment)
            .ok_or(Error::NotFound("segment"))?;
        segment.materialized_count = materialized_count;
        segment.last_built_at = Some(built_at);
        Ok(())
    }

    async fn suppression(
        &self,
        tenant: TenantId,
        address: &str,
    ) -> Result<Option<Suppression>, Error> {
        let now = Utc::now();
        Ok(self
            .state
            .lock()
            .unwrap()
            .suppressions
            .iter()
            .find(|s| {
                s.tenant_id == tenant
                    && s.address == address
                    && s.expires_at.is_none_or(|at| at > now)
            })
            .cloned())
    }

    async fn add_suppression(&self, new: NewSuppression) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state
            .suppressions
            .iter_mut()
            .find(|s| s.tenant_id == new.tenant_id && s.address == new.address && s.kind == new.kind)
        {
            existing.reason = new.reason;
            existing.expires_at = new.expires_at;
        } else {
            state.suppressions.push(Suppression {
                tenant_id: new.tenant_id,
                address: new.address,
                kind: new.kind,
                reason: new.reason,
                created_at: Utc::now(),
                expires_at: new.expires_at,
            });
        }
        Ok(())
    }
}
