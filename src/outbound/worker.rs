//! Mail stream consumer: claims stale entries, decodes jobs, injects
//! tracking, sends over SMTP, and retries with a cap before dead-lettering.

use crate::bus::{
    Entry, KvStore, MAIL_GROUP, MAIL_STREAM, StatusWriter, StreamBus, dlq_stream, mail_status_key,
};
use crate::models::{
    Error, EventKind, Message, MessageState, NewEvent, NewSuppression, RecipientStatus,
};
use crate::outbound::job::SendJob;
use crate::outbound::tracking;
use crate::smtp::{Attachment, MailContent, MailSender};
use crate::store::{AudienceStore, MessageStore};
use crate::webhooks::WebhookDispatcher;
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub batch: usize,
    pub block_ms: u64,
    pub claim_idle_ms: u64,
    pub max_retries: u32,
    /// Base URL of the tracking host, e.g. `https://t.example`.
    pub tracking_base: String,
}

impl WorkerConfig {
    pub fn new(consumer: String, tracking_base: String) -> Self {
        Self {
            stream: MAIL_STREAM.to_string(),
            group: MAIL_GROUP.to_string(),
            consumer,
            batch: 20,
            block_ms: 5_000,
            claim_idle_ms: 60_000,
            max_retries: 5,
            tracking_base,
        }
    }
}

pub struct OutboundWorker {
    bus: Arc<dyn StreamBus>,
    messages: Arc<dyn MessageStore>,
    audience: Arc<dyn AudienceStore>,
    sender: Arc<dyn MailSender>,
    dispatcher: WebhookDispatcher,
    status: StatusWriter<dyn KvStore>,
    config: WorkerConfig,
}

impl OutboundWorker {
    pub fn new(
        bus: Arc<dyn StreamBus>,
        messages: Arc<dyn MessageStore>,
        audience: Arc<dyn AudienceStore>,
        sender: Arc<dyn MailSender>,
        dispatcher: WebhookDispatcher,
        kv: Arc<dyn KvStore>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            bus,
            messages,
            audience,
            sender,
            dispatcher,
            status: StatusWriter::new(kv, Duration::from_secs(5)),
            config,
        }
    }

    /// Creates the group and re-processes entries this consumer took but
    /// never acked before its last shutdown.
    pub async fn prepare(&self) -> Result<(), Error> {
        self.bus
            .ensure_group(&self.config.stream, &self.config.group, "$")
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        loop {
            let stale = self
                .bus
                .read_group(
                    &self.config.stream,
                    &self.config.group,
                    &self.config.consumer,
                    "0",
                    self.config.batch,
                    0,
                )
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
            if stale.is_empty() {
                return Ok(());
            }
            debug!(count = stale.len(), "re-processing stale pending entries");
            for entry in stale {
                self.process_entry(entry).await;
            }
        }
    }

    pub async fn run_once(&self) -> Result<usize, Error> {
        let claimed = self
            .bus
            .auto_claim(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                self.config.claim_idle_ms,
                self.config.batch,
            )
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        let fresh = self
            .bus
            .read_group(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                ">",
                self.config.batch,
                self.config.block_ms,
            )
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        let mut processed = 0;
        for entry in claimed.into_iter().chain(fresh) {
            self.process_entry(entry).await;
            processed += 1;
        }
        Ok(processed)
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(err) = self.prepare().await {
                error!("outbound worker could not prepare stream group: {err}");
                return;
            }
            info!(consumer = %self.config.consumer, "outbound worker started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("shutting down outbound worker");
                        return;
                    }
                    result = self.run_once() => {
                        if let Err(err) = result {
                            error!("outbound pass failed: {err}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        })
    }

    pub async fn process_entry(&self, entry: Entry) {
        let job = match SendJob::decode(&entry) {
            Ok(job) => job,
            Err(err) => {
                // malformed entries are never retried
                warn!(entry = %entry.id, "dropping undecodable job: {err}");
                self.ack(&entry.id).await;
                return;
            }
        };

        let message = match self.messages.message(job.message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(message = %job.message_id, "message gone, dropping job");
                self.ack(&entry.id).await;
                return;
            }
            Err(err) => {
                // repository hiccups leave the entry pending; the reclaim
                // path picks it up and this is not a delivery retry
                error!(message = %job.message_id, "could not load message: {err}");
                return;
            }
        };

        let status_key = mail_status_key(job.tenant_id, message.external_id);
        self.status
            .heartbeat(
                &status_key,
                json!({
                    "status": "sending",
                    "progress": 50,
                    "heartbeatAt": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                }),
            )
            .await
            .ok();

        let mut content = self.build_content(&message);
        self.apply_tracking(&message, &job, &mut content).await;
        let outcome = self.sender.send(&content, &job.envelope).await;

        if outcome.ok {
            self.finish_sent(&entry, &job, &message, outcome.message_id, &status_key)
                .await;
        } else {
            let error = outcome.error.unwrap_or_else(|| "send failed".to_string());
            self.handle_failure(&entry, job, &message, error, &status_key)
                .await;
        }
    }

    fn build_content(&self, message: &Message) -> MailContent {
        let attachments: Vec<Attachment> =
            serde_json::from_value(message.attachments.clone()).unwrap_or_default();

        MailContent {
            subject: message.subject.clone().unwrap_or_default(),
            html: message.html.clone(),
            text: message.text.clone(),
            attachments,
        }
    }

    /// Tracking rewrite needs the recipient's token, which lives in the
    /// store; jobs with more than one address skip injection because no
    /// per-address attribution is possible.
    async fn apply_tracking(&self, message: &Message, job: &SendJob, content: &mut MailContent) {
        if job.envelope.recipient_count() != 1 {
            warn!(
                message = %message.external_id,
                "job has multiple recipients, skipping tracking injection"
            );
            return;
        }
        let Some(address) = job.envelope.recipients().next() else {
            return;
        };
        let Some(html) = content.html.clone() else {
            return;
        };

        let recipient = match self
            .messages
            .recipient_by_address(message.id, address)
            .await
        {
            Ok(Some(recipient)) => recipient,
            _ => return,
        };

        let mut html = html;
        if message.track_clicks {
            html = tracking::rewrite_links(&html, &self.config.tracking_base, &recipient.tracking_token);
        }
        if message.track_opens {
            html = tracking::inject_pixel(&html, &self.config.tracking_base, &recipient.tracking_token);
        }
        content.html = Some(html);
    }

    async fn finish_sent(
        &self,
        entry: &Entry,
        job: &SendJob,
        message: &Message,
        provider_message_id: Option<String>,
        status_key: &str,
    ) {
        if let Some(provider_id) = &provider_message_id {
            self.messages
                .set_provider_message_id(message.id, provider_id)
                .await
                .ok();
        }
        if let Err(err) = self
            .messages
            .set_message_state(message.id, MessageState::Sent)
            .await
        {
            error!(message = %message.external_id, "could not mark message sent: {err}");
        }

        let single_recipient = (job.envelope.recipient_count() == 1)
            .then(|| job.envelope.recipients().next().map(str::to_string))
            .flatten();
        for address in job.envelope.recipients() {
            self.messages
                .set_recipient_status(message.id, address, RecipientStatus::Sent, None, None)
                .await
                .ok();
        }

        self.messages
            .record_event(NewEvent {
                message_id: message.id,
                kind: EventKind::Sent,
                recipient: single_recipient.clone(),
                provider: provider_message_id.clone(),
                payload: serde_json::Value::Null,
            })
            .await
            .ok();

        self.dispatcher
            .dispatch(
                message.tenant_id,
                EventKind::Sent.as_str(),
                json!({
                    "message": message.external_id,
                    "recipient": single_recipient,
                    "providerMessageId": provider_message_id,
                }),
                None,
            )
            .await;

        self.status
            .set(
                status_key,
                json!({
                    "status": "sent",
                    "progress": 100,
                    "sentAt": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                }),
            )
            .await
            .ok();

        self.ack(&entry.id).await;
        debug!(message = %message.external_id, "job delivered");
    }

    /// Retry with a cap: the replacement entry (or the DLQ entry) is
    /// appended before the live entry is acked, so the job is never lost.
    async fn handle_failure(
        &self,
        entry: &Entry,
        mut job: SendJob,
        message: &Message,
        send_error: String,
        status_key: &str,
    ) {
        if job.retries + 1 > self.config.max_retries {
            let payload = match serde_json::to_string(&job) {
                Ok(payload) => payload,
                Err(err) => {
                    error!("could not serialize job for DLQ: {err}");
                    return;
                }
            };
            let dlq = dlq_stream(&self.config.stream);
            let fields = [
                ("json", payload),
                ("error", send_error.clone()),
                ("at", Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            ];
            if let Err(err) = self.bus.append(&dlq, &fields).await {
                // keep the entry pending rather than losing it
                error!(entry = %entry.id, "could not dead-letter job: {err}");
                return;
            }
            warn!(
                message = %message.external_id,
                retries = job.retries,
                "job exhausted retries, dead-lettered: {send_error}"
            );

            self.messages
                .set_message_state(message.id, MessageState::Failed)
                .await
                .ok();
            for address in job.envelope.recipients() {
                self.messages
                    .set_recipient_status(
                        message.id,
                        address,
                        RecipientStatus::Failed,
                        None,
                        Some(send_error.clone()),
                    )
                    .await
                    .ok();
                self.audience
                    .add_suppression(NewSuppression {
                        tenant_id: message.tenant_id,
                        address: address.to_string(),
                        kind: "bounce".to_string(),
                        reason: Some(send_error.clone()),
                        expires_at: None,
                    })
                    .await
                    .ok();
            }
            self.messages
                .record_event(NewEvent {
                    message_id: message.id,
                    kind: EventKind::Failed,
                    recipient: None,
                    provider: None,
                    payload: json!({"error": send_error}),
                })
                .await
                .ok();
            self.dispatcher
                .dispatch(
                    message.tenant_id,
                    EventKind::Failed.as_str(),
                    json!({"message": message.external_id, "error": send_error}),
                    None,
                )
                .await;
            self.status
                .set(
                    status_key,
                    json!({
                        "status": "error",
                        "progress": 100,
                        "failedAt": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                    }),
                )
                .await
                .ok();

            self.ack(&entry.id).await;
            return;
        }

        job.retries += 1;
        let fields = match job.encode() {
            Ok(fields) => fields,
            Err(err) => {
                error!("could not re-encode job for retry: {err}");
                return;
            }
        };
        match self.bus.append(&self.config.stream, &fields).await {
            Ok(_) => {
                info!(
                    message = %message.external_id,
                    retries = job.retries,
                    "send failed, job re-enqueued: {send_error}"
                );
                self.ack(&entry.id).await;
            }
            Err(err) => {
                // no ack: the original entry stays pending and is reclaimed
                error!(entry = %entry.id, "could not re-enqueue job: {err}");
            }
        }
    }

    async fn ack(&self, id: &str) {
        if let Err(err) = self.bus.ack(&self.config.stream, &self.config.group, id).await {
            error!(entry = id, "could not ack entry: {err}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bus::{MemoryBus, WEBHOOK_STREAM};
    use crate::models::{NewMessage, NewRecipient, RecipientKind, Tenant, Webhook};
    use crate::smtp::{Envelope, RecordingSender, SendOutcome};
    use crate::store::MemoryStore;

    struct Fixture {
        bus: Arc<MemoryBus>,
        store: Arc<MemoryStore>,
        sender: Arc<RecordingSender>,
        worker: OutboundWorker,
    }

    fn fixture(max_retries: u32) -> Fixture {
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingSender::new());
        store.insert_tenant(Tenant {
            id: 1.into(),
            plan_id: 1.into(),
            daily_limit_override: None,
            monthly_limit_override: None,
            created_at: Utc::now(),
        });

        let mut config =
            WorkerConfig::new("test-1".to_string(), "https://t.example".to_string());
        config.max_retries = max_retries;
        config.block_ms = 0;

        let worker = OutboundWorker::new(
            bus.clone(),
            store.clone(),
            store.clone(),
            sender.clone(),
            WebhookDispatcher::new(store.clone(), bus.clone()),
            bus.clone(),
            config,
        );
        Fixture {
            bus,
            store,
            sender,
            worker,
        }
    }

    async fn seed_message(
        store: &MemoryStore,
        html: &str,
        addresses: &[&str],
    ) -> (Message, Vec<crate::models::MessageRecipient>) {
        let message = store
            .create_message(NewMessage {
                tenant_id: 1.into(),
                domain_id: None,
                from_email: "x@a.tld".to_string(),
                from_name: None,
                reply_to: None,
                subject: Some("Hi".to_string()),
                html: Some(html.to_string()),
                text: None,
                headers: json!({}),
                attachments: json!([]),
                track_opens: true,
                track_clicks: true,
                final_state: MessageState::Queued,
            })
            .await
            .unwrap();
        let recipients = store
            .add_recipients(
                message.id,
                addresses
                    .iter()
                    .map(|a| NewRecipient {
                        kind: RecipientKind::To,
                        address: a.to_string(),
                    })
                    .collect(),
            )
            .await
            .unwrap();
        (message, recipients)
    }

    async fn enqueue(fx: &Fixture, message: &Message, addresses: &[&str]) {
        let job = SendJob {
            message_id: message.id,
            tenant_id: message.tenant_id,
            domain_id: None,
            envelope: Envelope {
                from: message.from_email.clone(),
                to: addresses.iter().map(|a| a.to_string()).collect(),
                ..Default::default()
            },
            retries: 0,
            enqueued_at: None,
        };
        fx.bus
            .append(MAIL_STREAM, &job.encode().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn tracked_single_recipient_gets_pixel_and_click_links() {
        let fx = fixture(5);
        fx.worker.prepare().await.unwrap();
        let html = r#"<html><body><a href="https://x.example/page">L</a></body></html>"#;
        let (message, recipients) = seed_message(&fx.store, html, &["u@b.tld"]).await;
        let token = recipients[0].tracking_token;
        enqueue(&fx, &message, &["u@b.tld"]).await;

        assert_eq!(fx.worker.run_once().await.unwrap(), 1);

        let sent = fx.sender.sent();
        assert_eq!(sent.len(), 1);
        let html = sent[0].0.html.as_ref().unwrap();
        assert!(html.contains(&format!(
            "href=\"https://t.example/t/c/{token}?u=aHR0cHM6Ly94LmV4YW1wbGUvcGFnZQ\""
        )));
        assert!(html.ends_with(&format!(
            "<img src=\"https://t.example/t/o/{token}\" width=\"1\" height=\"1\" style=\"display:none;\" alt=\"\" /></body></html>"
        )));

        // message and recipient advanced to sent, event recorded, PEL empty
        let message = fx.store.message(message.id).await.unwrap().unwrap();
        assert_eq!(message.final_state, MessageState::Sent);
        assert!(message.sent_at.is_some());
        let recipient = fx
            .store
            .recipient_by_address(message.id, "u@b.tld")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recipient.status, RecipientStatus::Sent);
        let events = fx.store.events(message.id).await.unwrap();
        assert_eq!(events.last().unwrap().kind, EventKind::Sent);
        assert!(fx.bus.pending(MAIL_STREAM, MAIL_GROUP, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn multi_recipient_job_skips_tracking() {
        let fx = fixture(5);
        fx.worker.prepare().await.unwrap();
        let html = r#"<body><a href="https://x.example/p">L</a></body>"#;
        let (message, _) = seed_message(&fx.store, html, &["a@b.tld", "c@b.tld"]).await;
        enqueue(&fx, &message, &["a@b.tld", "c@b.tld"]).await;

        fx.worker.run_once().await.unwrap();

        let sent = fx.sender.sent();
        assert_eq!(sent[0].0.html.as_deref(), Some(html), "html untouched");
    }

    #[tokio::test]
    async fn failures_reenqueue_with_bumped_retries_then_dead_letter() {
        let fx = fixture(2);
        fx.worker.prepare().await.unwrap();
        let (message, _) = seed_message(&fx.store, "<p>hi</p>", &["u@b.tld"]).await;
        enqueue(&fx, &message, &["u@b.tld"]).await;

        for _ in 0..4 {
            fx.sender.push_outcome(SendOutcome::failure("550 rejected"));
        }

        // attempt 1: retries 0 -> replacement entry with retries 1
        fx.worker.run_once().await.unwrap();
        let entries = fx.bus.entries(MAIL_STREAM);
        assert_eq!(entries.len(), 2);
        let retry = SendJob::decode(&entries[1]).unwrap();
        assert_eq!(retry.retries, 1);

        // attempt 2: retries 1 -> replacement with retries 2
        fx.worker.run_once().await.unwrap();
        // attempt 3: retries 2, cap is 2 -> dead letter
        fx.worker.run_once().await.unwrap();

        let dlq = fx.bus.entries(&dlq_stream(MAIL_STREAM));
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].field("error"), Some("550 rejected"));
        let at = dlq[0].field("at").unwrap();
        assert!(at.ends_with('Z'), "ISO-8601 UTC timestamp, got {at}");
        let dead_job: SendJob = serde_json::from_str(dlq[0].field("json").unwrap()).unwrap();
        assert_eq!(dead_job.message_id, message.id);

        let message = fx.store.message(message.id).await.unwrap().unwrap();
        assert_eq!(message.final_state, MessageState::Failed);
        let events = fx.store.events(message.id).await.unwrap();
        assert_eq!(events.last().unwrap().kind, EventKind::Failed);

        // live entries all acked
        assert!(fx.bus.pending(MAIL_STREAM, MAIL_GROUP, 10).await.unwrap().is_empty());

        // terminal failure populates the suppression list
        assert!(
            fx.store
                .suppression(1.into(), "u@b.tld")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn malformed_and_orphaned_entries_are_dropped() {
        let fx = fixture(5);
        fx.worker.prepare().await.unwrap();

        fx.bus
            .append(MAIL_STREAM, &[("garbage", "not json".to_string())])
            .await
            .unwrap();
        // references a message that does not exist
        let job = SendJob {
            message_id: 404.into(),
            tenant_id: 1.into(),
            domain_id: None,
            envelope: Envelope::default(),
            retries: 0,
            enqueued_at: None,
        };
        fx.bus
            .append(MAIL_STREAM, &job.encode().unwrap())
            .await
            .unwrap();

        assert_eq!(fx.worker.run_once().await.unwrap(), 2);
        assert!(fx.sender.sent().is_empty());
        assert!(fx.bus.pending(MAIL_STREAM, MAIL_GROUP, 10).await.unwrap().is_empty());
        assert!(fx.bus.entries(&dlq_stream(MAIL_STREAM)).is_empty());
    }

    #[tokio::test]
    async fn sent_event_fans_out_to_webhooks() {
        let fx = fixture(5);
        fx.worker.prepare().await.unwrap();
        fx.store.insert_webhook(Webhook {
            id: 1.into(),
            tenant_id: 1.into(),
            url: "https://hooks.example".to_string(),
            events: vec!["sent".to_string()],
            secret: "s".to_string(),
            batch_size: 1,
            max_retries: 3,
            backoff: json!(null),
            active: true,
        });

        let (message, _) = seed_message(&fx.store, "<p>hi</p>", &["u@b.tld"]).await;
        enqueue(&fx, &message, &["u@b.tld"]).await;
        fx.worker.run_once().await.unwrap();

        let hooks = fx.bus.entries(WEBHOOK_STREAM);
        assert_eq!(hooks.len(), 1);
    }
}
