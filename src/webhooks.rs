//! Webhook fan-out and delivery: subscription matching, HMAC-signed POSTs,
//! the delivery ledger, and the bounded retry schedule.

use crate::bus::{Entry, StreamBus, WEBHOOK_GROUP, WEBHOOK_STREAM};
use crate::models::{Error, NewDelivery, TenantId, Webhook, WebhookId};
use crate::store::WebhookStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Monkeys-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Monkeys-Timestamp";
pub const ID_HEADER: &str = "X-Monkeys-Id";

/// Hex HMAC-SHA-256 over `{timestampSeconds}.{body}` with the webhook secret.
pub fn sign(secret: &str, timestamp_secs: i64, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(format!("{timestamp_secs}.{body}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn signature_header(secret: &str, timestamp_secs: i64, body: &str) -> String {
    format!("v1={},alg=HMAC-SHA256", sign(secret, timestamp_secs, body))
}

/// An outbound event as observed by tenant webhooks.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OutboundEvent {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeliveryJob {
    pub webhook_id: WebhookId,
    pub event: OutboundEvent,
    pub attempt: i32,
    pub enqueued_at: DateTime<Utc>,
}

impl DeliveryJob {
    pub fn encode(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        Ok(vec![("json", serde_json::to_string(self)?)])
    }

    pub fn decode(entry: &Entry) -> Option<DeliveryJob> {
        let json = entry.field("json").or_else(|| {
            (entry.fields.len() == 1).then(|| entry.fields[0].1.as_str())
        })?;
        serde_json::from_str(json).ok()
    }
}

/// Fans an event out to every matching subscription. Never raises to the
/// event producer: failures are logged and the event is dropped.
#[derive(Clone)]
pub struct WebhookDispatcher {
    store: Arc<dyn WebhookStore>,
    bus: Arc<dyn StreamBus>,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<dyn WebhookStore>, bus: Arc<dyn StreamBus>) -> Self {
        Self { store, bus }
    }

    pub async fn dispatch(
        &self,
        tenant: TenantId,
        kind: &str,
        payload: serde_json::Value,
        event_id: Option<Uuid>,
    ) {
        let webhooks = match self.store.active_for(tenant, kind).await {
            Ok(webhooks) => webhooks,
            Err(err) => {
                error!(%tenant, kind, "could not load webhook subscriptions: {err}");
                return;
            }
        };
        if webhooks.is_empty() {
            return;
        }

        let event = OutboundEvent {
            id: event_id.unwrap_or_else(Uuid::new_v4),
            tenant_id: tenant,
            kind: kind.to_string(),
            payload,
            occurred_at: Utc::now(),
        };

        for webhook in webhooks {
            let job = DeliveryJob {
                webhook_id: webhook.id,
                event: event.clone(),
                attempt: 1,
                enqueued_at: Utc::now(),
            };
            match job.encode() {
                Ok(fields) => {
                    if let Err(err) = self.bus.append(WEBHOOK_STREAM, &fields).await {
                        error!(webhook = %webhook.id, "could not enqueue delivery: {err}");
                    }
                }
                Err(err) => error!(webhook = %webhook.id, "could not encode delivery: {err}"),
            }
        }
    }

    /// Re-enqueues ledger rows whose `next_retry_at` has passed.
    pub async fn redrive_due(&self, limit: i64) -> Result<usize, Error> {
        let due = self.store.due_deliveries(Utc::now(), limit).await?;
        let mut redriven = 0;
        for delivery in due {
            let Ok(event) = serde_json::from_value::<OutboundEvent>(delivery.payload.clone())
            else {
                warn!(delivery = delivery.id, "skipping ledger row with opaque payload");
                self.store.clear_retry(delivery.id).await?;
                continue;
            };
            let job = DeliveryJob {
                webhook_id: delivery.webhook_id,
                event,
                attempt: delivery.attempt + 1,
                enqueued_at: Utc::now(),
            };
            self.bus
                .append(WEBHOOK_STREAM, &job.encode()?)
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
            self.store.clear_retry(delivery.id).await?;
            redriven += 1;
        }
        Ok(redriven)
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryWorkerConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub batch: usize,
    pub block_ms: u64,
    pub claim_idle_ms: u64,
    pub request_timeout_secs: u64,
}

impl DeliveryWorkerConfig {
    pub fn new(consumer: String) -> Self {
        Self {
            stream: WEBHOOK_STREAM.to_string(),
            group: WEBHOOK_GROUP.to_string(),
            consumer,
            batch: 20,
            block_ms: 5_000,
            claim_idle_ms: 60_000,
            request_timeout_secs: 10,
        }
    }
}

/// Transport used to POST webhook bodies; split out so tests can observe
/// requests without a live endpoint.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: String,
    ) -> Result<u16, String>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(timeout_secs))
                .build()
                .expect("could not build HTTP client"),
        }
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: String,
    ) -> Result<u16, String> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.body(body).send().await.map_err(|e| e.to_string())?;
        Ok(response.status().as_u16())
    }
}

pub struct DeliveryWorker {
    bus: Arc<dyn StreamBus>,
    store: Arc<dyn WebhookStore>,
    transport: Arc<dyn WebhookTransport>,
    config: DeliveryWorkerConfig,
}

impl DeliveryWorker {
    pub fn new(
        bus: Arc<dyn StreamBus>,
        store: Arc<dyn WebhookStore>,
        transport: Arc<dyn WebhookTransport>,
        config: DeliveryWorkerConfig,
    ) -> Self {
        Self {
            bus,
            store,
            transport,
            config,
        }
    }

    pub async fn prepare(&self) -> Result<(), Error> {
        self.bus
            .ensure_group(&self.config.stream, &self.config.group, "$")
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

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
        for entry in stale {
            self.process_entry(entry).await;
        }
        Ok(())
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
                error!("webhook worker could not prepare stream group: {err}");
                return;
            }
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("shutting down webhook delivery worker");
                        return;
                    }
                    result = self.run_once() => {
                        if let Err(err) = result {
                            error!("webhook delivery pass failed: {err}");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        })
    }

    async fn process_entry(&self, entry: Entry) {
        let Some(job) = DeliveryJob::decode(&entry) else {
            warn!(entry = %entry.id, "dropping undecodable delivery job");
            self.ack(&entry.id).await;
            return;
        };

        let webhook = match self.store.webhook(job.webhook_id).await {
            Ok(Some(webhook)) if webhook.active => webhook,
            Ok(_) => {
                debug!(webhook = %job.webhook_id, "webhook missing or inactive, dropping");
                self.ack(&entry.id).await;
                return;
            }
            Err(err) => {
                // leave the entry pending; it will be reclaimed
                error!(webhook = %job.webhook_id, "could not load webhook: {err}");
                return;
            }
        };

        self.deliver(&webhook, &job).await;
        self.ack(&entry.id).await;
    }

    /// One POST attempt plus its ledger row. Non-2xx and transport errors
    /// schedule the next retry until the webhook's cap is reached.
    async fn deliver(&self, webhook: &Webhook, job: &DeliveryJob) {
        let body = serde_json::json!({
            "id": job.event.id,
            "event": job.event.kind,
            "payload": job.event.payload,
            "occurredAt": job.event.occurred_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            "attempt": job.attempt,
        })
        .to_string();

        let timestamp = Utc::now().timestamp();
        let headers = vec![
            (ID_HEADER.to_string(), job.event.id.to_string()),
            (TIMESTAMP_HEADER.to_string(), timestamp.to_string()),
            (
                SIGNATURE_HEADER.to_string(),
                signature_header(&webhook.secret, timestamp, &body),
            ),
        ];

        let started = Instant::now();
        let result = self.transport.post(&webhook.url, &headers, body).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let (http_code, succeeded) = match &result {
            Ok(code) => (Some(*code as i32), (200..300).contains(code)),
            Err(_) => (None, false),
        };

        let exhausted = job.attempt >= webhook.max_retries;
        let next_retry_at = (!succeeded && !exhausted)
            .then(|| Utc::now() + Duration::seconds(webhook.backoff_secs(job.attempt)));

        let ledger = NewDelivery {
            webhook_id: webhook.id,
            event_id: job.event.id,
            attempt: job.attempt,
            http_code,
            response_time_ms: Some(elapsed_ms),
            payload: serde_json::to_value(&job.event).unwrap_or_default(),
            next_retry_at,
            delivered_at: succeeded.then(Utc::now),
        };
        if let Err(err) = self.store.record_delivery(ledger).await {
            error!(webhook = %webhook.id, "could not record delivery: {err}");
        }

        match (&result, succeeded) {
            (_, true) => debug!(webhook = %webhook.id, "webhook delivered"),
            (Ok(code), false) => warn!(
                webhook = %webhook.id,
                attempt = job.attempt,
                "webhook endpoint answered HTTP {code}"
            ),
            (Err(err), _) => warn!(
                webhook = %webhook.id,
                attempt = job.attempt,
                "webhook delivery failed: {err}"
            ),
        }
    }

    async fn ack(&self, id: &str) {
        if let Err(err) = self.bus.ack(&self.config.stream, &self.config.group, id).await {
            error!(entry = id, "could not ack delivery entry: {err}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    struct ScriptedTransport {
        responses: Mutex<Vec<Result<u16, String>>>,
        requests: Mutex<Vec<(String, Vec<(String, String)>, String)>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<u16, String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WebhookTransport for ScriptedTransport {
        async fn post(
            &self,
            url: &str,
            headers: &[(String, String)],
            body: String,
        ) -> Result<u16, String> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), headers.to_vec(), body));
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(200)
            } else {
                responses.remove(0)
            }
        }
    }

    fn webhook(store: &MemoryStore, max_retries: i32) -> Webhook {
        let hook = Webhook {
            id: 1.into(),
            tenant_id: 9.into(),
            url: "https://hooks.example/in".to_string(),
            events: vec!["sent".to_string()],
            secret: "whsec_test".to_string(),
            batch_size: 1,
            max_retries,
            backoff: serde_json::json!([60, 120]),
            active: true,
        };
        store.insert_webhook(hook.clone());
        hook
    }

    async fn setup(
        responses: Vec<Result<u16, String>>,
    ) -> (
        Arc<MemoryBus>,
        Arc<MemoryStore>,
        Arc<ScriptedTransport>,
        DeliveryWorker,
        WebhookDispatcher,
    ) {
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ScriptedTransport::new(responses));
        let worker = DeliveryWorker::new(
            bus.clone(),
            store.clone(),
            transport.clone(),
            DeliveryWorkerConfig::new("test-1".to_string()),
        );
        let dispatcher = WebhookDispatcher::new(store.clone(), bus.clone());
        bus.ensure_group(WEBHOOK_STREAM, WEBHOOK_GROUP, "0")
            .await
            .unwrap();
        (bus, store, transport, worker, dispatcher)
    }

    #[test]
    fn signature_matches_known_vector() {
        // HMAC-SHA256("1700000000.{}", "secret")
        let sig = sign("secret", 1_700_000_000, "{}");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, sign("secret", 1_700_000_000, "{}"));
        assert_ne!(sig, sign("secret", 1_700_000_001, "{}"));
        assert_ne!(sig, sign("other", 1_700_000_000, "{}"));

        let header = signature_header("secret", 1_700_000_000, "{}");
        assert!(header.starts_with("v1="));
        assert!(header.ends_with(",alg=HMAC-SHA256"));
    }

    #[tokio::test]
    async fn dispatch_enqueues_one_job_per_matching_webhook() {
        let (bus, store, _, _, dispatcher) = setup(vec![]).await;
        webhook(&store, 3);
        store.insert_webhook(Webhook {
            id: 2.into(),
            tenant_id: 9.into(),
            url: "https://other.example".to_string(),
            events: vec!["bounced".to_string()],
            secret: "s".to_string(),
            batch_size: 1,
            max_retries: 3,
            backoff: serde_json::json!(null),
            active: true,
        });

        dispatcher
            .dispatch(9.into(), "sent", serde_json::json!({"m": 1}), None)
            .await;

        let entries = bus.entries(WEBHOOK_STREAM);
        assert_eq!(entries.len(), 1);
        let job = DeliveryJob::decode(&entries[0]).unwrap();
        assert_eq!(job.webhook_id, 1.into());
        assert_eq!(job.attempt, 1);
        assert_eq!(job.event.kind, "sent");
    }

    #[tokio::test]
    async fn successful_delivery_signs_and_records() {
        let (_, store, transport, worker, dispatcher) = setup(vec![Ok(200)]).await;
        let hook = webhook(&store, 3);

        dispatcher
            .dispatch(9.into(), "sent", serde_json::json!({"m": 1}), None)
            .await;
        worker.run_once().await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let (url, headers, body) = &requests[0];
        assert_eq!(url, &hook.url);

        let timestamp: i64 = headers
            .iter()
            .find(|(name, _)| name == TIMESTAMP_HEADER)
            .unwrap()
            .1
            .parse()
            .unwrap();
        let signature = &headers
            .iter()
            .find(|(name, _)| name == SIGNATURE_HEADER)
            .unwrap()
            .1;
        assert_eq!(*signature, signature_header(&hook.secret, timestamp, body));

        let deliveries = store.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].http_code, Some(200));
        assert!(deliveries[0].delivered_at.is_some());
        assert!(deliveries[0].next_retry_at.is_none());
    }

    #[tokio::test]
    async fn failed_delivery_schedules_backoff_until_exhausted() {
        let (_, store, _, worker, dispatcher) = setup(vec![Ok(500), Err("timeout".into())]).await;
        webhook(&store, 2);

        dispatcher
            .dispatch(9.into(), "sent", serde_json::json!({}), None)
            .await;
        worker.run_once().await.unwrap();

        let deliveries = store.deliveries();
        assert_eq!(deliveries[0].http_code, Some(500));
        let retry_at = deliveries[0].next_retry_at.unwrap();
        assert!(retry_at > Utc::now() + Duration::seconds(55));

        // redrive enqueues attempt 2, which is the final allowed attempt
        let redriven = dispatcher.redrive_due(10).await.unwrap();
        assert_eq!(redriven, 0, "retry is not due yet");

        // force the due time into the past by rebuilding the ledger row
        store.clear_retry(deliveries[0].id).await.unwrap();
        store
            .record_delivery(NewDelivery {
                webhook_id: deliveries[0].webhook_id,
                event_id: deliveries[0].event_id,
                attempt: 1,
                http_code: Some(500),
                response_time_ms: Some(1),
                payload: deliveries[0].payload.clone(),
                next_retry_at: Some(Utc::now() - Duration::seconds(1)),
                delivered_at: None,
            })
            .await
            .unwrap();
        assert_eq!(dispatcher.redrive_due(10).await.unwrap(), 1);

        worker.run_once().await.unwrap();
        let deliveries = store.deliveries();
        let last = deliveries.last().unwrap();
        assert_eq!(last.attempt, 2);
        assert_eq!(last.http_code, None);
        assert!(
            last.next_retry_at.is_none(),
            "attempt 2 of 2 is terminal, no more retries"
        );
    }
}
