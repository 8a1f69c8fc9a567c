//! Segment evaluation and diff-based materialization, plus the stream-driven
//! orchestrator that runs builds with heartbeat status.

use crate::bus::{
    Entry, KvStore, SEGMENT_GROUP, SEGMENT_STREAM, StatusWriter, StreamBus, segment_status_key,
};
use crate::models::{Contact, ContactId, Error, ListId, SegmentId, TenantId};
use crate::store::AudienceStore;
use chrono::{DateTime, SecondsFormat, Utc};
use email_address::EmailAddress;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Recognized definition keys; unknown keys are ignored and all present
/// conditions are ANDed.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SegmentDefinition {
    pub status: Option<String>,
    pub email_contains: Option<String>,
    pub gdpr_consent: Option<bool>,
    pub in_list_ids: Option<Vec<ListId>>,
    pub not_in_list_ids: Option<Vec<ListId>>,
}

impl SegmentDefinition {
    pub fn parse(definition: &serde_json::Value) -> Self {
        serde_json::from_value(definition.clone()).unwrap_or_default()
    }

    /// `memberships` maps each referenced list to its contact set.
    pub fn matches(
        &self,
        contact: &Contact,
        memberships: &HashMap<ListId, HashSet<ContactId>>,
    ) -> bool {
        if contact.email.trim().is_empty() || contact.email.parse::<EmailAddress>().is_err() {
            return false;
        }
        if contact.bounced_at.is_some() || contact.unsubscribed_at.is_some() {
            return false;
        }

        if let Some(status) = &self.status {
            if contact.status != *status {
                return false;
            }
        }
        if let Some(needle) = &self.email_contains {
            if !contact
                .email
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase())
            {
                return false;
            }
        }
        if let Some(consent) = self.gdpr_consent {
            if contact.gdpr_consent_at.is_some() != consent {
                return false;
            }
        }
        if let Some(lists) = &self.in_list_ids {
            let in_any = lists.iter().any(|list| {
                memberships
                    .get(list)
                    .is_some_and(|members| members.contains(&contact.id))
            });
            if !in_any {
                return false;
            }
        }
        if let Some(lists) = &self.not_in_list_ids {
            let in_none = lists.iter().all(|list| {
                !memberships
                    .get(list)
                    .is_some_and(|members| members.contains(&contact.id))
            });
            if !in_none {
                return false;
            }
        }
        true
    }

    fn referenced_lists(&self) -> impl Iterator<Item = ListId> + '_ {
        self.in_list_ids
            .iter()
            .flatten()
            .chain(self.not_in_list_ids.iter().flatten())
            .copied()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
    pub build_id: i64,
    pub matches: i64,
    pub added: i64,
    pub removed: i64,
    pub kept: i64,
    pub built_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SegmentBuildService {
    store: Arc<dyn AudienceStore>,
}

impl SegmentBuildService {
    pub fn new(store: Arc<dyn AudienceStore>) -> Self {
        Self { store }
    }

    pub async fn build_segment(
        &self,
        tenant: TenantId,
        segment_id: SegmentId,
        materialize: bool,
    ) -> Result<BuildOutcome, Error> {
        let segment = self
            .store
            .segment(segment_id)
            .await?
            .ok_or(Error::NotFound("segment"))?;
        if segment.tenant_id != tenant {
            return Err(Error::CrossTenant);
        }

        let definition = SegmentDefinition::parse(&segment.definition);

        let mut memberships = HashMap::new();
        for list in definition.referenced_lists() {
            let members = self.store.contact_ids_in_list(list).await?;
            memberships.insert(list, members);
        }

        let matched: HashSet<ContactId> = self
            .store
            .contacts(tenant)
            .await?
            .iter()
            .filter(|contact| definition.matches(contact, &memberships))
            .map(|contact| contact.id)
            .collect();

        let build = self
            .store
            .record_build(segment_id, matched.len() as i64)
            .await?;

        if !materialize {
            return Ok(BuildOutcome {
                build_id: build.id,
                matches: build.matches,
                added: 0,
                removed: 0,
                kept: 0,
                built_at: build.built_at,
            });
        }

        let existing = self.store.members(segment_id).await?;
        let mut to_add: Vec<ContactId> = matched.difference(&existing).copied().collect();
        let mut to_remove: Vec<ContactId> = existing.difference(&matched).copied().collect();
        let kept = matched.intersection(&existing).count() as i64;
        to_add.sort();
        to_remove.sort();

        self.store
            .add_members(segment_id, &to_add, build.built_at)
            .await?;
        self.store.remove_members(segment_id, &to_remove).await?;
        self.store
            .update_segment_counters(segment_id, matched.len() as i64, build.built_at)
            .await?;

        debug!(
            segment = %segment_id,
            matches = build.matches,
            added = to_add.len(),
            removed = to_remove.len(),
            kept,
            "segment materialized"
        );

        Ok(BuildOutcome {
            build_id: build.id,
            matches: build.matches,
            added: to_add.len() as i64,
            removed: to_remove.len() as i64,
            kept,
            built_at: build.built_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BuildJob {
    #[serde(rename = "company_id")]
    pub tenant_id: TenantId,
    pub segment_id: SegmentId,
    pub materialize: bool,
    pub enqueued_at: DateTime<Utc>,
}

impl BuildJob {
    pub fn encode(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        Ok(vec![("json", serde_json::to_string(self)?)])
    }

    pub fn decode(entry: &Entry) -> Option<BuildJob> {
        let json = entry.field("json").or_else(|| {
            (entry.fields.len() == 1).then(|| entry.fields[0].1.as_str())
        })?;
        serde_json::from_str(json).ok()
    }
}

/// Enqueues build jobs and consumes them with the same PEL/claim/ack
/// discipline as the mail worker.
pub struct SegmentOrchestrator {
    bus: Arc<dyn StreamBus>,
    service: SegmentBuildService,
    status: StatusWriter<dyn KvStore>,
    config: SegmentWorkerConfig,
}

#[derive(Debug, Clone)]
pub struct SegmentWorkerConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub batch: usize,
    pub block_ms: u64,
    pub claim_idle_ms: u64,
}

impl SegmentWorkerConfig {
    pub fn new(consumer: String) -> Self {
        Self {
            stream: SEGMENT_STREAM.to_string(),
            group: SEGMENT_GROUP.to_string(),
            consumer,
            batch: 10,
            block_ms: 5_000,
            claim_idle_ms: 60_000,
        }
    }
}

impl SegmentOrchestrator {
    pub fn new(
        bus: Arc<dyn StreamBus>,
        kv: Arc<dyn KvStore>,
        service: SegmentBuildService,
        config: SegmentWorkerConfig,
    ) -> Self {
        Self {
            bus,
            service,
            status: StatusWriter::new(kv, Duration::from_secs(5)),
            config,
        }
    }

    /// Queues a build; the consuming worker does the heavy lifting.
    pub async fn enqueue_build(
        &self,
        tenant: TenantId,
        segment: SegmentId,
        materialize: bool,
    ) -> Result<String, Error> {
        let job = BuildJob {
            tenant_id: tenant,
            segment_id: segment,
            materialize,
            enqueued_at: Utc::now(),
        };
        self.bus
            .append(&self.config.stream, &job.encode()?)
            .await
            .map_err(|e| Error::Internal(e.to_string()))
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
                error!("segment worker could not prepare stream group: {err}");
                return;
            }
            info!(consumer = %self.config.consumer, "segment worker started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("shutting down segment worker");
                        return;
                    }
                    result = self.run_once() => {
                        if let Err(err) = result {
                            error!("segment pass failed: {err}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        })
    }

    async fn process_entry(&self, entry: Entry) {
        let Some(job) = BuildJob::decode(&entry) else {
            warn!(entry = %entry.id, "dropping undecodable build job");
            self.ack(&entry.id).await;
            return;
        };

        let key = segment_status_key(job.tenant_id, job.segment_id);
        self.status
            .heartbeat(&key, json!({"status": "building"}))
            .await
            .ok();

        match self
            .service
            .build_segment(job.tenant_id, job.segment_id, job.materialize)
            .await
        {
            Ok(outcome) => {
                self.status
                    .set(
                        &key,
                        json!({
                            "status": "ok",
                            "matches": outcome.matches,
                            "added": outcome.added,
                            "removed": outcome.removed,
                            "kept": outcome.kept,
                            "builtAt": outcome
                                .built_at
                                .to_rfc3339_opts(SecondsFormat::Secs, true),
                        }),
                    )
                    .await
                    .ok();
            }
            Err(err) => {
                warn!(segment = %job.segment_id, "segment build failed: {err}");
                self.status
                    .set(&key, json!({"status": "error", "message": err.to_string()}))
                    .await
                    .ok();
            }
        }

        self.ack(&entry.id).await;
    }

    async fn ack(&self, id: &str) {
        if let Err(err) = self.bus.ack(&self.config.stream, &self.config.group, id).await {
            error!(entry = id, "could not ack build entry: {err}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::models::Segment;
    use crate::store::MemoryStore;

    fn contact(id: i64, email: &str, status: &str) -> Contact {
        Contact {
            id: id.into(),
            tenant_id: 1.into(),
            email: email.to_string(),
            status: status.to_string(),
            gdpr_consent_at: Some(Utc::now()),
            bounced_at: None,
            unsubscribed_at: None,
        }
    }

    fn seed(store: &MemoryStore, definition: serde_json::Value) {
        store.insert_segment(Segment {
            id: 5.into(),
            tenant_id: 1.into(),
            definition,
            materialized_count: 0,
            last_built_at: None,
        });
        // 4 contacts: only #1 is in list 7, not in list 9, subscribed, valid
        store.insert_contact(contact(1, "one@x.tld", "subscribed"));
        store.insert_contact(contact(2, "two@x.tld", "subscribed"));
        store.insert_contact(contact(3, "", "subscribed"));
        store.insert_contact(contact(4, "four@x.tld", "unsubscribed"));
        store.add_to_list(7.into(), 1.into());
        store.add_to_list(7.into(), 4.into());
        store.add_to_list(9.into(), 2.into());
    }

    #[tokio::test]
    async fn list_and_status_conditions_are_anded() {
        let store = Arc::new(MemoryStore::new());
        seed(
            &store,
            json!({"status": "subscribed", "in_list_ids": [7], "not_in_list_ids": [9]}),
        );
        let service = SegmentBuildService::new(store.clone());

        let outcome = service.build_segment(1.into(), 5.into(), true).await.unwrap();
        assert_eq!(outcome.matches, 1);
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.removed, 0);

        // second build over unchanged inputs keeps the single member
        let outcome = service.build_segment(1.into(), 5.into(), true).await.unwrap();
        assert_eq!(outcome.matches, 1);
        assert_eq!(outcome.added, 0);
        assert_eq!(outcome.removed, 0);
        assert_eq!(outcome.kept, 1);

        let members = store.members(5.into()).await.unwrap();
        assert_eq!(members.len(), 1);
        assert!(members.contains(&1.into()));
    }

    #[tokio::test]
    async fn materialization_diffs_add_and_remove() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, json!({"status": "subscribed"}));
        let service = SegmentBuildService::new(store.clone());

        // contacts 1 and 2 match (valid email + subscribed)
        let outcome = service.build_segment(1.into(), 5.into(), true).await.unwrap();
        assert_eq!(outcome.matches, 2);
        assert_eq!(outcome.added, 2);

        // flip contact 2 out of the segment
        store.insert_contact(Contact {
            unsubscribed_at: Some(Utc::now()),
            ..contact(2, "two@x.tld", "subscribed")
        });
        let outcome = service.build_segment(1.into(), 5.into(), true).await.unwrap();
        assert_eq!(outcome.matches, 1);
        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.kept, 1);

        let segment = store.segment(5.into()).await.unwrap().unwrap();
        assert_eq!(segment.materialized_count, 1);
        assert!(segment.last_built_at.is_some());
    }

    #[tokio::test]
    async fn cross_tenant_builds_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, json!({}));
        let service = SegmentBuildService::new(store.clone());

        let err = service.build_segment(2.into(), 5.into(), true).await.unwrap_err();
        assert_eq!(err.kind(), "cross_tenant");
    }

    #[tokio::test]
    async fn email_contains_and_gdpr_filters() {
        let definition = SegmentDefinition::parse(&json!({
            "email_contains": "ONE@",
            "gdpr_consent": true,
        }));
        let memberships = HashMap::new();
        assert!(definition.matches(&contact(1, "one@x.tld", "any"), &memberships));
        assert!(!definition.matches(&contact(2, "two@x.tld", "any"), &memberships));

        let mut without_consent = contact(1, "one@x.tld", "any");
        without_consent.gdpr_consent_at = None;
        assert!(!definition.matches(&without_consent, &memberships));
    }

    #[tokio::test]
    async fn orchestrated_build_reports_status_over_kv() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        seed(
            &store,
            json!({"status": "subscribed", "in_list_ids": [7], "not_in_list_ids": [9]}),
        );

        let orchestrator = SegmentOrchestrator::new(
            bus.clone(),
            bus.clone(),
            SegmentBuildService::new(store.clone()),
            SegmentWorkerConfig::new("seg-test-1".to_string()),
        );
        bus.ensure_group(SEGMENT_STREAM, SEGMENT_GROUP, "0")
            .await
            .unwrap();

        orchestrator
            .enqueue_build(1.into(), 5.into(), true)
            .await
            .unwrap();
        assert_eq!(orchestrator.run_once().await.unwrap(), 1);

        let raw = bus.get(&segment_status_key(1, 5)).await.unwrap().unwrap();
        let status: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(status["status"], "ok");
        assert_eq!(status["matches"], 1);
        assert_eq!(status["added"], 1);
        assert!(status["updatedAt"].is_string());

        // failure path: unknown segment
        orchestrator
            .enqueue_build(1.into(), 404.into(), true)
            .await
            .unwrap();
        orchestrator.run_once().await.unwrap();
        let raw = bus.get(&segment_status_key(1, 404)).await.unwrap().unwrap();
        let status: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(status["status"], "error");
    }
}
