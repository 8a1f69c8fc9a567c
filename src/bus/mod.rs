//! Stream and key-value ports over the job log. Two backends: Redis streams
//! for production and an in-memory log for development and tests. Both
//! round-trip the `json` payload field byte-for-byte.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

mod memory;
mod redis;

pub use memory::MemoryBus;
pub use redis::RedisBus;

pub const MAIL_STREAM: &str = "mail:outbound";
pub const MAIL_GROUP: &str = "senders";
pub const SEGMENT_STREAM: &str = "seg:builds";
pub const SEGMENT_GROUP: &str = "seg_builders";
pub const WEBHOOK_STREAM: &str = "webhooks:deliveries";
pub const WEBHOOK_GROUP: &str = "dispatchers";

pub const STATUS_TTL_SECS: u64 = 3600;

pub fn dlq_stream(stream: &str) -> String {
    format!("{stream}:dlq")
}

pub fn mail_status_key(tenant: impl std::fmt::Display, message: impl std::fmt::Display) -> String {
    format!("mail:status:{tenant}:{message}")
}

pub fn segment_status_key(
    tenant: impl std::fmt::Display,
    segment: impl std::fmt::Display,
) -> String {
    format!("seg:status:{tenant}:{segment}")
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("stream connection error: {0}")]
    Connection(String),
    #[error("stream command error: {0}")]
    Command(String),
}

impl From<::redis::RedisError> for BusError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            BusError::Connection(err.to_string())
        } else {
            BusError::Command(err.to_string())
        }
    }
}

pub type EntryId = String;

/// One record on a stream: monotonic server-assigned id plus flat fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: EntryId,
    pub fields: Vec<(String, String)>,
}

impl Entry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    pub idle_ms: u64,
    pub deliveries: u64,
}

#[async_trait]
pub trait StreamBus: Send + Sync {
    /// Append an entry; the backend assigns a monotonic id.
    async fn append(&self, stream: &str, fields: &[(&str, String)]) -> Result<EntryId, BusError>;

    /// Idempotent group creation (MKSTREAM). When the group already exists
    /// its cursor may be reset to `start`.
    async fn ensure_group(&self, stream: &str, group: &str, start: &str) -> Result<(), BusError>;

    /// Read with `cursor = ">"` for new entries or `"0"` to drain this
    /// consumer's pending list.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<Entry>, BusError>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BusError>;

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        limit: usize,
    ) -> Result<Vec<PendingEntry>, BusError>;

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[EntryId],
    ) -> Result<Vec<Entry>, BusError>;

    /// Scan the group PEL and take ownership of entries idle for at least
    /// `min_idle_ms`, regardless of their current consumer.
    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<Entry>, BusError>;
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), BusError>;
    async fn get(&self, key: &str) -> Result<Option<String>, BusError>;
}

/// Writes job status payloads with a short TTL, rate-limited per key so
/// heartbeats land at most every `min_interval`.
pub struct StatusWriter<K: ?Sized> {
    kv: std::sync::Arc<K>,
    min_interval: Duration,
    last_write: Mutex<HashMap<String, Instant>>,
}

impl<K: KvStore + ?Sized> StatusWriter<K> {
    pub fn new(kv: std::sync::Arc<K>, min_interval: Duration) -> Self {
        Self {
            kv,
            min_interval,
            last_write: Mutex::new(HashMap::new()),
        }
    }

    fn stamp(mut payload: Value) -> String {
        if let Some(map) = payload.as_object_mut() {
            map.insert(
                "updatedAt".to_string(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }
        payload.to_string()
    }

    /// Unconditional write, used for terminal states.
    pub async fn set(&self, key: &str, payload: Value) -> Result<(), BusError> {
        self.last_write
            .lock()
            .unwrap()
            .insert(key.to_string(), Instant::now());
        self.kv.set_ex(key, Self::stamp(payload), STATUS_TTL_SECS).await
    }

    /// Heartbeat write, dropped when the previous write is too recent.
    pub async fn heartbeat(&self, key: &str, payload: Value) -> Result<(), BusError> {
        {
            let last = self.last_write.lock().unwrap();
            if let Some(at) = last.get(key) {
                if at.elapsed() < self.min_interval {
                    return Ok(());
                }
            }
        }
        self.set(key, payload).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn status_writer_stamps_and_throttles() {
        let bus = Arc::new(MemoryBus::new());
        let writer = StatusWriter::new(bus.clone(), Duration::from_secs(60));

        writer
            .heartbeat("mail:status:1:2", serde_json::json!({"status": "sending"}))
            .await
            .unwrap();
        let stored = bus.get("mail:status:1:2").await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&stored).unwrap();
        assert_eq!(value["status"], "sending");
        assert!(value["updatedAt"].as_str().unwrap().ends_with('Z'));

        // second heartbeat inside the interval is dropped
        writer
            .heartbeat("mail:status:1:2", serde_json::json!({"status": "later"}))
            .await
            .unwrap();
        let stored = bus.get("mail:status:1:2").await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&stored).unwrap();
        assert_eq!(value["status"], "sending");

        // terminal write always lands
        writer
            .set("mail:status:1:2", serde_json::json!({"status": "sent"}))
            .await
            .unwrap();
        let stored = bus.get("mail:status:1:2").await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&stored).unwrap();
        assert_eq!(value["status"], "sent");
    }
}
