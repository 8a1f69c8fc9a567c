//! Redis streams backend: XADD/XREADGROUP/XACK/XPENDING/XCLAIM/XGROUP plus
//! SETEX/GET for the status channel.

use super::{BusError, Entry, EntryId, KvStore, PendingEntry, StreamBus};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamReadReply};
use std::sync::Arc;

#[derive(Clone)]
pub struct RedisBus {
    client: Arc<redis::Client>,
}

impl RedisBus {
    pub fn new(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(BusError::from)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    pub fn new_from_env_var() -> Result<Self, BusError> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        Self::new(&url)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BusError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn convert(id: StreamId) -> Entry {
        let mut fields: Vec<(String, String)> = id
            .map
            .into_iter()
            .filter_map(|(key, value)| {
                redis::from_redis_value::<String>(&value)
                    .ok()
                    .map(|v| (key, v))
            })
            .collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        Entry { id: id.id, fields }
    }
}

#[async_trait]
impl StreamBus for RedisBus {
    async fn append(&self, stream: &str, fields: &[(&str, String)]) -> Result<EntryId, BusError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (key, value) in fields {
            cmd.arg(*key).arg(value);
        }
        Ok(cmd.query_async(&mut conn).await?)
    }

    async fn ensure_group(&self, stream: &str, group: &str, start: &str) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        let created: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => {
                // group exists: resetting the cursor is allowed
                let _: String = redis::cmd("XGROUP")
                    .arg("SETID")
                    .arg(stream)
                    .arg(group)
                    .arg(start)
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<Entry>, BusError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count);
        if block_ms > 0 {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS").arg(stream).arg(cursor);

        let reply: Option<StreamReadReply> = cmd.query_async(&mut conn).await?;
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        Ok(reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(Self::convert)
            .collect())
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        let _: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        limit: usize,
    ) -> Result<Vec<PendingEntry>, BusError> {
        let mut conn = self.connection().await?;
        // extended XPENDING reply: [id, consumer, idle-ms, delivery-count]
        let rows: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, consumer, idle_ms, deliveries)| PendingEntry {
                id,
                consumer,
                idle_ms,
                deliveries,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[EntryId],
    ) -> Result<Vec<Entry>, BusError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms);
        for id in ids {
            cmd.arg(id);
        }
        let reply: StreamClaimReply = cmd.query_async(&mut conn).await?;
        Ok(reply.ids.into_iter().map(Self::convert).collect())
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<Entry>, BusError> {
        let idle: Vec<EntryId> = self
            .pending(stream, group, count)
            .await?
            .into_iter()
            .filter(|p| p.idle_ms >= min_idle_ms)
            .map(|p| p.id)
            .collect();

        self.claim(stream, group, consumer, min_idle_ms, &idle).await
    }
}

#[async_trait]
impl KvStore for RedisBus {
    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        let mut conn = self.connection().await?;
        Ok(redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await?)
    }
}
