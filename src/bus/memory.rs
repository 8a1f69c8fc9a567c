//! In-memory stream backend with consumer-group semantics: per-group cursor,
//! pending-entries list with idle tracking, claim and ack. Entry ids are
//! monotonic per stream.

use super::{BusError, Entry, EntryId, KvStore, PendingEntry, StreamBus};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Instant;

struct Pel {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Default)]
struct Group {
    cursor: usize,
    pel: BTreeMap<u64, Pel>,
}

#[derive(Default)]
struct Stream {
    next_seq: u64,
    entries: Vec<(u64, Vec<(String, String)>)>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Kv {
    values: HashMap<String, (String, Instant, u64)>,
}

#[derive(Default)]
pub struct MemoryBus {
    streams: Mutex<HashMap<String, Stream>>,
    kv: Mutex<Kv>,
}

fn entry_id(seq: u64) -> EntryId {
    format!("{seq}-0")
}

fn parse_seq(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stream contents, oldest first. Test helper.
    pub fn entries(&self, stream: &str) -> Vec<Entry> {
        let streams = self.streams.lock().unwrap();
        streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(seq, fields)| Entry {
                        id: entry_id(*seq),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ages every pending entry of the group, so claim thresholds can be
    /// crossed without sleeping in tests.
    pub fn age_pending(&self, stream: &str, group: &str, by_ms: u64) {
        let mut streams = self.streams.lock().unwrap();
        if let Some(group) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) {
            for pel in group.pel.values_mut() {
                pel.delivered_at = pel
                    .delivered_at
                    .checked_sub(std::time::Duration::from_millis(by_ms))
                    .unwrap_or(pel.delivered_at);
            }
        }
    }
}

#[async_trait]
impl StreamBus for MemoryBus {
    async fn append(&self, stream: &str, fields: &[(&str, String)]) -> Result<EntryId, BusError> {
        let mut streams = self.streams.lock().unwrap();
        let stream = streams.entry(stream.to_string()).or_default();
        stream.next_seq += 1;
        let seq = stream.next_seq;
        stream.entries.push((
            seq,
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        ));
        Ok(entry_id(seq))
    }

    async fn ensure_group(&self, stream: &str, group: &str, start: &str) -> Result<(), BusError> {
        let mut streams = self.streams.lock().unwrap();
        let stream = streams.entry(stream.to_string()).or_default();
        let cursor = match start {
            "$" => stream.entries.len(),
            "0" | "0-0" => 0,
            other => {
                let seq = parse_seq(other)
                    .ok_or_else(|| BusError::Command(format!("invalid start id {other}")))?;
                stream.entries.iter().position(|(s, _)| *s > seq).unwrap_or(stream.entries.len())
            }
        };
        stream
            .groups
            .entry(group.to_string())
            .and_modify(|g| g.cursor = cursor)
            .or_insert(Group {
                cursor,
                pel: BTreeMap::new(),
            });
        Ok(())
    }

    async fn read_group(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        cursor: &str,
        count: usize,
        _block_ms: u64,
    ) -> Result<Vec<Entry>, BusError> {
        let mut streams = self.streams.lock().unwrap();
        let stream = streams
            .entry(stream_key.to_string())
            .or_default();
        let Some(state) = stream.groups.get(group).map(|g| g.cursor) else {
            return Err(BusError::Command(format!(
                "no such consumer group {group} for stream {stream_key}"
            )));
        };

        if cursor == ">" {
            let taken: Vec<(u64, Vec<(String, String)>)> = stream
                .entries
                .iter()
                .skip(state)
                .take(count)
                .cloned()
                .collect();
            let group = stream.groups.get_mut(group).unwrap();
            group.cursor = (state + taken.len()).min(stream.entries.len());
            let now = Instant::now();
            let mut out = Vec::with_capacity(taken.len());
            for (seq, fields) in taken {
                group.pel.insert(
                    seq,
                    Pel {
                        consumer: consumer.to_string(),
                        delivered_at: now,
                        deliveries: 1,
                    },
                );
                out.push(Entry {
                    id: entry_id(seq),
                    fields,
                });
            }
            Ok(out)
        } else {
            // drain this consumer's pending list from the given id upward
            let from = parse_seq(cursor).unwrap_or(0);
            let group = stream.groups.get(group).unwrap();
            let seqs: Vec<u64> = group
                .pel
                .iter()
                .filter(|(seq, pel)| **seq >= from && pel.consumer == consumer)
                .take(count)
                .map(|(seq, _)| *seq)
                .collect();
            Ok(seqs
                .into_iter()
                .filter_map(|seq| {
                    stream
                        .entries
                        .iter()
                        .find(|(s, _)| *s == seq)
                        .map(|(s, fields)| Entry {
                            id: entry_id(*s),
                            fields: fields.clone(),
                        })
                })
                .collect())
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BusError> {
        let mut streams = self.streams.lock().unwrap();
        if let Some(group) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) {
            if let Some(seq) = parse_seq(id) {
                group.pel.remove(&seq);
            }
        }
        Ok(())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        limit: usize,
    ) -> Result<Vec<PendingEntry>, BusError> {
        let streams = self.streams.lock().unwrap();
        let Some(group) = streams.get(stream).and_then(|s| s.groups.get(group)) else {
            return Ok(Vec::new());
        };
        Ok(group
            .pel
            .iter()
            .take(limit)
            .map(|(seq, pel)| PendingEntry {
                id: entry_id(*seq),
                consumer: pel.consumer.clone(),
                idle_ms: pel.delivered_at.elapsed().as_millis() as u64,
                deliveries: pel.deliveries,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[EntryId],
    ) -> Result<Vec<Entry>, BusError> {
        let mut streams = self.streams.lock().unwrap();
        let Some(stream) = streams.get_mut(stream_key) else {
            return Ok(Vec::new());
        };
        let Some(group) = stream.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut claimed = Vec::new();
        for id in ids {
            let Some(seq) = parse_seq(id) else { continue };
            let Some(pel) = group.pel.get_mut(&seq) else {
                continue;
            };
            if pel.delivered_at.elapsed().as_millis() as u64 >= min_idle_ms {
                pel.consumer = consumer.to_string();
                pel.delivered_at = Instant::now();
                pel.deliveries += 1;
                if let Some((_, fields)) = stream.entries.iter().find(|(s, _)| *s == seq) {
                    claimed.push(Entry {
                        id: entry_id(seq),
                        fields: fields.clone(),
                    });
                }
            }
        }
        Ok(claimed)
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
impl KvStore for MemoryBus {
    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), BusError> {
        self.kv
            .lock()
            .unwrap()
            .values
            .insert(key.to_string(), (value, Instant::now(), ttl_secs));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        let kv = self.kv.lock().unwrap();
        Ok(kv.values.get(key).and_then(|(value, at, ttl)| {
            (at.elapsed().as_secs() < *ttl).then(|| value.clone())
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fields(payload: &str) -> Vec<(&'static str, String)> {
        vec![("json", payload.to_string())]
    }

    #[tokio::test]
    async fn group_read_ack_cycle() {
        let bus = MemoryBus::new();
        bus.ensure_group("s", "g", "0").await.unwrap();

        let id1 = bus.append("s", &fields("{\"a\":1}")).await.unwrap();
        let _id2 = bus.append("s", &fields("{\"a\":2}")).await.unwrap();

        let batch = bus.read_group("s", "g", "c1", ">", 10, 0).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].field("json"), Some("{\"a\":1}"));

        // nothing new left
        assert!(bus.read_group("s", "g", "c1", ">", 10, 0).await.unwrap().is_empty());

        // both pending until acked
        assert_eq!(bus.pending("s", "g", 10).await.unwrap().len(), 2);
        bus.ack("s", "g", &id1).await.unwrap();
        let pending = bus.pending("s", "g", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, "c1");
    }

    #[tokio::test]
    async fn pending_drain_returns_only_own_entries() {
        let bus = MemoryBus::new();
        bus.ensure_group("s", "g", "0").await.unwrap();
        bus.append("s", &fields("{}")).await.unwrap();
        bus.append("s", &fields("{}")).await.unwrap();

        let first = bus.read_group("s", "g", "c1", ">", 1, 0).await.unwrap();
        let second = bus.read_group("s", "g", "c2", ">", 1, 0).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);

        let drained = bus.read_group("s", "g", "c1", "0", 10, 0).await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id, first[0].id);
    }

    #[tokio::test]
    async fn claim_respects_idle_threshold_and_reassigns() {
        let bus = MemoryBus::new();
        bus.ensure_group("s", "g", "0").await.unwrap();
        bus.append("s", &fields("{}")).await.unwrap();

        let taken = bus.read_group("s", "g", "dead", ">", 10, 0).await.unwrap();
        let id = taken[0].id.clone();

        // not idle long enough
        assert!(bus
            .auto_claim("s", "g", "alive", 60_000, 10)
            .await
            .unwrap()
            .is_empty());

        bus.age_pending("s", "g", 61_000);
        let claimed = bus.auto_claim("s", "g", "alive", 60_000, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);

        let pending = bus.pending("s", "g", 10).await.unwrap();
        assert_eq!(pending[0].consumer, "alive");
        assert_eq!(pending[0].deliveries, 2);
    }

    #[tokio::test]
    async fn ensure_group_is_idempotent_and_resets_cursor() {
        let bus = MemoryBus::new();
        bus.append("s", &fields("{}")).await.unwrap();
        bus.ensure_group("s", "g", "$").await.unwrap();
        assert!(bus.read_group("s", "g", "c", ">", 10, 0).await.unwrap().is_empty());

        // resetting to 0 makes the old entry visible again
        bus.ensure_group("s", "g", "0").await.unwrap();
        assert_eq!(bus.read_group("s", "g", "c", ">", 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn json_field_round_trips_byte_for_byte() {
        let bus = MemoryBus::new();
        bus.ensure_group("s", "g", "0").await.unwrap();
        let payload = "{\"envelope\":{\"to\":[\"a@b.tld\"]},\"retries\":0}";
        bus.append("s", &fields(payload)).await.unwrap();
        let read = bus.read_group("s", "g", "c", ">", 1, 0).await.unwrap();
        assert_eq!(read[0].field("json"), Some(payload));
    }
}
