//! In-process store backend.
//!
//! Default backend for tests and single-process deployments. Rows live in
//! BTreeMaps keyed by `TimeUuid`, so range reads come back in the same
//! time order the wide-column backend clusters by. All critical sections
//! are synchronous and short; no lock is held across an await.

use crate::error::{AppError, AppResult};
use crate::model::{MessageBody, Queue, QueueMessage, Shard, ShardKind};
use crate::store::traits::QueueStore;
use crate::timeuuid::TimeUuid;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use uuid::Uuid;

type ShardKey = (String, String, ShardKind);
type CounterKey = (String, String, ShardKind, u32);
type RowKey = (String, String, u32);

#[derive(Default)]
struct MemoryInner {
    queues: HashMap<String, Queue>,
    /// (queue, region, kind) -> shards by id; pivots increase with the id.
    shards: HashMap<ShardKey, BTreeMap<u32, Shard>>,
    counters: HashMap<CounterKey, i64>,
    available: HashMap<RowKey, BTreeMap<TimeUuid, QueueMessage>>,
    inflight: HashMap<RowKey, BTreeMap<TimeUuid, QueueMessage>>,
    bodies: HashMap<Uuid, MessageBody>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryInner> {
        self.inner.read().expect("memory store lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryInner> {
        self.inner.write().expect("memory store lock poisoned")
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn put_queue(&self, queue: &Queue) -> AppResult<()> {
        let mut inner = self.write();
        if inner.queues.contains_key(&queue.name) {
            return Err(AppError::QueueAlreadyExists(queue.name.clone()));
        }
        inner.queues.insert(queue.name.clone(), queue.clone());
        Ok(())
    }

    async fn get_queue(&self, name: &str) -> AppResult<Option<Queue>> {
        Ok(self.read().queues.get(name).cloned())
    }

    async fn list_queues(&self) -> AppResult<Vec<Queue>> {
        let mut queues: Vec<Queue> = self.read().queues.values().cloned().collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(queues)
    }

    async fn delete_queue(&self, name: &str) -> AppResult<()> {
        let mut guard = self.write();
        let inner = &mut *guard;
        inner.queues.remove(name);
        inner.shards.retain(|(q, _, _), _| q.as_str() != name);
        inner.counters.retain(|(q, _, _, _), _| q.as_str() != name);

        let mut orphaned: Vec<Uuid> = Vec::new();
        for table in [&mut inner.available, &mut inner.inflight] {
            table.retain(|(q, _, _), rows| {
                if q.as_str() == name {
                    orphaned.extend(rows.values().map(|r| r.message_id));
                    false
                } else {
                    true
                }
            });
        }
        for id in orphaned {
            inner.bodies.remove(&id);
        }
        Ok(())
    }

    async fn put_shard(&self, shard: &Shard) -> AppResult<()> {
        let mut inner = self.write();
        let key = (shard.queue.clone(), shard.region.clone(), shard.kind);
        let shards = inner.shards.entry(key).or_default();
        if shards.contains_key(&shard.shard_id) {
            return Err(AppError::ShardExists {
                queue: shard.queue.clone(),
                shard_id: shard.shard_id,
            });
        }
        shards.insert(shard.shard_id, shard.clone());
        Ok(())
    }

    async fn list_shards(
        &self,
        queue: &str,
        region: &str,
        kind: ShardKind,
    ) -> AppResult<Vec<Shard>> {
        Ok(self
            .read()
            .shards
            .get(&(queue.to_string(), region.to_string(), kind))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_to_counter(
        &self,
        queue: &str,
        region: &str,
        kind: ShardKind,
        shard_id: u32,
        delta: i64,
    ) -> AppResult<()> {
        let mut inner = self.write();
        let key = (queue.to_string(), region.to_string(), kind, shard_id);
        *inner.counters.entry(key).or_insert(0) += delta;
        Ok(())
    }

    async fn get_counter(
        &self,
        queue: &str,
        region: &str,
        kind: ShardKind,
        shard_id: u32,
    ) -> AppResult<Option<i64>> {
        Ok(self
            .read()
            .counters
            .get(&(queue.to_string(), region.to_string(), kind, shard_id))
            .copied())
    }

    async fn put_available(&self, row: &QueueMessage) -> AppResult<()> {
        let mut inner = self.write();
        let key = (row.queue.clone(), row.region.clone(), row.shard_id);
        inner
            .available
            .entry(key)
            .or_default()
            .insert(row.queue_message_id, row.clone());
        Ok(())
    }

    async fn read_available(
        &self,
        queue: &str,
        region: &str,
        shard_id: u32,
        up_to_ms: u64,
        limit: usize,
    ) -> AppResult<Vec<QueueMessage>> {
        let inner = self.read();
        let Some(rows) = inner
            .available
            .get(&(queue.to_string(), region.to_string(), shard_id))
        else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .filter(|r| r.queue_message_id.unix_ms() <= up_to_ms)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_available(
        &self,
        queue: &str,
        region: &str,
        shard_id: u32,
        id: TimeUuid,
    ) -> AppResult<bool> {
        let mut inner = self.write();
        Ok(inner
            .available
            .get_mut(&(queue.to_string(), region.to_string(), shard_id))
            .and_then(|rows| rows.remove(&id))
            .is_some())
    }

    async fn put_inflight(&self, row: &QueueMessage) -> AppResult<()> {
        let mut inner = self.write();
        let key = (row.queue.clone(), row.region.clone(), row.shard_id);
        inner
            .inflight
            .entry(key)
            .or_default()
            .insert(row.queue_message_id, row.clone());
        Ok(())
    }

    async fn get_inflight(
        &self,
        queue: &str,
        region: &str,
        shard_id: u32,
        id: TimeUuid,
    ) -> AppResult<Option<QueueMessage>> {
        Ok(self
            .read()
            .inflight
            .get(&(queue.to_string(), region.to_string(), shard_id))
            .and_then(|rows| rows.get(&id))
            .cloned())
    }

    async fn read_expired_inflight(
        &self,
        queue: &str,
        region: &str,
        shard_id: u32,
        cutoff_ms: u64,
        limit: usize,
    ) -> AppResult<Vec<QueueMessage>> {
        let inner = self.read();
        let Some(rows) = inner
            .inflight
            .get(&(queue.to_string(), region.to_string(), shard_id))
        else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .filter(|r| matches!(r.inflight_at_ms, Some(at) if at < cutoff_ms))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_inflight(
        &self,
        queue: &str,
        region: &str,
        shard_id: u32,
        id: TimeUuid,
    ) -> AppResult<bool> {
        let mut inner = self.write();
        Ok(inner
            .inflight
            .get_mut(&(queue.to_string(), region.to_string(), shard_id))
            .and_then(|rows| rows.remove(&id))
            .is_some())
    }

    async fn put_body(&self, body: &MessageBody) -> AppResult<()> {
        self.write().bodies.insert(body.message_id, body.clone());
        Ok(())
    }

    async fn get_body(&self, message_id: Uuid) -> AppResult<Option<MessageBody>> {
        Ok(self.read().bodies.get(&message_id).cloned())
    }

    async fn delete_body(&self, message_id: Uuid) -> AppResult<()> {
        self.write().bodies.remove(&message_id);
        Ok(())
    }
}
