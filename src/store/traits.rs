use crate::error::AppResult;
use crate::model::{MessageBody, Queue, QueueMessage, Shard, ShardKind};
use crate::timeuuid::TimeUuid;
use async_trait::async_trait;
use uuid::Uuid;

/// The wide-column store behind the queue, expressed as its five logical
/// tables (shards, shard counters, available rows, inflight rows, bodies)
/// plus the queue records themselves.
///
/// Sessions are shared and thread-safe; every mutation here is a single-row
/// operation. Multi-row transitions (available → inflight and back) are
/// composed by the owning actor, which tolerates the crash windows the data
/// model allows.
#[async_trait]
pub trait QueueStore: Send + Sync {
    // --- queue records ---

    /// Insert a queue record; `QueueAlreadyExists` when the name is taken.
    async fn put_queue(&self, queue: &Queue) -> AppResult<()>;
    async fn get_queue(&self, name: &str) -> AppResult<Option<Queue>>;
    async fn list_queues(&self) -> AppResult<Vec<Queue>>;
    /// Remove the queue and everything under it: shards, counters, rows and
    /// the bodies those rows point at.
    async fn delete_queue(&self, name: &str) -> AppResult<()>;

    // --- shards ---

    /// Insert a shard; `ShardExists` when (queue, region, kind, id) is taken.
    async fn put_shard(&self, shard: &Shard) -> AppResult<()>;
    /// Shards ascending by shard id (equivalently, by pivot).
    async fn list_shards(&self, queue: &str, region: &str, kind: ShardKind)
        -> AppResult<Vec<Shard>>;

    // --- shard counters ---

    async fn add_to_counter(
        &self,
        queue: &str,
        region: &str,
        kind: ShardKind,
        shard_id: u32,
        delta: i64,
    ) -> AppResult<()>;
    /// `None` when the counter row was never written.
    async fn get_counter(
        &self,
        queue: &str,
        region: &str,
        kind: ShardKind,
        shard_id: u32,
    ) -> AppResult<Option<i64>>;

    // --- available rows ---

    async fn put_available(&self, row: &QueueMessage) -> AppResult<()>;
    /// Oldest-first rows of one shard whose embedded timestamp is at or
    /// before `up_to_ms` (keeps delayed sends invisible until due).
    async fn read_available(
        &self,
        queue: &str,
        region: &str,
        shard_id: u32,
        up_to_ms: u64,
        limit: usize,
    ) -> AppResult<Vec<QueueMessage>>;
    /// Returns whether a row was actually removed, so transitions can detect
    /// that they lost a race.
    async fn delete_available(
        &self,
        queue: &str,
        region: &str,
        shard_id: u32,
        id: TimeUuid,
    ) -> AppResult<bool>;

    // --- inflight rows ---

    async fn put_inflight(&self, row: &QueueMessage) -> AppResult<()>;
    async fn get_inflight(
        &self,
        queue: &str,
        region: &str,
        shard_id: u32,
        id: TimeUuid,
    ) -> AppResult<Option<QueueMessage>>;
    /// Inflight rows of one shard whose lease lapsed before `cutoff_ms`
    /// (`inflight_at_ms < cutoff_ms`), oldest-first.
    async fn read_expired_inflight(
        &self,
        queue: &str,
        region: &str,
        shard_id: u32,
        cutoff_ms: u64,
        limit: usize,
    ) -> AppResult<Vec<QueueMessage>>;
    async fn delete_inflight(
        &self,
        queue: &str,
        region: &str,
        shard_id: u32,
        id: TimeUuid,
    ) -> AppResult<bool>;

    // --- payload bodies ---

    async fn put_body(&self, body: &MessageBody) -> AppResult<()>;
    async fn get_body(&self, message_id: Uuid) -> AppResult<Option<MessageBody>>;
    async fn delete_body(&self, message_id: Uuid) -> AppResult<()>;
}
