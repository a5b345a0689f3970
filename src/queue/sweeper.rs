use crate::error::{AppError, AppResult};
use crate::model::{shard_for, Queue, QueueMessage, Shard, ShardKind};
use crate::queue::metrics::QueueMetrics;
use crate::store::QueueStore;
use crate::timeuuid::{self, TimeUuid};
use std::sync::Arc;
use tracing::{debug, warn};

/// Rows examined per storage read while sweeping one shard.
const SWEEP_PAGE: usize = 100;

/// What happened to one expired (or nacked) inflight row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Row went back to the available table with `n_returned + 1`.
    Redelivered,
    /// Redelivery cap exceeded; row and body dropped.
    DeadLettered,
    /// The row vanished before we could delete it (an ack won the race).
    Skipped,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepOutcome {
    pub redelivered: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
}

/// Moves lease-expired inflight rows back to available, dead-lettering the
/// ones that ran out of redeliveries. Also backs the nack path, which is the
/// same transition applied to a single row without waiting for the lease.
pub struct TimeoutSweeper {
    store: Arc<dyn QueueStore>,
    metrics: QueueMetrics,
}

impl TimeoutSweeper {
    pub fn new(store: Arc<dyn QueueStore>, metrics: QueueMetrics) -> Self {
        Self { store, metrics }
    }

    /// One sweep over every inflight shard of (queue, region).
    pub async fn sweep(&self, queue: &Queue, region: &str) -> AppResult<SweepOutcome> {
        let now = timeuuid::now_ms();
        let cutoff = now.saturating_sub(queue.lease_ms());

        let inflight_shards = self
            .store
            .list_shards(&queue.name, region, ShardKind::Inflight)
            .await?;
        let default_shards = self
            .store
            .list_shards(&queue.name, region, ShardKind::Default)
            .await?;

        let mut outcome = SweepOutcome::default();
        for shard in &inflight_shards {
            loop {
                let expired = self
                    .store
                    .read_expired_inflight(&queue.name, region, shard.shard_id, cutoff, SWEEP_PAGE)
                    .await?;
                let page_len = expired.len();

                for row in expired {
                    match self
                        .requeue(queue, region, &default_shards, shard.shard_id, row, now)
                        .await?
                    {
                        Requeue::Redelivered => outcome.redelivered += 1,
                        Requeue::DeadLettered => outcome.dead_lettered += 1,
                        Requeue::Skipped => outcome.skipped += 1,
                    }
                }

                if page_len < SWEEP_PAGE {
                    break;
                }
            }
        }

        if outcome.redelivered + outcome.dead_lettered > 0 {
            debug!(
                queue = %queue.name,
                region,
                redelivered = outcome.redelivered,
                dead_lettered = outcome.dead_lettered,
                skipped = outcome.skipped,
                "sweep moved expired leases"
            );
        }
        Ok(outcome)
    }

    /// Take one inflight row out of circulation and either re-enqueue it as a
    /// fresh delivery attempt or dead-letter it.
    ///
    /// The inflight row is deleted first; when the delete finds nothing the
    /// row was acked concurrently and no available row is written, so an ack
    /// can never be undone.
    pub async fn requeue(
        &self,
        queue: &Queue,
        region: &str,
        default_shards: &[Shard],
        inflight_shard_id: u32,
        row: QueueMessage,
        now_ms: u64,
    ) -> AppResult<Requeue> {
        let removed = self
            .store
            .delete_inflight(&queue.name, region, inflight_shard_id, row.queue_message_id)
            .await?;
        if !removed {
            return Ok(Requeue::Skipped);
        }
        self.store
            .add_to_counter(&queue.name, region, ShardKind::Inflight, inflight_shard_id, -1)
            .await?;

        if row.n_returned + 1 > queue.max_redeliveries {
            self.store.delete_body(row.message_id).await?;
            self.metrics.inc_dead_letter();
            warn!(
                queue = %queue.name,
                region,
                message_id = %row.message_id,
                n_returned = row.n_returned,
                "message exceeded redelivery cap; dead-lettered"
            );
            return Ok(Requeue::DeadLettered);
        }

        let new_id = TimeUuid::at_unix_ms(now_ms);
        let target = shard_for(default_shards, new_id).ok_or_else(|| AppError::NoShard {
            queue: queue.name.clone(),
            region: region.to_string(),
        })?;

        let requeued = QueueMessage {
            queue: queue.name.clone(),
            region: region.to_string(),
            shard_id: target.shard_id,
            queue_message_id: new_id,
            message_id: row.message_id,
            queued_at_ms: row.queued_at_ms,
            inflight_at_ms: None,
            n_returned: row.n_returned + 1,
            expires_at_ms: row.expires_at_ms,
        };
        self.store.put_available(&requeued).await?;
        self.store
            .add_to_counter(&queue.name, region, ShardKind::Default, target.shard_id, 1)
            .await?;
        self.metrics.inc_redelivered();
        Ok(Requeue::Redelivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn queue() -> Queue {
        let mut q = Queue::new("q", "dc1");
        q.lease_seconds = 10;
        q.max_redeliveries = 2;
        q
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.put_queue(&queue()).await.unwrap();
        for kind in ShardKind::BOTH {
            store
                .put_shard(&Shard::zero("q", "dc1", kind))
                .await
                .unwrap();
        }
        store
    }

    fn inflight_row(inflight_at_ms: u64, n_returned: u32) -> QueueMessage {
        QueueMessage {
            queue: "q".into(),
            region: "dc1".into(),
            shard_id: 0,
            queue_message_id: TimeUuid::at_unix_ms(inflight_at_ms),
            message_id: Uuid::new_v4(),
            queued_at_ms: inflight_at_ms,
            inflight_at_ms: Some(inflight_at_ms),
            n_returned,
            expires_at_ms: None,
        }
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_with_a_fresh_attempt_id() {
        let store = seeded_store().await;
        let now = timeuuid::now_ms();
        let row = inflight_row(now - 60_000, 0);
        store.put_inflight(&row).await.unwrap();
        store
            .add_to_counter("q", "dc1", ShardKind::Inflight, 0, 1)
            .await
            .unwrap();

        let sweeper = TimeoutSweeper::new(store.clone(), QueueMetrics::new().unwrap());
        let outcome = sweeper.sweep(&queue(), "dc1").await.unwrap();
        assert_eq!(outcome.redelivered, 1);

        let available = store.read_available("q", "dc1", 0, now, 10).await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].message_id, row.message_id);
        assert_ne!(available[0].queue_message_id, row.queue_message_id);
        assert_eq!(available[0].n_returned, 1);
        assert!(available[0].inflight_at_ms.is_none());

        // Counters moved symmetrically.
        assert_eq!(
            store
                .get_counter("q", "dc1", ShardKind::Inflight, 0)
                .await
                .unwrap(),
            Some(0)
        );
        assert_eq!(
            store
                .get_counter("q", "dc1", ShardKind::Default, 0)
                .await
                .unwrap(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn unexpired_leases_are_left_alone() {
        let store = seeded_store().await;
        let now = timeuuid::now_ms();
        let row = inflight_row(now, 0);
        store.put_inflight(&row).await.unwrap();

        let sweeper = TimeoutSweeper::new(store.clone(), QueueMetrics::new().unwrap());
        let outcome = sweeper.sweep(&queue(), "dc1").await.unwrap();
        assert_eq!(outcome.redelivered, 0);
        assert!(store
            .get_inflight("q", "dc1", 0, row.queue_message_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn exceeding_the_cap_dead_letters_and_drops_the_body() {
        let store = seeded_store().await;
        let now = timeuuid::now_ms();
        // max_redeliveries = 2, so the third expiry (n_returned already 2) dies.
        let row = inflight_row(now - 60_000, 2);
        store
            .put_body(&crate::model::MessageBody::new(
                row.message_id,
                &b"x"[..],
                "text/plain",
            ))
            .await
            .unwrap();
        store.put_inflight(&row).await.unwrap();

        let sweeper = TimeoutSweeper::new(store.clone(), QueueMetrics::new().unwrap());
        let outcome = sweeper.sweep(&queue(), "dc1").await.unwrap();
        assert_eq!(outcome.dead_lettered, 1);

        assert!(store.read_available("q", "dc1", 0, now, 10).await.unwrap().is_empty());
        assert!(store.get_body(row.message_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn a_row_acked_mid_sweep_is_skipped() {
        let store = seeded_store().await;
        let now = timeuuid::now_ms();
        let row = inflight_row(now - 60_000, 0);
        // Never stored: mimics the ack deleting it between read and requeue.
        let sweeper = TimeoutSweeper::new(store.clone(), QueueMetrics::new().unwrap());
        let default_shards = store.list_shards("q", "dc1", ShardKind::Default).await.unwrap();
        let res = sweeper
            .requeue(&queue(), "dc1", &default_shards, 0, row, now)
            .await
            .unwrap();
        assert_eq!(res, Requeue::Skipped);
        assert!(store.read_available("q", "dc1", 0, now, 10).await.unwrap().is_empty());
    }
}
