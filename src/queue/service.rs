//! Distributed queue facade.
//!
//! Routes `send / get_next / ack / nack` to the right place: the local
//! storage path, the queue actor for the local region, or a peer region via
//! the transport. Owns the actor registry, so within one process there is
//! exactly one actor per queue.

use crate::appconfig::AppConfig;
use crate::error::{AppError, AppResult};
use crate::model::{
    shard_for, MessageBody, MessageDescriptor, Queue, QueueMessage, Shard, ShardKind,
};
use crate::queue::actor::{self, QueueActorHandle, QueueCommand};
use crate::queue::metrics::QueueMetrics;
use crate::region::transport::{ForwardedSend, RegionTransport};
use crate::store::QueueStore;
use crate::timeuuid::{self, TimeUuid};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

pub struct QueueService {
    cfg: AppConfig,
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn RegionTransport>,
    metrics: QueueMetrics,
    actors: RwLock<HashMap<String, QueueActorHandle>>,
}

impl QueueService {
    pub fn new(
        cfg: AppConfig,
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn RegionTransport>,
        metrics: QueueMetrics,
    ) -> Self {
        Self {
            cfg,
            store,
            transport,
            metrics,
            actors: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_region(&self) -> &str {
        &self.cfg.node.local_region
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    /// A queue record homed in this region, carrying the configured delivery
    /// defaults.
    pub fn local_queue(&self, name: impl Into<String>) -> Queue {
        self.cfg.queue_with_defaults(name)
    }

    /// Re-spawn actors for every queue already persisted and served here.
    /// Called once at startup.
    pub async fn start(&self) -> AppResult<()> {
        let queues = self.store.list_queues().await?;
        for queue in queues {
            if !queue.served_in(self.local_region()) {
                continue;
            }
            if let Err(e) = self.ensure_actor(&queue.name).await {
                warn!(queue = %queue.name, error = %e, "failed to restore queue actor");
            }
        }
        Ok(())
    }

    /// Stop every actor. The store handle stays usable for late readers.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, QueueActorHandle)> =
            self.actors.write().await.drain().collect();
        for (name, handle) in handles {
            info!(queue = %name, "stopping queue actor");
            handle.shutdown().await;
        }
    }

    // ------------------------------------------------------------
    // Admin
    // ------------------------------------------------------------

    /// Create the queue record, its shard-0 pair for the local region, and
    /// its actor.
    pub async fn create_queue(&self, queue: Queue) -> AppResult<()> {
        if queue.name.trim().is_empty() {
            return Err(AppError::InvalidConfig("queue name must not be empty".into()));
        }
        self.store.put_queue(&queue).await?;
        self.ensure_region_shards(&queue.name).await?;
        self.ensure_actor(&queue.name).await?;
        info!(
            queue = %queue.name,
            origin = %queue.origin_region,
            lease_seconds = queue.lease_seconds,
            "created queue"
        );
        Ok(())
    }

    /// Stop the actor and cascade-delete everything the queue owns.
    pub async fn delete_queue(&self, name: &str) -> AppResult<()> {
        if let Some(handle) = self.actors.write().await.remove(name) {
            handle.shutdown().await;
        }
        self.store.delete_queue(name).await?;
        info!(queue = %name, "deleted queue");
        Ok(())
    }

    // ------------------------------------------------------------
    // Producer path
    // ------------------------------------------------------------

    /// Store a payload and enqueue it for `dest_region`. Returns the payload
    /// id, stable across redeliveries.
    pub async fn send_message(
        &self,
        queue: &str,
        dest_region: &str,
        blob: impl Into<Bytes>,
        content_type: impl Into<String>,
        delay_ms: Option<u64>,
        expiration_ms: Option<u64>,
    ) -> AppResult<Uuid> {
        let message_id = Uuid::new_v4();
        let body = MessageBody::new(message_id, blob, content_type);
        self.send_message_to_region(
            queue,
            self.local_region(),
            dest_region,
            message_id,
            Some(body),
            delay_ms,
            expiration_ms,
        )
        .await?;
        Ok(message_id)
    }

    /// Route one send: write locally when `dest_region` is ours, otherwise
    /// hand it to the transport. The body (when given) is written before the
    /// index row so a consumer can always resolve a descriptor it was handed.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_message_to_region(
        &self,
        queue: &str,
        source_region: &str,
        dest_region: &str,
        message_id: Uuid,
        body: Option<MessageBody>,
        delay_ms: Option<u64>,
        expiration_ms: Option<u64>,
    ) -> AppResult<()> {
        let record = self
            .store
            .get_queue(queue)
            .await?
            .ok_or_else(|| AppError::QueueNotFound(queue.to_string()))?;

        if dest_region != self.local_region() {
            self.transport
                .forward_send(ForwardedSend {
                    queue: queue.to_string(),
                    source_region: source_region.to_string(),
                    dest_region: dest_region.to_string(),
                    message_id,
                    body: body.as_ref().map(|b| b.blob.to_vec()),
                    content_type: body.map(|b| b.content_type),
                    delay_ms,
                    expiration_ms,
                })
                .await?;
            self.metrics.inc_forwarded(dest_region);
            return Ok(());
        }

        if let Some(body) = body {
            self.store.put_body(&body).await?;
        }

        let now = timeuuid::now_ms();
        let delay = delay_ms.unwrap_or(record.default_delay_ms);
        let id = TimeUuid::at_unix_ms(now + delay);

        self.ensure_region_shards(queue).await?;
        let shards = self
            .store
            .list_shards(queue, self.local_region(), ShardKind::Default)
            .await?;
        let target = shard_for(&shards, id).ok_or_else(|| AppError::NoShard {
            queue: queue.to_string(),
            region: self.local_region().to_string(),
        })?;

        let row = QueueMessage {
            queue: queue.to_string(),
            region: self.local_region().to_string(),
            shard_id: target.shard_id,
            queue_message_id: id,
            message_id,
            queued_at_ms: now,
            inflight_at_ms: None,
            n_returned: 0,
            expires_at_ms: expiration_ms.map(|ms| now + ms),
        };
        self.store.put_available(&row).await?;
        self.store
            .add_to_counter(
                queue,
                self.local_region(),
                ShardKind::Default,
                target.shard_id,
                1,
            )
            .await?;
        self.metrics.inc_sent();
        Ok(())
    }

    /// Peer-side entry for a forwarded send: replay it as a local write.
    pub async fn accept_forwarded(&self, fwd: ForwardedSend) -> AppResult<()> {
        if fwd.dest_region != self.local_region() {
            return Err(AppError::NoRoute(fwd.dest_region));
        }
        let ForwardedSend {
            queue,
            source_region,
            dest_region,
            message_id,
            body,
            content_type,
            delay_ms,
            expiration_ms,
        } = fwd;
        let body = body.map(|blob| {
            MessageBody::new(
                message_id,
                blob,
                content_type.unwrap_or_else(|| "application/octet-stream".to_string()),
            )
        });
        self.send_message_to_region(
            &queue,
            &source_region,
            &dest_region,
            message_id,
            body,
            delay_ms,
            expiration_ms,
        )
        .await
    }

    // ------------------------------------------------------------
    // Consumer path
    // ------------------------------------------------------------

    /// Up to `n` descriptors from the local queue actor, bounded by the
    /// configured soft deadline.
    pub async fn get_next_messages(
        &self,
        queue: &str,
        n: usize,
    ) -> AppResult<Vec<MessageDescriptor>> {
        self.get_next_with_deadline(
            queue,
            n,
            Duration::from_millis(self.cfg.delivery.get_next_deadline_ms),
        )
        .await
    }

    /// Like `get_next_messages` with a caller-supplied deadline; an expired
    /// deadline yields whatever could be gathered in time — usually nothing.
    pub async fn get_next_with_deadline(
        &self,
        queue: &str,
        n: usize,
        deadline: Duration,
    ) -> AppResult<Vec<MessageDescriptor>> {
        let tx = self.ensure_actor(queue).await?;
        let (reply, rx) = oneshot::channel();
        if tx.send(QueueCommand::GetNext { n, reply }).await.is_err() {
            return Ok(Vec::new());
        }
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(batch)) => Ok(batch),
            _ => Ok(Vec::new()),
        }
    }

    /// Fetch a payload by its stable id.
    pub async fn load_message_data(&self, message_id: Uuid) -> AppResult<MessageBody> {
        self.store
            .get_body(message_id)
            .await?
            .ok_or(AppError::BodyNotFound(message_id))
    }

    /// Acknowledge one delivery attempt. Unknown ids are a no-op.
    pub async fn ack_message(&self, queue: &str, id: TimeUuid) -> AppResult<()> {
        let tx = self.ensure_actor(queue).await?;
        let (reply, rx) = oneshot::channel();
        tx.send(QueueCommand::Ack { id, reply })
            .await
            .map_err(|_| AppError::Shutdown)?;
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_benign() => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AppError::Shutdown),
        }
    }

    /// Return one delivery attempt immediately (counts against the
    /// redelivery cap). Unknown ids are a no-op.
    pub async fn nack_message(&self, queue: &str, id: TimeUuid) -> AppResult<()> {
        let tx = self.ensure_actor(queue).await?;
        let (reply, rx) = oneshot::channel();
        tx.send(QueueCommand::Nack { id, reply })
            .await
            .map_err(|_| AppError::Shutdown)?;
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_benign() => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AppError::Shutdown),
        }
    }

    // ------------------------------------------------------------
    // Operator / test hooks
    // ------------------------------------------------------------

    /// Force a buffer refresh on every local actor and wait for each to
    /// finish.
    pub async fn refresh(&self) -> AppResult<()> {
        let senders: Vec<mpsc::Sender<QueueCommand>> = {
            let actors = self.actors.read().await;
            actors.values().map(|h| h.sender()).collect()
        };
        for tx in senders {
            let (done, done_rx) = oneshot::channel();
            if tx
                .send(QueueCommand::Refresh { done: Some(done) })
                .await
                .is_ok()
            {
                let _ = done_rx.await;
            }
        }
        Ok(())
    }

    /// Descriptors currently buffered in memory for one queue.
    pub async fn buffered_len(&self, queue: &str) -> AppResult<usize> {
        let tx = self.ensure_actor(queue).await?;
        let (reply, rx) = oneshot::channel();
        tx.send(QueueCommand::BufferLen { reply })
            .await
            .map_err(|_| AppError::Shutdown)?;
        rx.await.map_err(|_| AppError::Shutdown)
    }

    /// Estimate of rows alive for this queue in the local region, derived
    /// from the shard counters of both kinds.
    pub async fn queue_depth(&self, queue: &str) -> AppResult<i64> {
        let mut depth = 0i64;
        for kind in ShardKind::BOTH {
            let shards = self
                .store
                .list_shards(queue, self.local_region(), kind)
                .await?;
            for shard in shards {
                let counter = self
                    .store
                    .get_counter(queue, self.local_region(), kind, shard.shard_id)
                    .await?
                    .unwrap_or(0);
                depth += counter.max(0);
            }
        }
        Ok(depth)
    }

    // ------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------

    /// Shard 0 of both kinds for the local region; lazily created the first
    /// time this region sees the queue (e.g. on a forwarded send).
    async fn ensure_region_shards(&self, queue: &str) -> AppResult<()> {
        for kind in ShardKind::BOTH {
            let existing = self
                .store
                .list_shards(queue, self.local_region(), kind)
                .await?;
            if existing.is_empty() {
                match self
                    .store
                    .put_shard(&Shard::zero(queue, self.local_region(), kind))
                    .await
                {
                    Ok(()) => {
                        self.store
                            .add_to_counter(queue, self.local_region(), kind, 0, 0)
                            .await?;
                    }
                    // Another writer seeded it first.
                    Err(AppError::ShardExists { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Get-or-spawn the actor for (queue, local region).
    async fn ensure_actor(&self, queue: &str) -> AppResult<mpsc::Sender<QueueCommand>> {
        if let Some(handle) = self.actors.read().await.get(queue) {
            return Ok(handle.sender());
        }

        let record = self
            .store
            .get_queue(queue)
            .await?
            .ok_or_else(|| AppError::QueueNotFound(queue.to_string()))?;

        let mut actors = self.actors.write().await;
        if let Some(handle) = actors.get(queue) {
            return Ok(handle.sender());
        }

        self.ensure_region_shards(queue).await?;
        let handle = actor::spawn(
            record,
            self.local_region().to_string(),
            self.store.clone(),
            self.cfg.delivery.clone(),
            self.cfg.shards.clone(),
            self.metrics.clone(),
        );
        let tx = handle.sender();
        actors.insert(queue.to_string(), handle);
        Ok(tx)
    }
}
